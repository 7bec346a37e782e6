//! Multi-detector synchronized raster acquisition engine.
//!
//! Coordinates one scanning emitter with any number of detectors and an
//! optional scan stage to produce spatially-resolved multi-modal datasets:
//! plain SEM rasters, per-pixel spectra, angular-resolved images, temporal
//! spectra and time histograms. The engine plans the scan
//! ([`plan::ScanPlanner`]), clocks it ([`timing`]), drives the emitter
//! concurrently with the detector readers, decimates and assembles the
//! results ([`assemble`]), runs periodic in-scan tasks ([`leech`]) and
//! honors cancellation, retry and live-update contracts
//! ([`engine::AcquisitionEngine`]).

pub mod assemble;
pub mod engine;
pub mod leech;
pub mod plan;
pub mod stream;
pub mod timing;

pub use engine::{AcqOutcome, AcquireFuture, AcquisitionEngine, EngineState, Progress};
pub use leech::{AnchorDriftCorrector, Leech, ProbeCurrentAcquirer};
pub use plan::{ScanPlan, ScanPlanner, ScanSettings};
pub use stream::{RasterStream, StreamKind, StreamSpec, StreamState};
