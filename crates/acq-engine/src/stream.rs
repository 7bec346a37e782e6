//! Acquisition stream model.
//!
//! One [`RasterStream`] describes one multi-detector acquisition: the
//! emitter, the ordered detector list, the scan region and timing, and the
//! leeches riding on the scan. Instead of a subclass hierarchy, each
//! modality is a [`StreamKind`] tag with a small capability table
//! ([`StreamCaps`]); everything the engine needs to branch on is in the
//! table, and options a kind does not recognize are rejected when the
//! stream is built.

use crate::leech::Leech;
use acq_core::data::DataArray;
use acq_core::hw::{Actuator, Detector, DetectorKind, Emitter};
use acq_core::metadata::Tint;
use acq_core::{AcqError, AcqResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Acquisition modality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Scanner + one analog detector, 2-D YX output.
    Sem,
    /// Scanner + point detectors (CL intensity, EBIC, counting).
    SemMd,
    /// Scanner + 1-D-binned camera; a spectrum per pixel.
    SemSpectrum,
    /// Scanner + 2-D camera, optional polarization analyzer.
    SemAr,
    /// Scanner + streak camera; a temporal-spectral image per pixel.
    SemTemporalSpectrum,
    /// Scanner + time correlator; a time histogram per pixel.
    SemTemporal,
}

/// What one secondary detector delivers per pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerPixel {
    Scalar,
    Spectrum,
    Image,
    TimeHistogram,
    TemporalSpectrum,
}

/// Per-kind capability table.
#[derive(Debug, Clone, Copy)]
pub struct StreamCaps {
    /// Exposure-based (camera) vs dwell-based timing.
    pub exposure_based: bool,
    pub per_pixel: PerPixel,
    /// Whether the sub-pixel fuzzing option is recognized.
    pub allows_fuzzing: bool,
    /// Whether a scan stage may replace emitter deflection.
    pub allows_scan_stage: bool,
    /// Whether a polarization analyzer is recognized.
    pub allows_polarization: bool,
}

impl StreamKind {
    pub fn caps(self) -> StreamCaps {
        match self {
            StreamKind::Sem | StreamKind::SemMd => StreamCaps {
                exposure_based: false,
                per_pixel: PerPixel::Scalar,
                allows_fuzzing: false,
                allows_scan_stage: false,
                allows_polarization: false,
            },
            StreamKind::SemSpectrum => StreamCaps {
                exposure_based: true,
                per_pixel: PerPixel::Spectrum,
                allows_fuzzing: true,
                allows_scan_stage: true,
                allows_polarization: false,
            },
            StreamKind::SemAr => StreamCaps {
                exposure_based: true,
                per_pixel: PerPixel::Image,
                allows_fuzzing: false,
                allows_scan_stage: true,
                allows_polarization: true,
            },
            StreamKind::SemTemporalSpectrum => StreamCaps {
                exposure_based: true,
                per_pixel: PerPixel::TemporalSpectrum,
                allows_fuzzing: true,
                allows_scan_stage: true,
                allows_polarization: false,
            },
            StreamKind::SemTemporal => StreamCaps {
                exposure_based: true,
                per_pixel: PerPixel::TimeHistogram,
                allows_fuzzing: true,
                allows_scan_stage: false,
                allows_polarization: false,
            },
        }
    }

    /// Detector kind expected in the secondary slot.
    fn secondary_kind(self) -> Option<&'static [DetectorKind]> {
        match self {
            StreamKind::Sem => None,
            StreamKind::SemMd => Some(&[DetectorKind::Analog, DetectorKind::Counting]),
            StreamKind::SemSpectrum | StreamKind::SemAr => Some(&[DetectorKind::Camera]),
            StreamKind::SemTemporalSpectrum => Some(&[DetectorKind::StreakCamera]),
            StreamKind::SemTemporal => Some(&[DetectorKind::TimeCorrelator]),
        }
    }
}

/// Live state of a stream, observable by the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Active,
    Error(String),
}

/// Everything needed to build a [`RasterStream`].
pub struct StreamSpec {
    pub name: String,
    pub kind: StreamKind,
    pub emitter: Arc<dyn Emitter>,
    /// Ordered; index 0 is the SEM (analog) channel.
    pub detectors: Vec<Arc<dyn Detector>>,
    /// (xmin, ymin, xmax, ymax), normalized to the emitter field.
    pub roi: [f64; 4],
    /// Pixel grid, (W, H).
    pub repetition: (usize, usize),
    pub rotation: f64,
    /// Required for dwell-based kinds.
    pub dwell_time: Option<Duration>,
    /// Required for exposure-based kinds.
    pub integration_time: Option<Duration>,
    pub fuzzing: bool,
    pub scan_stage: Option<Arc<dyn Actuator>>,
    pub leeches: Vec<Box<dyn Leech>>,
    /// Acquire all six analyzer positions (AR only).
    pub acquire_all_pol: bool,
    /// Per-detector display tints, parallel to `detectors`.
    pub tints: Vec<Option<Tint>>,
}

impl StreamSpec {
    pub fn new(
        name: impl Into<String>,
        kind: StreamKind,
        emitter: Arc<dyn Emitter>,
        detectors: Vec<Arc<dyn Detector>>,
    ) -> Self {
        let tints = vec![None; detectors.len()];
        Self {
            name: name.into(),
            kind,
            emitter,
            detectors,
            roi: [0.0, 0.0, 1.0, 1.0],
            repetition: (1, 1),
            rotation: 0.0,
            dwell_time: None,
            integration_time: None,
            fuzzing: false,
            scan_stage: None,
            leeches: Vec::new(),
            acquire_all_pol: false,
            tints,
        }
    }
}

/// A validated acquisition stream, referenced by at most one concurrent
/// `acquire()`.
pub struct RasterStream {
    pub name: String,
    pub kind: StreamKind,
    pub emitter: Arc<dyn Emitter>,
    pub detectors: Vec<Arc<dyn Detector>>,
    pub roi: [f64; 4],
    pub repetition: (usize, usize),
    pub rotation: f64,
    pub dwell_time: Option<Duration>,
    pub integration_time: Option<Duration>,
    pub fuzzing: bool,
    pub scan_stage: Option<Arc<dyn Actuator>>,
    pub leeches: Vec<Box<dyn Leech>>,
    pub acquire_all_pol: bool,
    pub tints: Vec<Option<Tint>>,
    live_tx: watch::Sender<Option<DataArray>>,
    state_tx: watch::Sender<StreamState>,
}

impl RasterStream {
    /// Validate the spec and build the stream. All per-kind option checks
    /// happen here, before any hardware is touched.
    pub fn new(spec: StreamSpec) -> AcqResult<Self> {
        let caps = spec.kind.caps();

        if spec.detectors.is_empty() {
            return Err(AcqError::validation("a stream needs at least one detector"));
        }
        if spec.detectors[0].kind() != DetectorKind::Analog {
            return Err(AcqError::validation(
                "the primary detector must be the analog SEM channel",
            ));
        }
        if let Some(allowed) = spec.kind.secondary_kind() {
            if spec.detectors.len() < 2 {
                return Err(AcqError::validation(
                    "this stream kind needs a secondary detector",
                ));
            }
            for det in &spec.detectors[1..] {
                if !allowed.contains(&det.kind()) {
                    return Err(AcqError::validation(format!(
                        "detector '{}' of kind {:?} is not valid for {:?}",
                        det.name(),
                        det.kind(),
                        spec.kind
                    )));
                }
            }
        } else if spec.detectors.len() != 1 {
            return Err(AcqError::validation("a plain SEM stream has one detector"));
        }

        let (w, h) = spec.repetition;
        if w < 1 || h < 1 {
            return Err(AcqError::validation("repetition must be >= 1 on each axis"));
        }
        if spec.roi.iter().any(|v| !(0.0..=1.0).contains(v))
            || spec.roi[2] < spec.roi[0]
            || spec.roi[3] < spec.roi[1]
        {
            return Err(AcqError::validation("roi must be an ordered box in [0, 1]"));
        }

        if caps.exposure_based {
            if spec.integration_time.is_none() {
                return Err(AcqError::validation(
                    "exposure-based streams need integration_time",
                ));
            }
        } else if spec.dwell_time.is_none() {
            return Err(AcqError::validation("dwell-based streams need dwell_time"));
        }

        if spec.fuzzing && !caps.allows_fuzzing {
            return Err(AcqError::validation(format!(
                "{:?} does not recognize the fuzzing option",
                spec.kind
            )));
        }
        if spec.acquire_all_pol && !caps.allows_polarization {
            return Err(AcqError::validation(format!(
                "{:?} does not recognize the polarization option",
                spec.kind
            )));
        }
        if spec.scan_stage.is_some() {
            if !caps.allows_scan_stage {
                return Err(AcqError::validation(format!(
                    "{:?} does not recognize a scan stage",
                    spec.kind
                )));
            }
            // the stage replaces deflection only for camera acquisitions
            for det in &spec.detectors[1..] {
                if !matches!(det.kind(), DetectorKind::Camera | DetectorKind::StreakCamera) {
                    return Err(AcqError::validation(format!(
                        "scan stage requires camera detectors, got {:?}",
                        det.kind()
                    )));
                }
            }
        }
        if spec.tints.len() != spec.detectors.len() {
            return Err(AcqError::validation(
                "tints must parallel the detector list",
            ));
        }

        let (live_tx, _) = watch::channel(None);
        let (state_tx, _) = watch::channel(StreamState::Idle);
        Ok(Self {
            name: spec.name,
            kind: spec.kind,
            emitter: spec.emitter,
            detectors: spec.detectors,
            roi: spec.roi,
            repetition: spec.repetition,
            rotation: spec.rotation,
            dwell_time: spec.dwell_time,
            integration_time: spec.integration_time,
            fuzzing: spec.fuzzing,
            scan_stage: spec.scan_stage,
            leeches: spec.leeches,
            acquire_all_pol: spec.acquire_all_pol,
            tints: spec.tints,
            live_tx,
            state_tx,
        })
    }

    pub fn caps(&self) -> StreamCaps {
        self.kind.caps()
    }

    /// Time the emitter dwells on one logical pixel.
    pub fn pixel_dwell(&self) -> Duration {
        if self.caps().exposure_based {
            self.integration_time.unwrap_or(Duration::from_millis(1))
        } else {
            self.dwell_time.unwrap_or(Duration::from_micros(1))
        }
    }

    /// Sub-pixel fuzzing factor; 1 when fuzzing is off.
    pub fn fuzz_factor(&self) -> u32 {
        if self.fuzzing {
            2
        } else {
            1
        }
    }

    /// Receiver for the periodically published in-progress image.
    pub fn live_image(&self) -> watch::Receiver<Option<DataArray>> {
        self.live_tx.subscribe()
    }

    pub(crate) fn publish_live(&self, image: DataArray) {
        self.live_tx.send_replace(Some(image));
    }

    /// Receiver for the stream state.
    pub fn state(&self) -> watch::Receiver<StreamState> {
        self.state_tx.subscribe()
    }

    pub(crate) fn set_state(&self, state: StreamState) {
        self.state_tx.send_replace(state);
    }

    /// Scan settings resolved from the stream.
    pub fn scan_settings(&self) -> crate::plan::ScanSettings {
        crate::plan::ScanSettings {
            repetition: self.repetition,
            roi: self.roi,
            rotation: self.rotation,
            dwell: self.pixel_dwell(),
            fuzz: self.fuzz_factor(),
        }
    }
}
