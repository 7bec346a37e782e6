//! Hardware capability traits.
//!
//! Devices implement the narrow capability their hardware actually has:
//! an [`Emitter`] drives the scanned excitation source, a [`Detector`]
//! produces signal per pixel, an [`Actuator`] moves a mechanical axis.
//! The engine is written entirely against these traits; the simulated
//! driver crate provides the test implementations.
//!
//! All methods take `&self`; drivers use interior mutability for state.

use crate::data::{DataArray, DynArray};
use crate::flow::{DataFlow, SyncEvent};
use crate::AcqResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// How the emitter paces its output samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// The emitter free-runs from its internal clock once started.
    SoftwareStart,
    /// Every output sample waits for a hardware trigger edge; the trigger
    /// provides settling, so no margin is needed.
    HardwareTriggerPerSample,
}

/// Detector modality tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorKind {
    Analog,
    Counting,
    Camera,
    StreakCamera,
    TimeCorrelator,
    ZeroDProbe,
}

/// One block of raw data returned by a reader for a tile.
#[derive(Debug, Clone)]
pub enum RawBlock {
    /// Flat sample sequence (analog and counting readers), one entry per
    /// emitter sub-sample.
    Scalars(DynArray),
    /// One full readout per pixel period (cameras), in scan order.
    Frames(Vec<DataArray>),
}

/// Static timing capabilities of an emitter.
#[derive(Debug, Clone, Copy)]
pub struct EmitterTimings {
    /// Shortest supported output sample period.
    pub min_period: Duration,
    /// Longest supported output sample period; beyond this the waveform is
    /// duplicated (DPR) instead.
    pub max_period: Duration,
    /// Period granularity of the output clock.
    pub granularity: Duration,
    /// Beam settle time after a flyback, at full scan width.
    pub settle_time: Duration,
    /// Device output buffer ceiling, in samples.
    pub max_buffer_samples: usize,
}

/// Position waveform, row-major, margin columns included.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    /// (x, y) per output sample, meters from the field center.
    pub xy: Vec<[f64; 2]>,
    /// Number of rows.
    pub rows: usize,
    /// Samples per row (scan width plus margin).
    pub cols: usize,
}

impl Waveform {
    pub fn len(&self) -> usize {
        self.xy.len()
    }

    pub fn is_empty(&self) -> bool {
        self.xy.is_empty()
    }

    /// Copy of rows `[r0, r1)`.
    pub fn slice_rows(&self, r0: usize, r1: usize) -> Waveform {
        let (a, b) = (r0 * self.cols, r1 * self.cols);
        Waveform {
            xy: self.xy[a..b].to_vec(),
            rows: r1 - r0,
            cols: self.cols,
        }
    }

    /// Shift every sample by (dx, dy) meters (drift compensation).
    pub fn translate(&mut self, dx: f64, dy: f64) {
        for s in &mut self.xy {
            s[0] += dx;
            s[1] += dy;
        }
    }

    /// Position of the first output sample.
    pub fn start_position(&self) -> Option<(f64, f64)> {
        self.xy.first().map(|s| (s[0], s[1]))
    }
}

/// Handle on an in-flight waveform output.
#[async_trait]
pub trait WaveformHandle: Send + std::fmt::Debug {
    /// Block until the output completes. After a timeout or cancel the
    /// emitter position is indeterminate until `park_at` is called.
    async fn wait(&mut self, timeout: Duration) -> AcqResult<()>;

    /// Stop the output and flush driver state; idempotent.
    async fn cancel(&mut self);
}

/// The scanning excitation source (e-beam or light scanner).
#[async_trait]
pub trait Emitter: Send + Sync {
    fn name(&self) -> &str;

    /// Maximum raster, (W, H).
    fn shape(&self) -> (usize, usize);

    /// Physical size of the full raster at current magnification, meters.
    fn field_extent(&self) -> (f64, f64);

    /// Well-defined idle position, meters from field center.
    fn resting_position(&self) -> (f64, f64);

    fn timings(&self) -> EmitterTimings;

    /// Arbitrary (x, y) per sample; required for rotated scans.
    fn supports_vector_mode(&self) -> bool;

    /// Per-sample hardware trigger input.
    fn supports_hw_trigger(&self) -> bool {
        false
    }

    /// Fired once per pixel dwell boundary while scanning (not on margin
    /// columns, not while parked).
    fn new_position_event(&self) -> SyncEvent;

    /// Begin a timed output of `waveform` at `period` per sample. The
    /// returned handle outlives the call; the output itself starts on the
    /// trigger condition.
    async fn write_waveform(
        &self,
        waveform: &Waveform,
        period: Duration,
        trigger: TriggerMode,
    ) -> AcqResult<Box<dyn WaveformHandle>>;

    /// Drive the emitter to a fixed idle position, synchronously.
    async fn park_at(&self, pos: (f64, f64)) -> AcqResult<()>;

    /// Assert or release the scan-state TTL outputs. Asserting may include
    /// a programmable delay before returning, to let external hardware
    /// settle. Releasing may be deferred by a programmable grace period so
    /// back-to-back scans do not thrash the lines; `fast` skips the grace
    /// period and releases immediately (aborts, or a scanner configured to
    /// park right after every scan).
    async fn set_scanning_indicator(&self, active: bool, fast: bool) -> AcqResult<()>;
}

/// Any device producing signal in response to the emitter.
#[async_trait]
pub trait Detector: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> DetectorKind;

    /// Data shape; the last element is max-value + 1 (bit depth).
    fn shape(&self) -> Vec<usize>;

    /// Largest raw sample value this detector can produce.
    fn max_value(&self) -> f64 {
        self.shape().last().map_or(0.0, |&m| (m - 1) as f64)
    }

    /// Flow on which this detector publishes during live use.
    fn data(&self) -> &DataFlow;

    fn software_trigger(&self) -> Option<SyncEvent> {
        None
    }

    /// Shortest interval between two samples.
    fn min_read_period(&self) -> Duration;

    /// Longest single exposure (cameras); longer integration is realized
    /// as summed sub-exposures by the engine.
    fn max_exposure(&self) -> Option<Duration> {
        None
    }

    /// Raw values are published as `max_value - v`.
    fn inverted(&self) -> bool {
        false
    }

    /// The hardware needs one extra lead-in clock whose sample must be
    /// discarded (some counting detectors). The engine requests one extra
    /// sample accordingly; never applied silently.
    fn discards_first_sample(&self) -> bool {
        false
    }

    /// Whether this reader can pace on a per-sample hardware trigger.
    fn supports_hw_trigger_per_sample(&self) -> bool {
        false
    }

    /// Detector baseline level, in sample units.
    fn baseline(&self) -> Option<f64> {
        None
    }

    /// Allocate buffers for `sample_count` samples over `expected`.
    async fn prepare(&self, sample_count: usize, expected: Duration) -> AcqResult<()>;

    /// Begin sampling; must be callable concurrently with the emitter
    /// write, and must be running before the emitter produces samples.
    async fn run(&self) -> AcqResult<()>;

    /// Block until the prepared sample count is collected. On timeout the
    /// reader is left in a cancel-required state.
    async fn wait(&self, timeout: Duration) -> AcqResult<RawBlock>;

    /// Stop a running read; idempotent.
    async fn cancel(&self);
}

/// One mechanical axis set (scan stage, aligner).
#[derive(Debug, Clone)]
pub struct AxisDescriptor {
    /// Reachable range, device units.
    pub range: (f64, f64),
    pub unit: String,
}

/// Handle on an in-flight move.
#[async_trait]
pub trait MoveHandle: Send {
    async fn wait(&mut self, timeout: Duration) -> AcqResult<()>;
    async fn cancel(&mut self);
    fn done(&self) -> bool;
}

/// A positioning device moved outside the emitter's deflection.
#[async_trait]
pub trait Actuator: Send + Sync {
    fn name(&self) -> &str;

    fn axes(&self) -> HashMap<String, AxisDescriptor>;

    /// Live-readable current position.
    async fn position(&self) -> AcqResult<HashMap<String, f64>>;

    /// Begin an absolute move of the given axes.
    async fn move_abs(&self, target: HashMap<String, f64>) -> AcqResult<Box<dyn MoveHandle>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_waveform_slice_and_translate() {
        let mut wf = Waveform {
            xy: (0..6).map(|i| [i as f64, 10.0 + i as f64]).collect(),
            rows: 3,
            cols: 2,
        };
        let mid = wf.slice_rows(1, 2);
        assert_eq!(mid.rows, 1);
        assert_eq!(mid.xy, vec![[2.0, 12.0], [3.0, 13.0]]);

        wf.translate(0.5, -0.5);
        assert_eq!(wf.start_position(), Some((0.5, 9.5)));
    }
}
