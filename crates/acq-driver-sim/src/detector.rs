//! Simulated detectors.
//!
//! All variants share one reader state machine ([`ReaderCore`]) that
//! enforces the prepare → run → wait → cancel cycle and reproduces the
//! timing contract: `wait` blocks until the configured sampling window has
//! elapsed (readers sample while the emitter plays), times out like real
//! hardware, and requires a cancel after a timeout.

use acq_core::data::{DataArray, DynArray};
use acq_core::flow::{DataFlow, SyncEvent};
use acq_core::hw::{Detector, DetectorKind, RawBlock};
use acq_core::metadata::Metadata;
use acq_core::{AcqError, AcqResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};

struct ReaderState {
    prepared: Option<(usize, Duration)>,
    run_started: Option<Instant>,
    cancel_required: bool,
}

/// Prepare/run/wait/cancel bookkeeping shared by every simulated reader.
struct ReaderCore {
    name: &'static str,
    state: Mutex<ReaderState>,
    cancel: Notify,
}

impl ReaderCore {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(ReaderState {
                prepared: None,
                run_started: None,
                cancel_required: false,
            }),
            cancel: Notify::new(),
        }
    }

    fn prepare(&self, count: usize, expected: Duration) -> AcqResult<()> {
        let mut state = self.state.lock();
        if state.cancel_required {
            return Err(AcqError::TransientHardware(format!(
                "{} needs a cancel before re-arming",
                self.name
            )));
        }
        state.prepared = Some((count, expected));
        state.run_started = None;
        Ok(())
    }

    fn run(&self) -> AcqResult<()> {
        let mut state = self.state.lock();
        if state.prepared.is_none() {
            return Err(AcqError::TransientHardware(format!(
                "{} run() without prepare()",
                self.name
            )));
        }
        state.run_started = Some(Instant::now());
        Ok(())
    }

    /// Wait out the sampling window; returns the prepared sample count.
    async fn finish(&self, timeout: Duration) -> AcqResult<usize> {
        let (count, expected, started) = {
            let state = self.state.lock();
            let (count, expected) = state.prepared.ok_or_else(|| {
                AcqError::TransientHardware(format!("{} wait() without prepare()", self.name))
            })?;
            let started = state.run_started.ok_or_else(|| {
                AcqError::TransientHardware(format!("{} wait() without run()", self.name))
            })?;
            (count, expected, started)
        };

        let deadline = started + expected;
        let limit = Instant::now() + timeout;
        if deadline > limit {
            sleep_until(limit).await;
            self.state.lock().cancel_required = true;
            return Err(AcqError::Timeout(timeout, format!("{} read", self.name)));
        }
        tokio::select! {
            _ = sleep_until(deadline) => {}
            _ = self.cancel.notified() => {
                return Err(AcqError::TransientHardware(format!(
                    "{} read cancelled", self.name
                )));
            }
        }
        self.state.lock().prepared = None;
        Ok(count)
    }

    fn cancel(&self) {
        let mut state = self.state.lock();
        state.prepared = None;
        state.run_started = None;
        state.cancel_required = false;
        self.cancel.notify_waiters();
    }
}

// ---------------------------------------------------------------------------
// Analog detector
// ---------------------------------------------------------------------------

/// Secondary-electron / CL-intensity style analog detector producing one
/// sample per emitter sub-sample.
pub struct SimAnalogDetector {
    name: String,
    core: ReaderCore,
    flow: DataFlow,
    level: u16,
    noise: u16,
    inverted: bool,
    trigger: SyncEvent,
}

impl SimAnalogDetector {
    pub fn new(name: impl Into<String>, level: u16) -> Arc<Self> {
        let name = name.into();
        Arc::new(Self {
            flow: DataFlow::new(format!("{name}.data")),
            core: ReaderCore::new("analog reader"),
            name,
            level,
            noise: 0,
            inverted: false,
            trigger: SyncEvent::new("analog-trigger"),
        })
    }

    pub fn with_inverted(mut self: Arc<Self>, inverted: bool) -> Arc<Self> {
        if let Some(me) = Arc::get_mut(&mut self) {
            me.inverted = inverted;
        }
        self
    }

    pub fn with_noise(mut self: Arc<Self>, amplitude: u16) -> Arc<Self> {
        if let Some(me) = Arc::get_mut(&mut self) {
            me.noise = amplitude;
        }
        self
    }
}

#[async_trait]
impl Detector for SimAnalogDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DetectorKind {
        DetectorKind::Analog
    }

    fn shape(&self) -> Vec<usize> {
        vec![4096]
    }

    fn data(&self) -> &DataFlow {
        &self.flow
    }

    fn software_trigger(&self) -> Option<SyncEvent> {
        Some(self.trigger.clone())
    }

    fn min_read_period(&self) -> Duration {
        Duration::from_nanos(500)
    }

    fn inverted(&self) -> bool {
        self.inverted
    }

    async fn prepare(&self, sample_count: usize, expected: Duration) -> AcqResult<()> {
        self.core.prepare(sample_count, expected)
    }

    async fn run(&self) -> AcqResult<()> {
        self.core.run()
    }

    async fn wait(&self, timeout: Duration) -> AcqResult<RawBlock> {
        let count = self.core.finish(timeout).await?;
        let mut rng = rand::thread_rng();
        let samples: Vec<u16> = (0..count)
            .map(|_| {
                if self.noise > 0 {
                    self.level.saturating_add(rng.gen_range(0..self.noise))
                } else {
                    self.level
                }
            })
            .collect();
        Ok(RawBlock::Scalars(DynArray::from_u16(&[count], samples)?))
    }

    async fn cancel(&self) {
        self.core.cancel();
    }
}

// ---------------------------------------------------------------------------
// Counting detector
// ---------------------------------------------------------------------------

/// Pulse-counting detector; each sample is the count since the previous
/// one. Optionally needs a lead-in clock whose first sample is junk.
pub struct SimCountingDetector {
    name: String,
    core: ReaderCore,
    flow: DataFlow,
    counts_per_sample: u32,
    discard_first: bool,
}

/// Marker value emitted as the junk lead-in sample.
pub const LEAD_IN_MARKER: u32 = 0xDEAD;

impl SimCountingDetector {
    pub fn new(name: impl Into<String>, counts_per_sample: u32) -> Arc<Self> {
        let name = name.into();
        Arc::new(Self {
            flow: DataFlow::new(format!("{name}.data")),
            core: ReaderCore::new("counting reader"),
            name,
            counts_per_sample,
            discard_first: false,
        })
    }

    pub fn with_lead_in(mut self: Arc<Self>) -> Arc<Self> {
        if let Some(me) = Arc::get_mut(&mut self) {
            me.discard_first = true;
        }
        self
    }
}

#[async_trait]
impl Detector for SimCountingDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DetectorKind {
        DetectorKind::Counting
    }

    fn shape(&self) -> Vec<usize> {
        vec![1 << 24]
    }

    fn data(&self) -> &DataFlow {
        &self.flow
    }

    fn min_read_period(&self) -> Duration {
        Duration::from_micros(1)
    }

    fn discards_first_sample(&self) -> bool {
        self.discard_first
    }

    async fn prepare(&self, sample_count: usize, expected: Duration) -> AcqResult<()> {
        self.core.prepare(sample_count, expected)
    }

    async fn run(&self) -> AcqResult<()> {
        self.core.run()
    }

    async fn wait(&self, timeout: Duration) -> AcqResult<RawBlock> {
        let count = self.core.finish(timeout).await?;
        let mut samples = vec![self.counts_per_sample; count];
        if self.discard_first {
            if let Some(first) = samples.first_mut() {
                *first = LEAD_IN_MARKER;
            }
        }
        Ok(RawBlock::Scalars(DynArray::from_u32(&[count], samples)?))
    }

    async fn cancel(&self) {
        self.core.cancel();
    }
}

// ---------------------------------------------------------------------------
// Cameras
// ---------------------------------------------------------------------------

/// Frame-producing camera: 1-D binned (spectrometer) or full 2-D sensor.
pub struct SimCamera {
    name: String,
    core: ReaderCore,
    flow: DataFlow,
    frame_shape: Vec<usize>,
    level: u16,
    baseline: f64,
    exposure: Mutex<Duration>,
    wavelengths: Option<Vec<f64>>,
}

impl SimCamera {
    /// 1-D binned spectrometer camera with `bins` wavelength channels.
    pub fn spectrum(name: impl Into<String>, bins: usize) -> Arc<Self> {
        let name = name.into();
        // linear wavelength scale over the visible range
        let wavelengths = (0..bins)
            .map(|i| 400e-9 + 300e-9 * i as f64 / bins.max(2) as f64)
            .collect();
        Arc::new(Self {
            flow: DataFlow::new(format!("{name}.data")),
            core: ReaderCore::new("camera reader"),
            name,
            frame_shape: vec![bins],
            level: 120,
            baseline: 100.0,
            exposure: Mutex::new(Duration::from_millis(10)),
            wavelengths: Some(wavelengths),
        })
    }

    /// Full 2-D sensor (angular-resolved imaging).
    pub fn image(name: impl Into<String>, width: usize, height: usize) -> Arc<Self> {
        let name = name.into();
        Arc::new(Self {
            flow: DataFlow::new(format!("{name}.data")),
            core: ReaderCore::new("camera reader"),
            name,
            frame_shape: vec![height, width],
            level: 120,
            baseline: 100.0,
            exposure: Mutex::new(Duration::from_millis(10)),
            wavelengths: None,
        })
    }

    fn frame(&self) -> AcqResult<DataArray> {
        let n: usize = self.frame_shape.iter().product();
        let raw = vec![self.level.saturating_add(self.baseline as u16); n];
        let data = DynArray::from_u16(&self.frame_shape, raw)?;
        let metadata = Metadata {
            baseline: Some(self.baseline),
            exp_time: Some(self.exposure.lock().as_secs_f64()),
            wavelength_list: self.wavelengths.clone(),
            ..Default::default()
        };
        Ok(DataArray::new(data, metadata))
    }
}

#[async_trait]
impl Detector for SimCamera {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DetectorKind {
        DetectorKind::Camera
    }

    fn shape(&self) -> Vec<usize> {
        let mut s = self.frame_shape.clone();
        s.push(1 << 16);
        s
    }

    fn data(&self) -> &DataFlow {
        &self.flow
    }

    fn min_read_period(&self) -> Duration {
        Duration::from_millis(1)
    }

    async fn prepare(&self, sample_count: usize, expected: Duration) -> AcqResult<()> {
        self.core.prepare(sample_count, expected)
    }

    async fn run(&self) -> AcqResult<()> {
        self.core.run()
    }

    async fn wait(&self, timeout: Duration) -> AcqResult<RawBlock> {
        let count = self.core.finish(timeout).await?;
        let frames = (0..count)
            .map(|_| self.frame())
            .collect::<AcqResult<Vec<_>>>()?;
        Ok(RawBlock::Frames(frames))
    }

    async fn cancel(&self) {
        self.core.cancel();
    }
}

/// Streak camera: 2-D temporal-spectral frames with a bounded single
/// exposure; longer integrations are summed by the engine.
pub struct SimStreakCamera {
    name: String,
    core: ReaderCore,
    flow: DataFlow,
    /// (wavelength bins, time bins)
    frame_shape: (usize, usize),
    level: u16,
    baseline: f64,
    max_exposure: Duration,
    wavelengths: Vec<f64>,
    times: Vec<f64>,
}

impl SimStreakCamera {
    pub fn new(name: impl Into<String>, wl_bins: usize, time_bins: usize) -> Arc<Self> {
        let name = name.into();
        Arc::new(Self {
            flow: DataFlow::new(format!("{name}.data")),
            core: ReaderCore::new("streak reader"),
            name,
            frame_shape: (wl_bins, time_bins),
            level: 150,
            baseline: 100.0,
            max_exposure: Duration::from_millis(10),
            wavelengths: (0..wl_bins)
                .map(|i| 400e-9 + 300e-9 * i as f64 / wl_bins.max(2) as f64)
                .collect(),
            times: (0..time_bins).map(|i| 1e-9 * i as f64).collect(),
        })
    }

    pub fn with_max_exposure(mut self: Arc<Self>, max: Duration) -> Arc<Self> {
        if let Some(me) = Arc::get_mut(&mut self) {
            me.max_exposure = max;
        }
        self
    }
}

#[async_trait]
impl Detector for SimStreakCamera {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DetectorKind {
        DetectorKind::StreakCamera
    }

    fn shape(&self) -> Vec<usize> {
        vec![self.frame_shape.0, self.frame_shape.1, 1 << 16]
    }

    fn data(&self) -> &DataFlow {
        &self.flow
    }

    fn min_read_period(&self) -> Duration {
        Duration::from_millis(1)
    }

    fn max_exposure(&self) -> Option<Duration> {
        Some(self.max_exposure)
    }

    async fn prepare(&self, sample_count: usize, expected: Duration) -> AcqResult<()> {
        self.core.prepare(sample_count, expected)
    }

    async fn run(&self) -> AcqResult<()> {
        self.core.run()
    }

    async fn wait(&self, timeout: Duration) -> AcqResult<RawBlock> {
        let count = self.core.finish(timeout).await?;
        let (c, t) = self.frame_shape;
        let raw = vec![self.level.saturating_add(self.baseline as u16); c * t];
        let mut frames = Vec::with_capacity(count);
        for _ in 0..count {
            let data = DynArray::from_u16(&[c, t], raw.clone())?;
            let metadata = Metadata {
                baseline: Some(self.baseline),
                exp_time: Some(self.max_exposure.as_secs_f64()),
                wavelength_list: Some(self.wavelengths.clone()),
                time_list: Some(self.times.clone()),
                ..Default::default()
            };
            frames.push(DataArray::new(data, metadata));
        }
        Ok(RawBlock::Frames(frames))
    }

    async fn cancel(&self) {
        self.core.cancel();
    }
}

/// Time correlator producing a 1-D arrival-time histogram per pixel.
pub struct SimTimeCorrelator {
    name: String,
    core: ReaderCore,
    flow: DataFlow,
    bins: usize,
    level: u16,
    times: Vec<f64>,
}

impl SimTimeCorrelator {
    pub fn new(name: impl Into<String>, bins: usize) -> Arc<Self> {
        let name = name.into();
        Arc::new(Self {
            flow: DataFlow::new(format!("{name}.data")),
            core: ReaderCore::new("correlator reader"),
            name,
            bins,
            level: 40,
            times: (0..bins).map(|i| 50e-12 * i as f64).collect(),
        })
    }
}

#[async_trait]
impl Detector for SimTimeCorrelator {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DetectorKind {
        DetectorKind::TimeCorrelator
    }

    fn shape(&self) -> Vec<usize> {
        vec![self.bins, 1 << 16]
    }

    fn data(&self) -> &DataFlow {
        &self.flow
    }

    fn min_read_period(&self) -> Duration {
        Duration::from_millis(1)
    }

    async fn prepare(&self, sample_count: usize, expected: Duration) -> AcqResult<()> {
        self.core.prepare(sample_count, expected)
    }

    async fn run(&self) -> AcqResult<()> {
        self.core.run()
    }

    async fn wait(&self, timeout: Duration) -> AcqResult<RawBlock> {
        let count = self.core.finish(timeout).await?;
        let mut frames = Vec::with_capacity(count);
        for _ in 0..count {
            let data = DynArray::from_u16(&[self.bins], vec![self.level; self.bins])?;
            let metadata = Metadata {
                time_list: Some(self.times.clone()),
                ..Default::default()
            };
            frames.push(DataArray::new(data, metadata));
        }
        Ok(RawBlock::Frames(frames))
    }

    async fn cancel(&self) {
        self.core.cancel();
    }
}

// ---------------------------------------------------------------------------
// 0-D probe current
// ---------------------------------------------------------------------------

/// Faraday-cup style probe current readout, one scalar per sample.
pub struct SimProbeCurrent {
    name: String,
    core: ReaderCore,
    flow: DataFlow,
    amperes: f64,
}

impl SimProbeCurrent {
    pub fn new(name: impl Into<String>, amperes: f64) -> Arc<Self> {
        let name = name.into();
        Arc::new(Self {
            flow: DataFlow::new(format!("{name}.data")),
            core: ReaderCore::new("probe reader"),
            name,
            amperes,
        })
    }
}

#[async_trait]
impl Detector for SimProbeCurrent {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DetectorKind {
        DetectorKind::ZeroDProbe
    }

    fn shape(&self) -> Vec<usize> {
        vec![1]
    }

    fn data(&self) -> &DataFlow {
        &self.flow
    }

    fn min_read_period(&self) -> Duration {
        Duration::from_millis(1)
    }

    async fn prepare(&self, sample_count: usize, expected: Duration) -> AcqResult<()> {
        self.core.prepare(sample_count, expected)
    }

    async fn run(&self) -> AcqResult<()> {
        self.core.run()
    }

    async fn wait(&self, timeout: Duration) -> AcqResult<RawBlock> {
        let count = self.core.finish(timeout).await?;
        let mut rng = rand::thread_rng();
        let samples: Vec<f64> = (0..count)
            .map(|_| self.amperes * rng.gen_range(0.999..1.001))
            .collect();
        Ok(RawBlock::Scalars(DynArray::from_f64(&[count], samples)?))
    }

    async fn cancel(&self) {
        self.core.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reader_cycle() {
        let det = SimAnalogDetector::new("se", 1000);
        det.prepare(8, Duration::from_millis(1)).await.unwrap();
        det.run().await.unwrap();
        let block = det.wait(Duration::from_secs(1)).await.unwrap();
        match block {
            RawBlock::Scalars(raw) => {
                assert_eq!(raw.len(), 8);
                assert_eq!(raw.at(&[0]), 1000.0);
            }
            RawBlock::Frames(_) => panic!("analog reader must yield scalars"),
        }
    }

    #[tokio::test]
    async fn test_wait_without_run_is_error() {
        let det = SimAnalogDetector::new("se", 10);
        det.prepare(1, Duration::from_millis(1)).await.unwrap();
        assert!(det.wait(Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_timeout_requires_cancel() {
        let det = SimAnalogDetector::new("se", 10);
        det.prepare(4, Duration::from_secs(10)).await.unwrap();
        det.run().await.unwrap();
        // the reader cannot finish a 10 s window within 10 ms... but the
        // driver floor for timeouts in the engine is 1 s, so call directly
        let err = det.wait(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, AcqError::Timeout(..)));
        // re-arming before cancel is refused
        assert!(det.prepare(1, Duration::from_millis(1)).await.is_err());
        det.cancel().await;
        assert!(det.prepare(1, Duration::from_millis(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_counting_lead_in_marker() {
        let det = SimCountingDetector::new("pmt", 5).with_lead_in();
        assert!(det.discards_first_sample());
        det.prepare(4, Duration::from_millis(1)).await.unwrap();
        det.run().await.unwrap();
        if let RawBlock::Scalars(raw) = det.wait(Duration::from_secs(1)).await.unwrap() {
            assert_eq!(raw.at(&[0]), f64::from(LEAD_IN_MARKER));
            assert_eq!(raw.at(&[1]), 5.0);
        } else {
            panic!("counting reader must yield scalars");
        }
    }

    #[tokio::test]
    async fn test_camera_frames() {
        let cam = SimCamera::spectrum("spec", 16);
        cam.prepare(3, Duration::from_millis(1)).await.unwrap();
        cam.run().await.unwrap();
        if let RawBlock::Frames(frames) = cam.wait(Duration::from_secs(1)).await.unwrap() {
            assert_eq!(frames.len(), 3);
            assert_eq!(frames[0].shape(), &[16]);
            assert_eq!(frames[0].metadata.baseline, Some(100.0));
            assert_eq!(frames[0].metadata.wavelength_list.as_ref().map(Vec::len), Some(16));
        } else {
            panic!("camera must yield frames");
        }
    }
}
