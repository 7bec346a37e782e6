//! Simulated scanning emitter.

use acq_core::flow::SyncEvent;
use acq_core::hw::{Emitter, EmitterTimings, TriggerMode, Waveform, WaveformHandle};
use acq_core::{AcqError, AcqResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::debug;

/// Simulated e-beam scanner.
///
/// Plays waveforms in real (scaled) time, tracks the parked position, and
/// can inject transient write failures to exercise the engine's retry
/// path.
pub struct SimEmitter {
    shape: (usize, usize),
    field_extent: (f64, f64),
    resting: (f64, f64),
    timings: EmitterTimings,
    vector_mode: bool,
    hw_trigger: bool,
    position: Mutex<(f64, f64)>,
    parked: AtomicBool,
    scanning: Arc<AtomicBool>,
    /// Bumped on every indicator change; a deferred release only lands if
    /// nothing changed the indicator since it was scheduled.
    indicator_epoch: Arc<AtomicU64>,
    /// Grace period before a non-fast release takes effect.
    indicator_grace: Duration,
    new_position: SyncEvent,
    /// Pending injected write failures.
    fail_writes: AtomicU32,
}

impl SimEmitter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            shape: (4096, 4096),
            field_extent: (1e-4, 1e-4),
            resting: (-5e-5, -5e-5),
            timings: EmitterTimings {
                min_period: Duration::from_nanos(500),
                max_period: Duration::from_micros(100),
                granularity: Duration::from_nanos(50),
                settle_time: Duration::from_micros(10),
                max_buffer_samples: 1 << 20,
            },
            vector_mode: true,
            hw_trigger: false,
            position: Mutex::new((-5e-5, -5e-5)),
            parked: AtomicBool::new(true),
            scanning: Arc::new(AtomicBool::new(false)),
            indicator_epoch: Arc::new(AtomicU64::new(0)),
            indicator_grace: Duration::ZERO,
            new_position: SyncEvent::new("new-position"),
            fail_writes: AtomicU32::new(0),
        })
    }

    /// Copy of this emitter's configuration with vector mode disabled
    /// (no rotated scans).
    pub fn without_vector_mode(&self) -> Arc<Self> {
        let mut e = self.clone_config();
        e.vector_mode = false;
        Arc::new(e)
    }

    /// Copy with a tiny output buffer, forcing small tiles.
    pub fn with_buffer_samples(&self, samples: usize) -> Arc<Self> {
        let mut e = self.clone_config();
        e.timings.max_buffer_samples = samples;
        Arc::new(e)
    }

    /// Copy whose scanning indicator stays asserted for `grace` after a
    /// non-fast release.
    pub fn with_indicator_grace(&self, grace: Duration) -> Arc<Self> {
        let mut e = self.clone_config();
        e.indicator_grace = grace;
        Arc::new(e)
    }

    fn clone_config(&self) -> SimEmitter {
        SimEmitter {
            shape: self.shape,
            field_extent: self.field_extent,
            resting: self.resting,
            timings: self.timings,
            vector_mode: self.vector_mode,
            hw_trigger: self.hw_trigger,
            position: Mutex::new(*self.position.lock()),
            parked: AtomicBool::new(true),
            scanning: Arc::new(AtomicBool::new(false)),
            indicator_epoch: Arc::new(AtomicU64::new(0)),
            indicator_grace: self.indicator_grace,
            new_position: SyncEvent::new("new-position"),
            fail_writes: AtomicU32::new(0),
        }
    }

    /// The next `n` writes will fail with a transient error.
    pub fn fail_next_writes(&self, n: u32) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    /// Current (or last parked) beam position.
    pub fn position(&self) -> (f64, f64) {
        *self.position.lock()
    }

    pub fn is_parked(&self) -> bool {
        self.parked.load(Ordering::SeqCst)
    }

    pub fn is_scanning_indicated(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }
}

// the handle only needs the deadline; position bookkeeping happens at
// write time in the emitter itself
#[derive(Debug)]
struct Handle {
    deadline: Instant,
    cancelled: bool,
}

#[async_trait]
impl WaveformHandle for Handle {
    async fn wait(&mut self, timeout: Duration) -> AcqResult<()> {
        if self.cancelled {
            return Ok(());
        }
        let limit = Instant::now() + timeout;
        if self.deadline <= limit {
            sleep_until(self.deadline).await;
            Ok(())
        } else {
            sleep_until(limit).await;
            Err(AcqError::Timeout(timeout, "waveform output".into()))
        }
    }

    async fn cancel(&mut self) {
        self.cancelled = true;
    }
}

#[async_trait]
impl Emitter for SimEmitter {
    fn name(&self) -> &str {
        "sim-scanner"
    }

    fn shape(&self) -> (usize, usize) {
        self.shape
    }

    fn field_extent(&self) -> (f64, f64) {
        self.field_extent
    }

    fn resting_position(&self) -> (f64, f64) {
        self.resting
    }

    fn timings(&self) -> EmitterTimings {
        self.timings
    }

    fn supports_vector_mode(&self) -> bool {
        self.vector_mode
    }

    fn supports_hw_trigger(&self) -> bool {
        self.hw_trigger
    }

    fn new_position_event(&self) -> SyncEvent {
        self.new_position.clone()
    }

    async fn write_waveform(
        &self,
        waveform: &Waveform,
        period: Duration,
        _trigger: TriggerMode,
    ) -> AcqResult<Box<dyn WaveformHandle>> {
        if waveform.is_empty() {
            return Err(AcqError::validation("empty waveform"));
        }
        if waveform.len() > self.timings.max_buffer_samples {
            return Err(AcqError::WaveformTooLarge {
                size: waveform.len(),
                limit: self.timings.max_buffer_samples,
            });
        }
        if self
            .fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(AcqError::TransientHardware("output under-run".into()));
        }

        self.parked.store(false, Ordering::SeqCst);
        if let Some(last) = waveform.xy.last() {
            *self.position.lock() = (last[0], last[1]);
        }
        let duration = period * waveform.len() as u32;
        debug!(samples = waveform.len(), ?duration, "waveform playback started");
        Ok(Box::new(Handle {
            deadline: Instant::now() + duration,
            cancelled: false,
        }))
    }

    async fn park_at(&self, pos: (f64, f64)) -> AcqResult<()> {
        *self.position.lock() = pos;
        self.parked.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn set_scanning_indicator(&self, active: bool, fast: bool) -> AcqResult<()> {
        let epoch = self.indicator_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        if active {
            // post-assertion settle before reporting ready
            sleep(Duration::from_micros(100)).await;
            self.scanning.store(true, Ordering::SeqCst);
            return Ok(());
        }
        if fast || self.indicator_grace.is_zero() {
            self.scanning.store(false, Ordering::SeqCst);
            return Ok(());
        }
        // deferred release: a new scan starting within the grace period
        // bumps the epoch and keeps the lines asserted
        let grace = self.indicator_grace;
        let scanning = self.scanning.clone();
        let epoch_ref = self.indicator_epoch.clone();
        tokio::spawn(async move {
            sleep(grace).await;
            if epoch_ref.load(Ordering::SeqCst) == epoch {
                scanning.store(false, Ordering::SeqCst);
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_and_park() {
        let em = SimEmitter::new();
        let wf = Waveform {
            xy: vec![[0.0, 0.0], [1e-6, 0.0]],
            rows: 1,
            cols: 2,
        };
        let mut h = em
            .write_waveform(&wf, Duration::from_micros(10), TriggerMode::SoftwareStart)
            .await
            .unwrap();
        assert!(!em.is_parked());
        h.wait(Duration::from_secs(1)).await.unwrap();
        em.park_at(em.resting_position()).await.unwrap();
        assert!(em.is_parked());
        assert_eq!(em.position(), em.resting_position());
    }

    #[tokio::test]
    async fn test_waveform_size_limit() {
        let em = SimEmitter::new().with_buffer_samples(4);
        let wf = Waveform {
            xy: vec![[0.0, 0.0]; 8],
            rows: 1,
            cols: 8,
        };
        let err = em
            .write_waveform(&wf, Duration::from_micros(1), TriggerMode::SoftwareStart)
            .await
            .unwrap_err();
        assert!(matches!(err, AcqError::WaveformTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_indicator_release_deferred_by_grace() {
        let em = SimEmitter::new().with_indicator_grace(Duration::from_millis(50));
        em.set_scanning_indicator(true, false).await.unwrap();
        assert!(em.is_scanning_indicated());

        em.set_scanning_indicator(false, false).await.unwrap();
        // still asserted until the grace period elapses
        assert!(em.is_scanning_indicated());
        sleep(Duration::from_millis(80)).await;
        assert!(!em.is_scanning_indicated());
    }

    #[tokio::test]
    async fn test_indicator_fast_release_skips_grace() {
        let em = SimEmitter::new().with_indicator_grace(Duration::from_millis(50));
        em.set_scanning_indicator(true, false).await.unwrap();
        em.set_scanning_indicator(false, true).await.unwrap();
        assert!(!em.is_scanning_indicated());
    }

    #[tokio::test]
    async fn test_indicator_reassertion_cancels_pending_release() {
        let em = SimEmitter::new().with_indicator_grace(Duration::from_millis(40));
        em.set_scanning_indicator(true, false).await.unwrap();
        em.set_scanning_indicator(false, false).await.unwrap();
        // the next scan starts before the grace period runs out
        em.set_scanning_indicator(true, false).await.unwrap();
        sleep(Duration::from_millis(70)).await;
        assert!(em.is_scanning_indicated());
    }

    #[tokio::test]
    async fn test_injected_write_failure() {
        let em = SimEmitter::new();
        em.fail_next_writes(1);
        let wf = Waveform {
            xy: vec![[0.0, 0.0]],
            rows: 1,
            cols: 1,
        };
        let err = em
            .write_waveform(&wf, Duration::from_micros(1), TriggerMode::SoftwareStart)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        // next write succeeds
        assert!(em
            .write_waveform(&wf, Duration::from_micros(1), TriggerMode::SoftwareStart)
            .await
            .is_ok());
    }
}
