//! Clock and trigger coordination.
//!
//! Given a requested dwell time, the emitter's timing capabilities and the
//! detector set, this module picks the sample period, the oversampling rate
//! (detector samples per emitter sample), the duplication rate (waveform
//! replays per pixel, for dwell times longer than one emitter tick), the
//! tiling granularity against the device buffer ceiling, and whether the
//! scan can run in hardware-triggered mode.

use acq_core::hw::{Detector, Emitter, EmitterTimings, TriggerMode};
use acq_core::{AcqError, AcqResult};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Upper bound on the oversampling rate.
pub const MAX_OSR: usize = 1 << 24;

/// Resolved per-pixel clocking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingPlan {
    /// Detector sample period π.
    pub period: Duration,
    /// Detector samples per emitter sample.
    pub osr: usize,
    /// Emitter waveform replays per pixel.
    pub dpr: usize,
}

impl TimingPlan {
    /// Effective dwell realized per pixel: π · OSR · DPR.
    pub fn pixel_time(&self) -> Duration {
        self.period * (self.osr * self.dpr) as u32
    }
}

/// How the scan is cut against the device buffer ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tiling {
    /// Whole rows per write, `R` at a time.
    Rows(usize),
    /// One pixel per write.
    Pixel,
    /// One pixel replay (DPR sub-group) per write.
    SubPixel,
}

/// Pick (π, OSR, DPR) for the requested per-pixel dwell.
pub fn plan_timing(
    dwell: Duration,
    emitter: &EmitterTimings,
    detectors: &[Arc<dyn Detector>],
) -> AcqResult<TimingPlan> {
    let dwell_ns = dwell.as_nanos();
    if dwell_ns == 0 {
        return Err(AcqError::validation("dwell time must be positive"));
    }

    // A dwell longer than one emitter tick is realized by replaying the
    // pixel waveform DPR times.
    let max_period_ns = emitter.max_period.as_nanos().max(1);
    let dpr = dwell_ns.div_ceil(max_period_ns).max(1) as usize;
    let rep_ns = (dwell_ns / dpr as u128).max(1);

    let min_read_ns = detectors
        .iter()
        .map(|d| d.min_read_period().as_nanos())
        .max()
        .unwrap_or(1)
        .max(1);
    let floor_ns = min_read_ns.max(emitter.min_period.as_nanos().max(1));

    let osr = ((rep_ns / floor_ns).max(1) as usize).min(MAX_OSR);
    let gran_ns = emitter.granularity.as_nanos().max(1);
    // Round the period up to the clock granularity so OSR·π covers the
    // requested dwell rather than undershooting it.
    let mut period_ns = (rep_ns / osr as u128).max(floor_ns);
    period_ns = period_ns.div_ceil(gran_ns) * gran_ns;

    let plan = TimingPlan {
        period: Duration::from_nanos(period_ns as u64),
        osr,
        dpr,
    };
    debug!(
        period_ns = period_ns as u64,
        osr, dpr, "clock plan: {} ns x {} x {}", period_ns, osr, dpr
    );
    Ok(plan)
}

/// Settle margin in samples: ceil(settle / pixel_time), rounded up only
/// when the settle time exceeds 1% of the dwell, and scaled down with the
/// scanned width fraction of the full field.
pub fn settle_margin(settle: Duration, pixel_time: Duration, width_fraction: f64) -> usize {
    let st = settle.as_secs_f64() * width_fraction.clamp(0.0, 1.0);
    let dwell = pixel_time.as_secs_f64();
    if dwell <= 0.0 {
        return 0;
    }
    let m = (st / dwell - 0.01).ceil();
    if m > 0.0 {
        m as usize
    } else {
        0
    }
}

/// Pick the tiling for a scan of `width`+`margin` columns per row.
///
/// `min_leech_period`: smallest leech period in pixels, if any leech runs.
/// A leech due more than once per row forces single-pixel tiles so it can
/// fire at its exact pixel index.
pub fn plan_tiling(
    width: usize,
    height: usize,
    margin: usize,
    timing: &TimingPlan,
    itemsize: usize,
    buffer_ceiling: usize,
    min_leech_period: Option<u64>,
) -> Tiling {
    if let Some(p) = min_leech_period {
        if (p as usize) < width {
            return Tiling::Pixel;
        }
    }

    if timing.dpr == 1 {
        let line_samples = (width + margin) * timing.osr * timing.dpr;
        let rows = buffer_ceiling / (line_samples * itemsize).max(1);
        if rows >= 1 {
            return Tiling::Rows(rows.min(height));
        }
    }

    let pixel_samples = timing.osr * timing.dpr;
    if pixel_samples * itemsize <= buffer_ceiling {
        Tiling::Pixel
    } else {
        Tiling::SubPixel
    }
}

/// Hardware-triggered pacing is selected only when the emitter, every
/// reader, and the leech schedule all allow it; the trigger then provides
/// settling and the margin drops to zero.
pub fn select_trigger_mode(
    emitter: &dyn Emitter,
    detectors: &[Arc<dyn Detector>],
    has_sub_row_leech: bool,
) -> TriggerMode {
    let hw = emitter.supports_hw_trigger()
        && !has_sub_row_leech
        && detectors
            .iter()
            .all(|d| d.supports_hw_trigger_per_sample());
    if hw {
        TriggerMode::HardwareTriggerPerSample
    } else {
        TriggerMode::SoftwareStart
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timings() -> EmitterTimings {
        EmitterTimings {
            min_period: Duration::from_nanos(500),
            max_period: Duration::from_micros(100),
            granularity: Duration::from_nanos(50),
            settle_time: Duration::from_micros(10),
            max_buffer_samples: 1 << 20,
        }
    }

    #[test]
    fn test_short_dwell_single_sample() {
        let plan = plan_timing(Duration::from_nanos(800), &timings(), &[]).unwrap();
        assert_eq!(plan.osr, 1);
        assert_eq!(plan.dpr, 1);
        assert!(plan.period >= Duration::from_nanos(500));
    }

    #[test]
    fn test_long_dwell_oversamples() {
        let plan = plan_timing(Duration::from_micros(10), &timings(), &[]).unwrap();
        assert!(plan.osr > 1);
        assert_eq!(plan.dpr, 1);
        // realized dwell covers the request
        assert!(plan.pixel_time() >= Duration::from_micros(10));
    }

    #[test]
    fn test_very_long_dwell_duplicates() {
        let plan = plan_timing(Duration::from_millis(1), &timings(), &[]).unwrap();
        assert!(plan.dpr >= 10);
    }

    #[test]
    fn test_margin_one_percent_rule() {
        // settle far below 1% of dwell: no margin
        assert_eq!(
            settle_margin(
                Duration::from_nanos(1),
                Duration::from_micros(100),
                1.0
            ),
            0
        );
        // settle of one dwell: one margin sample
        assert_eq!(
            settle_margin(Duration::from_micros(1), Duration::from_micros(1), 1.0),
            1
        );
        // narrow scans need proportionally less settling
        assert_eq!(
            settle_margin(Duration::from_micros(1), Duration::from_micros(1), 0.001),
            0
        );
    }

    #[test]
    fn test_tiling_rows_then_pixel() {
        let t = TimingPlan {
            period: Duration::from_micros(1),
            osr: 4,
            dpr: 1,
        };
        // plenty of buffer: many rows at once
        match plan_tiling(512, 400, 8, &t, 2, 1 << 20, None) {
            Tiling::Rows(r) => assert!(r > 1),
            other => panic!("expected row tiling, got {other:?}"),
        }
        // tiny buffer: pixel at a time
        assert_eq!(plan_tiling(512, 400, 8, &t, 2, 64, None), Tiling::Pixel);
        // not even one pixel: sub-pixel
        let t2 = TimingPlan {
            period: Duration::from_micros(1),
            osr: 64,
            dpr: 4,
        };
        assert_eq!(plan_tiling(512, 400, 8, &t2, 2, 64, None), Tiling::SubPixel);
    }

    #[test]
    fn test_sub_row_leech_forces_pixel_tiles() {
        let t = TimingPlan {
            period: Duration::from_micros(1),
            osr: 1,
            dpr: 1,
        };
        assert_eq!(
            plan_tiling(512, 400, 8, &t, 2, 1 << 20, Some(100)),
            Tiling::Pixel
        );
    }
}
