//! Periodic in-scan tasks ("leeches").
//!
//! A leech runs at pixel boundaries of the main scan without distorting its
//! geometry: it advertises the next pixel index at which it must fire, the
//! engine pauses the scan at the end of the tile containing that index
//! (never mid-pixel, possibly early by up to one row) and drives the leech
//! through an explicit state machine: `series_start` → `fire`* →
//! `complete` → `series_complete`, the last always called even on failure
//! or cancellation.
//!
//! Two variants: [`AnchorDriftCorrector`] re-acquires a small anchor region
//! and phase-correlates it against a reference to track specimen drift, and
//! [`ProbeCurrentAcquirer`] samples a 0-D current detector so the primary
//! output can be normalized offline.

use crate::{assemble, plan};
use acq_core::data::{DataArray, DynArray};
use acq_core::hw::{Detector, Emitter, RawBlock, TriggerMode, WaveformHandle};
use acq_core::metadata::Metadata;
use acq_core::{AcqError, AcqResult};
use async_trait::async_trait;
use num_complex::Complex;
use rustfft::FftPlanner;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Scan facts handed to a leech at series start.
#[derive(Debug, Clone, Copy)]
pub struct LeechStart {
    pub total_pixels: u64,
    pub pixel_time: Duration,
}

/// Result of one firing.
#[derive(Debug, Clone, Copy)]
pub struct LeechFire {
    /// Next pixel index at which the leech must fire (monotonic).
    pub next_pixel: u64,
    /// Updated drift offset in meters, when the leech measures one.
    pub drift: Option<(f64, f64)>,
}

/// A periodic task interleaved with the scan at pixel boundaries.
#[async_trait]
pub trait Leech: Send + Sync {
    fn name(&self) -> &str;

    /// A required leech failing fails the whole acquisition.
    fn required(&self) -> bool {
        false
    }

    /// Fire once more when the scan completes (before `complete`).
    fn fires_at_end(&self) -> bool {
        false
    }

    /// Firing period in pixels for the given pixel duration.
    fn period_pixels(&self, pixel_time: Duration) -> u64;

    /// Time the leech will add over `fires` firings.
    fn estimate(&self, fires: u64) -> Duration;

    /// Initialize for a scan; returns the first `next_pixel`.
    async fn series_start(&mut self, start: &LeechStart) -> AcqResult<u64>;

    /// Execute at a pixel boundary; `acquired_pixels` is the number of
    /// pixels completed so far (may exceed the advertised `next_pixel` by
    /// up to one row).
    async fn fire(&mut self, acquired_pixels: u64) -> AcqResult<LeechFire>;

    /// Attach per-leech metadata or extra arrays to the assembled outputs.
    fn complete(&mut self, outputs: &mut Vec<DataArray>);

    /// Release resources; always called, success or not.
    async fn series_complete(&mut self);
}

// ---------------------------------------------------------------------------
// Anchor-region drift corrector
// ---------------------------------------------------------------------------

/// Tracks specimen drift by re-acquiring a small anchor region and
/// cross-correlating it against the reference taken at scan start. The
/// measured translation is low-pass blended into the running offset, which
/// the engine adds to subsequent pixel positions.
pub struct AnchorDriftCorrector {
    emitter: Arc<dyn Emitter>,
    detector: Arc<dyn Detector>,
    /// Anchor region, normalized to the emitter field.
    roi: [f64; 4],
    dwell: Duration,
    period: Duration,
    /// Anchor raster is square, `resolution` pixels a side.
    resolution: usize,
    /// Blend weight of a new measurement into the running offset.
    smoothing: f64,
    reference: Option<DynArray>,
    drift: (f64, f64),
    series: Vec<(f64, f64)>,
    anchor_pixel_size: (f64, f64),
    scan_pixel_time: Duration,
}

impl AnchorDriftCorrector {
    pub fn new(
        emitter: Arc<dyn Emitter>,
        detector: Arc<dyn Detector>,
        roi: [f64; 4],
        dwell: Duration,
        period: Duration,
    ) -> Self {
        Self {
            emitter,
            detector,
            roi,
            dwell,
            period,
            resolution: 64,
            smoothing: 0.5,
            reference: None,
            drift: (0.0, 0.0),
            series: Vec::new(),
            anchor_pixel_size: (0.0, 0.0),
            scan_pixel_time: Duration::from_micros(1),
        }
    }

    pub fn with_resolution(mut self, resolution: usize) -> Self {
        self.resolution = resolution.max(8);
        self
    }

    /// Current accumulated offset, meters.
    pub fn offset(&self) -> (f64, f64) {
        self.drift
    }

    /// One anchor-region scan with the emitter and the anchor detector.
    async fn acquire_anchor(&mut self) -> AcqResult<DynArray> {
        let settings = plan::ScanSettings {
            repetition: (self.resolution, self.resolution),
            roi: self.roi,
            rotation: 0.0,
            dwell: self.dwell,
            fuzz: 1,
        };
        let detectors = vec![self.detector.clone()];
        let planner = plan::ScanPlanner::new();
        let scan = planner.plan(&settings, self.emitter.as_ref(), &detectors, None)?;
        self.anchor_pixel_size = scan.pixel_size;

        // the anchor is small enough to go out in a single write
        let entries = scan.waveform.len();
        let samples = entries * scan.samples_per_entry();
        let expected = scan.entry_time() * entries as u32;

        self.detector.prepare(samples, expected).await?;
        self.detector.run().await?;
        let emitter_period = scan.timing.period * scan.timing.osr as u32;
        let mut wave = match self
            .emitter
            .write_waveform(&scan.waveform, emitter_period, TriggerMode::SoftwareStart)
            .await
        {
            Ok(w) => w,
            Err(e) => {
                self.detector.cancel().await;
                return Err(e);
            }
        };

        let timeout = expected.mul_f64(1.1) + Duration::from_millis(100);
        let block = match self.detector.wait(timeout.max(Duration::from_secs(1))).await {
            Ok(block) => block,
            Err(e) => {
                self.detector.cancel().await;
                wave.cancel().await;
                return Err(e);
            }
        };
        wave.cancel().await;

        let raw = match block {
            RawBlock::Scalars(raw) => raw,
            RawBlock::Frames(_) => {
                return Err(AcqError::External(
                    "anchor detector returned frames instead of samples".into(),
                ))
            }
        };
        let per_entry =
            assemble::decimate_entries(&raw, entries, scan.samples_per_entry(), true)?;
        let trimmed = assemble::trim_margin(
            &per_entry,
            scan.shape.0,
            scan.entries_per_row(),
            scan.margin,
        )?;
        trimmed.into_shape(&[scan.shape.0, scan.shape.1])
    }
}

#[async_trait]
impl Leech for AnchorDriftCorrector {
    fn name(&self) -> &str {
        "anchor-drift"
    }

    fn period_pixels(&self, pixel_time: Duration) -> u64 {
        let px = self.period.as_secs_f64() / pixel_time.as_secs_f64().max(1e-12);
        (px as u64).max(1)
    }

    fn estimate(&self, fires: u64) -> Duration {
        let per_fire = self.dwell * (self.resolution * self.resolution) as u32
            + Duration::from_millis(10);
        per_fire * fires as u32
    }

    async fn series_start(&mut self, start: &LeechStart) -> AcqResult<u64> {
        self.drift = (0.0, 0.0);
        self.series.clear();
        self.scan_pixel_time = start.pixel_time;
        let reference = self.acquire_anchor().await?;
        self.reference = Some(reference);
        self.series.push((0.0, 0.0));
        Ok(self.period_pixels(start.pixel_time).min(start.total_pixels))
    }

    async fn fire(&mut self, acquired_pixels: u64) -> AcqResult<LeechFire> {
        let image = self.acquire_anchor().await?;
        let reference = self.reference.as_ref().ok_or_else(|| AcqError::Leech {
            name: self.name().into(),
            reason: "fired before series_start".into(),
        })?;

        let (dx_px, dy_px) = measure_shift(reference, &image)?;
        let measured = (
            dx_px * self.anchor_pixel_size.0,
            dy_px * self.anchor_pixel_size.1,
        );
        // low-pass blend to attenuate correlation noise
        self.drift = (
            self.drift.0 * (1.0 - self.smoothing) + measured.0 * self.smoothing,
            self.drift.1 * (1.0 - self.smoothing) + measured.1 * self.smoothing,
        );
        self.series.push(self.drift);
        debug!(
            dx = self.drift.0,
            dy = self.drift.1,
            "drift update after {} pixels",
            acquired_pixels
        );

        Ok(LeechFire {
            next_pixel: acquired_pixels + self.period_pixels(self.scan_pixel_time),
            drift: Some(self.drift),
        })
    }

    fn complete(&mut self, outputs: &mut Vec<DataArray>) {
        // the drift vector series is published as its own (N, 2) array
        let n = self.series.len();
        let mut flat = Vec::with_capacity(n * 2);
        for (dx, dy) in &self.series {
            flat.push(*dx);
            flat.push(*dy);
        }
        if let Ok(data) = DynArray::from_f64(&[n, 2], flat) {
            let metadata = Metadata {
                detector_type: Some("anchor-drift".into()),
                pixel_size: Some(self.anchor_pixel_size),
                dims: Some("YX".into()),
                ..Default::default()
            };
            outputs.push(DataArray::new(data, metadata));
        }
    }

    async fn series_complete(&mut self) {
        self.reference = None;
    }
}

/// Translation of `image` relative to `reference` in pixels, (dx, dy), by
/// normalized phase correlation with parabolic sub-pixel refinement.
pub fn measure_shift(reference: &DynArray, image: &DynArray) -> AcqResult<(f64, f64)> {
    if reference.ndim() != 2 || reference.shape() != image.shape() {
        return Err(AcqError::External(format!(
            "cannot correlate {:?} against {:?}",
            image.shape(),
            reference.shape()
        )));
    }
    let (h, w) = (reference.shape()[0], reference.shape()[1]);

    let mut fa: Vec<Complex<f64>> = reference
        .to_f64_vec()
        .into_iter()
        .map(|v| Complex::new(v, 0.0))
        .collect();
    let mut fb: Vec<Complex<f64>> = image
        .to_f64_vec()
        .into_iter()
        .map(|v| Complex::new(v, 0.0))
        .collect();

    let mut planner = FftPlanner::new();
    fft_2d(&mut planner, &mut fa, h, w, false);
    fft_2d(&mut planner, &mut fb, h, w, false);

    // normalized cross-power spectrum
    let mut r: Vec<Complex<f64>> = fa
        .iter()
        .zip(fb.iter())
        .map(|(a, b)| {
            let c = a * b.conj();
            let n = c.norm();
            if n > 1e-12 {
                c / n
            } else {
                Complex::new(0.0, 0.0)
            }
        })
        .collect();
    fft_2d(&mut planner, &mut r, h, w, true);

    // peak of the correlation surface
    let mut peak = (0usize, 0usize);
    let mut best = f64::NEG_INFINITY;
    for y in 0..h {
        for x in 0..w {
            let v = r[y * w + x].re;
            if v > best {
                best = v;
                peak = (y, x);
            }
        }
    }

    let at = |y: isize, x: isize| -> f64 {
        let y = y.rem_euclid(h as isize) as usize;
        let x = x.rem_euclid(w as isize) as usize;
        r[y * w + x].re
    };
    let (py, px) = (peak.0 as isize, peak.1 as isize);
    let sub_x = parabolic_offset(at(py, px - 1), best, at(py, px + 1));
    let sub_y = parabolic_offset(at(py - 1, px), best, at(py + 1, px));

    // the correlation peaks at minus the displacement, wrapped
    let wrap = |p: f64, n: usize| -> f64 {
        if p > n as f64 / 2.0 {
            p - n as f64
        } else {
            p
        }
    };
    let dx = -wrap(peak.1 as f64 + sub_x, w);
    let dy = -wrap(peak.0 as f64 + sub_y, h);
    Ok((dx, dy))
}

/// Sub-sample offset of a peak from three samples around it.
fn parabolic_offset(left: f64, center: f64, right: f64) -> f64 {
    let denom = left - 2.0 * center + right;
    if denom.abs() < 1e-12 {
        0.0
    } else {
        0.5 * (left - right) / denom
    }
}

/// In-place 2-D FFT over a row-major buffer.
fn fft_2d(
    planner: &mut FftPlanner<f64>,
    data: &mut [Complex<f64>],
    rows: usize,
    cols: usize,
    inverse: bool,
) {
    let row_fft = if inverse {
        planner.plan_fft_inverse(cols)
    } else {
        planner.plan_fft_forward(cols)
    };
    for r in 0..rows {
        row_fft.process(&mut data[r * cols..(r + 1) * cols]);
    }

    let col_fft = if inverse {
        planner.plan_fft_inverse(rows)
    } else {
        planner.plan_fft_forward(rows)
    };
    let mut scratch: Vec<Complex<f64>> = vec![Complex::new(0.0, 0.0); rows];
    for c in 0..cols {
        for r in 0..rows {
            scratch[r] = data[r * cols + c];
        }
        col_fft.process(&mut scratch);
        for r in 0..rows {
            data[r * cols + c] = scratch[r];
        }
    }
}

// ---------------------------------------------------------------------------
// Probe-current acquirer
// ---------------------------------------------------------------------------

/// Samples a 0-D probe-current detector at a fixed period, plus once at
/// scan start and once at scan end, so the series brackets the whole
/// acquisition. The samples end up in the primary output's metadata.
pub struct ProbeCurrentAcquirer {
    detector: Arc<dyn Detector>,
    period: Duration,
    started: Option<Instant>,
    series: Vec<(f64, f64)>,
    scan_pixel_time: Duration,
}

impl ProbeCurrentAcquirer {
    pub fn new(detector: Arc<dyn Detector>, period: Duration) -> Self {
        Self {
            detector,
            period,
            started: None,
            series: Vec::new(),
            scan_pixel_time: Duration::from_micros(1),
        }
    }

    async fn sample(&mut self) -> AcqResult<()> {
        let expected = Duration::from_millis(10);
        self.detector.prepare(1, expected).await?;
        self.detector.run().await?;
        let block = self.detector.wait(Duration::from_secs(1)).await?;
        let value = match block {
            RawBlock::Scalars(raw) if !raw.is_empty() => raw.at(&[0]),
            _ => {
                return Err(AcqError::External(
                    "probe current detector returned no sample".into(),
                ))
            }
        };
        let elapsed = self.started.map_or(0.0, |t| t.elapsed().as_secs_f64());
        self.series.push((elapsed, value));
        Ok(())
    }
}

#[async_trait]
impl Leech for ProbeCurrentAcquirer {
    fn name(&self) -> &str {
        "probe-current"
    }

    fn fires_at_end(&self) -> bool {
        true
    }

    fn period_pixels(&self, pixel_time: Duration) -> u64 {
        let px = self.period.as_secs_f64() / pixel_time.as_secs_f64().max(1e-12);
        (px as u64).max(1)
    }

    fn estimate(&self, fires: u64) -> Duration {
        Duration::from_millis(15) * (fires as u32 + 2)
    }

    async fn series_start(&mut self, start: &LeechStart) -> AcqResult<u64> {
        self.series.clear();
        self.started = Some(Instant::now());
        self.scan_pixel_time = start.pixel_time;
        self.sample().await?;
        Ok(self.period_pixels(start.pixel_time).min(start.total_pixels))
    }

    async fn fire(&mut self, acquired_pixels: u64) -> AcqResult<LeechFire> {
        self.sample().await?;
        Ok(LeechFire {
            next_pixel: acquired_pixels + self.period_pixels(self.scan_pixel_time),
            drift: None,
        })
    }

    fn complete(&mut self, outputs: &mut Vec<DataArray>) {
        if let Some(primary) = outputs.first_mut() {
            primary.metadata.ebeam_current_time = Some(self.series.clone());
        } else {
            warn!("probe current series has no primary output to attach to");
        }
    }

    async fn series_complete(&mut self) {
        self.started = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn impulse(h: usize, w: usize, y: usize, x: usize) -> DynArray {
        let mut v = vec![0.0; h * w];
        v[y * w + x] = 100.0;
        DynArray::from_f64(&[h, w], v).unwrap()
    }

    #[test]
    fn test_measure_shift_integer() {
        let a = impulse(16, 16, 5, 5);
        let b = impulse(16, 16, 7, 6); // shifted by (+1, +2) in (x, y)
        let (dx, dy) = measure_shift(&a, &b).unwrap();
        assert!((dx - 1.0).abs() < 0.05, "dx = {dx}");
        assert!((dy - 2.0).abs() < 0.05, "dy = {dy}");
    }

    #[test]
    fn test_measure_shift_negative_wraps() {
        let a = impulse(16, 16, 8, 8);
        let b = impulse(16, 16, 6, 5);
        let (dx, dy) = measure_shift(&a, &b).unwrap();
        assert!((dx + 3.0).abs() < 0.05, "dx = {dx}");
        assert!((dy + 2.0).abs() < 0.05, "dy = {dy}");
    }

    #[test]
    fn test_zero_shift() {
        let a = impulse(8, 8, 3, 3);
        let (dx, dy) = measure_shift(&a, &a).unwrap();
        assert!(dx.abs() < 1e-6 && dy.abs() < 1e-6);
    }

    #[test]
    fn test_shift_shape_mismatch() {
        let a = impulse(8, 8, 1, 1);
        let b = impulse(8, 4, 1, 1);
        assert!(measure_shift(&a, &b).is_err());
    }
}
