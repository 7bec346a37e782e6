//! Raw-block decimation and output assembly.
//!
//! Readers hand back flat sample buffers; this module folds them into
//! per-entry pixel values (summing the OSR·DPR sub-samples in an
//! accumulator wide enough not to overflow, then dividing for averaging
//! detectors and leaving the sum for integrating ones), trims the settle
//! margin, scatters fuzzed bursts onto the fine grid, and integrates camera
//! frames across sub-exposures with the baseline applied exactly once.

use acq_core::data::{DataArray, Dtype, DynArray};
use acq_core::{AcqError, AcqResult};

/// Collapse `group` consecutive sub-samples per waveform entry into one
/// value per entry. `average` divides by the group size (analog detectors);
/// integrating detectors keep the sum and the accumulator's wider dtype.
pub fn decimate_entries(
    raw: &DynArray,
    entries: usize,
    group: usize,
    average: bool,
) -> AcqResult<DynArray> {
    if raw.ndim() != 1 || raw.len() != entries * group {
        return Err(AcqError::External(format!(
            "raw block of {} samples does not cover {} entries x {}",
            raw.len(),
            entries,
            group
        )));
    }
    let base = raw.dtype();
    let out_dtype = if average || group == 1 {
        base
    } else {
        Dtype::for_accumulation(base, base.max_value(), group)
    };

    let flat = raw.to_f64_vec();
    let mut out = DynArray::zeros(out_dtype, &[entries]);
    for e in 0..entries {
        let sum: f64 = flat[e * group..(e + 1) * group].iter().sum();
        let v = if average { sum / group as f64 } else { sum };
        out.set_at(&[e], v);
    }
    Ok(out)
}

/// Drop the margin entries at the start of each row of a per-entry vector.
pub fn trim_margin(
    values: &DynArray,
    rows: usize,
    entries_per_row: usize,
    margin: usize,
) -> AcqResult<DynArray> {
    if values.ndim() != 1 || values.len() != rows * entries_per_row {
        return Err(AcqError::External(format!(
            "{} entries do not cover {} rows of {}",
            values.len(),
            rows,
            entries_per_row
        )));
    }
    let keep = entries_per_row - margin;
    let mut out = DynArray::zeros(values.dtype(), &[rows * keep]);
    for r in 0..rows {
        for c in 0..keep {
            out.set_at(&[r * keep + c], values.at(&[r * entries_per_row + margin + c]));
        }
    }
    Ok(out)
}

/// Scatter margin-trimmed entry values (burst order: logical pixels
/// row-major, each pixel's K×K sub-raster consecutive) onto the fine grid
/// of shape (rows·K, W·K).
pub fn scatter_fine(
    values: &DynArray,
    rows: usize,
    width: usize,
    k: usize,
) -> AcqResult<DynArray> {
    let per_pixel = k * k;
    if values.len() != rows * width * per_pixel {
        return Err(AcqError::External(format!(
            "{} entries do not cover {}x{} pixels at fuzz {}",
            values.len(),
            rows,
            width,
            k
        )));
    }
    if k == 1 {
        return values.clone().into_shape(&[rows, width]);
    }
    let mut out = DynArray::zeros(values.dtype(), &[rows * k, width * k]);
    let mut i = 0;
    for ly in 0..rows {
        for lx in 0..width {
            for ky in 0..k {
                for kx in 0..k {
                    out.set_at(&[ly * k + ky, lx * k + kx], values.at(&[i]));
                    i += 1;
                }
            }
        }
    }
    Ok(out)
}

/// Map raw values to `max_value - v` for detectors wired inverted.
pub fn apply_inversion(block: &mut DynArray, inverted: bool, max_value: f64) {
    if inverted {
        block.invert(max_value);
    }
}

/// Accumulates camera sub-exposures into one integrated frame.
///
/// The accumulator dtype is widened so `target` summed frames cannot
/// overflow. Each frame carries the detector baseline; summing k frames
/// adds it k times, so (k−1) copies are removed at completion and the
/// published metadata keeps the single-frame baseline.
pub struct ImageIntegrator {
    target: u32,
    count: u32,
    acc: Option<DynArray>,
    baseline: Option<f64>,
    exp_time: f64,
}

impl ImageIntegrator {
    pub fn new(target: u32) -> Self {
        Self {
            target: target.max(1),
            count: 0,
            acc: None,
            baseline: None,
            exp_time: 0.0,
        }
    }

    /// Feed one sub-exposure. Returns the integrated frame once the target
    /// count is reached, resetting the accumulator for the next pixel.
    pub fn add(&mut self, frame: &DataArray) -> AcqResult<Option<DataArray>> {
        if self.acc.is_none() {
            let dtype = Dtype::for_accumulation(
                frame.data.dtype(),
                frame.data.dtype().max_value(),
                self.target as usize,
            );
            self.acc = Some(DynArray::zeros(dtype, frame.data.shape()));
            self.baseline = frame.metadata.baseline;
            self.exp_time = 0.0;
        }
        if let Some(acc) = self.acc.as_mut() {
            acc.add_assign_widened(&frame.data)?;
        }
        self.count += 1;
        self.exp_time += frame.metadata.exp_time.unwrap_or(0.0);

        if self.count < self.target {
            return Ok(None);
        }

        let mut data = self
            .acc
            .take()
            .ok_or_else(|| AcqError::External("integrator lost its accumulator".into()))?;
        if let Some(b) = self.baseline {
            // k frames carry k baselines; keep exactly one
            data.subtract_baseline(b * f64::from(self.count - 1));
        }
        let mut metadata = frame.metadata.clone();
        metadata.integration_count = Some(self.count);
        metadata.exp_time = Some(self.exp_time);
        metadata.baseline = self.baseline;
        self.count = 0;
        Ok(Some(DataArray::new(data, metadata)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acq_core::Metadata;

    #[test]
    fn test_average_of_constant_is_identity() {
        // averaging detector, constant signal s, OSR r: output = s
        let raw = DynArray::from_u16(&[12], vec![7; 12]).unwrap();
        let out = decimate_entries(&raw, 3, 4, true).unwrap();
        assert_eq!(out.dtype(), Dtype::U16);
        for e in 0..3 {
            assert_eq!(out.at(&[e]), 7.0);
        }
    }

    #[test]
    fn test_counting_sum_keeps_wide_dtype() {
        let raw = DynArray::from_u16(&[8], vec![60000; 8]).unwrap();
        let out = decimate_entries(&raw, 2, 4, false).unwrap();
        // 4 x 60000 overflows u16, so the sum is kept widened
        assert_eq!(out.dtype(), Dtype::U32);
        assert_eq!(out.at(&[0]), 240000.0);
    }

    #[test]
    fn test_margin_trim() {
        // 2 rows of margin 1 + 3 pixels
        let v = DynArray::from_u16(&[8], vec![99, 1, 2, 3, 98, 4, 5, 6]).unwrap();
        let out = trim_margin(&v, 2, 4, 1).unwrap();
        assert_eq!(out.to_f64_vec(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_scatter_fuzzed_burst() {
        // one row, two logical pixels, K=2: burst order p0(4 subs), p1(4 subs)
        let v = DynArray::from_u16(&[8], (0..8u16).collect()).unwrap();
        let out = scatter_fine(&v, 1, 2, 2).unwrap();
        assert_eq!(out.shape(), &[2, 4]);
        // pixel 0 occupies the left 2x2 block
        assert_eq!(out.at(&[0, 0]), 0.0);
        assert_eq!(out.at(&[0, 1]), 1.0);
        assert_eq!(out.at(&[1, 0]), 2.0);
        assert_eq!(out.at(&[1, 1]), 3.0);
        // pixel 1 the right 2x2 block
        assert_eq!(out.at(&[0, 2]), 4.0);
        assert_eq!(out.at(&[1, 3]), 7.0);
    }

    #[test]
    fn test_integration_applies_baseline_once() {
        // constant signal s = 110 with baseline 100, two sub-exposures:
        // integrated pixel must be 2*110 - 100 = 120, not 2*(110-100)
        let md = Metadata {
            baseline: Some(100.0),
            exp_time: Some(1.0),
            ..Default::default()
        };
        let frame = DataArray::new(DynArray::from_u16(&[1, 1], vec![110]).unwrap(), md);
        let mut integ = ImageIntegrator::new(2);
        assert!(integ.add(&frame).unwrap().is_none());
        let out = integ.add(&frame).unwrap().unwrap();
        assert_eq!(out.data.at(&[0, 0]), 120.0);
        assert_eq!(out.metadata.integration_count, Some(2));
        assert_eq!(out.metadata.baseline, Some(100.0));
        assert_eq!(out.metadata.exp_time, Some(2.0));
        // widened relative to the u16 input
        assert!(out.data.dtype() > Dtype::U16);
    }

    #[test]
    fn test_inversion() {
        let mut block = DynArray::from_u16(&[2], vec![0, 100]).unwrap();
        apply_inversion(&mut block, true, 4095.0);
        assert_eq!(block.to_f64_vec(), vec![4095.0, 3995.0]);
    }
}
