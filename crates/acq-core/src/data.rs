//! Typed N-dimensional arrays with a dynamic element type.
//!
//! Detector drivers produce raw sample buffers whose element type depends on
//! the hardware bit depth, and the engine widens that type when it
//! accumulates (oversampling decimation, image integration). [`DynArray`]
//! carries an [`ndarray::ArrayD`] behind a small closed set of element
//! types, and [`Dtype::for_accumulation`] picks an accumulator type wide
//! enough that summing `n` samples cannot overflow.
//!
//! A [`DataArray`] couples a `DynArray` with the [`Metadata`] describing how
//! it was acquired. Once published on a `DataFlow` it is immutable.

use crate::metadata::Metadata;
use crate::{AcqError, AcqResult};
use ndarray::{ArrayD, IxDyn};

/// Dimension labels, from the fixed closed vocabulary {C, T, Z, Y, X}.
pub const DIMS_YX: &str = "YX";
/// Label for the 5-D spectrum/temporal cubes.
pub const DIMS_CTZYX: &str = "CTZYX";

/// Element type of a [`DynArray`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Dtype {
    U16,
    U32,
    U64,
    F64,
}

impl Dtype {
    /// Largest representable value, as f64.
    pub fn max_value(self) -> f64 {
        match self {
            Dtype::U16 => f64::from(u16::MAX),
            Dtype::U32 => f64::from(u32::MAX),
            Dtype::U64 => u64::MAX as f64,
            Dtype::F64 => f64::MAX,
        }
    }

    /// Size of one element in bytes.
    pub fn itemsize(self) -> usize {
        match self {
            Dtype::U16 => 2,
            Dtype::U32 => 4,
            Dtype::U64 | Dtype::F64 => 8,
        }
    }

    /// Smallest type able to hold the sum of `n` values whose per-sample
    /// maximum is `max_value`, without overflow.
    pub fn for_accumulation(base: Dtype, max_value: f64, n: usize) -> Dtype {
        if base == Dtype::F64 {
            return Dtype::F64;
        }
        let needed = max_value * n as f64;
        if needed <= f64::from(u32::MAX) {
            Dtype::U32
        } else if needed <= u64::MAX as f64 {
            Dtype::U64
        } else {
            Dtype::F64
        }
    }
}

/// N-dimensional numeric array over a closed set of element types.
#[derive(Debug, Clone, PartialEq)]
pub enum DynArray {
    U16(ArrayD<u16>),
    U32(ArrayD<u32>),
    U64(ArrayD<u64>),
    F64(ArrayD<f64>),
}

macro_rules! with_array {
    ($self:expr, $a:ident => $body:expr) => {
        match $self {
            DynArray::U16($a) => $body,
            DynArray::U32($a) => $body,
            DynArray::U64($a) => $body,
            DynArray::F64($a) => $body,
        }
    };
}

impl DynArray {
    /// An all-zero array of the given element type and shape.
    pub fn zeros(dtype: Dtype, shape: &[usize]) -> DynArray {
        let dim = IxDyn(shape);
        match dtype {
            Dtype::U16 => DynArray::U16(ArrayD::zeros(dim)),
            Dtype::U32 => DynArray::U32(ArrayD::zeros(dim)),
            Dtype::U64 => DynArray::U64(ArrayD::zeros(dim)),
            Dtype::F64 => DynArray::F64(ArrayD::zeros(dim)),
        }
    }

    /// Build from a flat `u16` buffer.
    pub fn from_u16(shape: &[usize], data: Vec<u16>) -> AcqResult<DynArray> {
        ArrayD::from_shape_vec(IxDyn(shape), data)
            .map(DynArray::U16)
            .map_err(|e| AcqError::External(format!("array shape mismatch: {e}")))
    }

    /// Build from a flat `u32` buffer.
    pub fn from_u32(shape: &[usize], data: Vec<u32>) -> AcqResult<DynArray> {
        ArrayD::from_shape_vec(IxDyn(shape), data)
            .map(DynArray::U32)
            .map_err(|e| AcqError::External(format!("array shape mismatch: {e}")))
    }

    /// Build from a flat `f64` buffer.
    pub fn from_f64(shape: &[usize], data: Vec<f64>) -> AcqResult<DynArray> {
        ArrayD::from_shape_vec(IxDyn(shape), data)
            .map(DynArray::F64)
            .map_err(|e| AcqError::External(format!("array shape mismatch: {e}")))
    }

    pub fn dtype(&self) -> Dtype {
        match self {
            DynArray::U16(_) => Dtype::U16,
            DynArray::U32(_) => Dtype::U32,
            DynArray::U64(_) => Dtype::U64,
            DynArray::F64(_) => Dtype::F64,
        }
    }

    pub fn shape(&self) -> &[usize] {
        with_array!(self, a => a.shape())
    }

    pub fn ndim(&self) -> usize {
        with_array!(self, a => a.ndim())
    }

    pub fn len(&self) -> usize {
        with_array!(self, a => a.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element at `index`, widened to f64.
    pub fn at(&self, index: &[usize]) -> f64 {
        with_array!(self, a => a[IxDyn(index)] as f64)
    }

    /// Store `value` at `index`, narrowing to the element type.
    pub fn set_at(&mut self, index: &[usize], value: f64) {
        with_array!(self, a => a[IxDyn(index)] = value as _);
    }

    /// Sum of all elements, in f64.
    pub fn sum_f64(&self) -> f64 {
        with_array!(self, a => a.iter().map(|&v| v as f64).sum())
    }

    /// Largest element, in f64. Zero for an empty array.
    pub fn max_f64(&self) -> f64 {
        with_array!(self, a => a.iter().map(|&v| v as f64).fold(0.0, f64::max))
    }

    /// All elements widened to a flat f64 vector, row-major.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        with_array!(self, a => a.iter().map(|&v| v as f64).collect())
    }

    /// Convert to the given (equal or wider) element type.
    pub fn widen_to(&self, dtype: Dtype) -> DynArray {
        if self.dtype() == dtype {
            return self.clone();
        }
        let shape = self.shape().to_vec();
        let flat = self.to_f64_vec();
        match dtype {
            Dtype::U16 => DynArray::U16(
                ArrayD::from_shape_vec(IxDyn(&shape), flat.iter().map(|&v| v as u16).collect())
                    .unwrap_or_else(|_| ArrayD::zeros(IxDyn(&shape))),
            ),
            Dtype::U32 => DynArray::U32(
                ArrayD::from_shape_vec(IxDyn(&shape), flat.iter().map(|&v| v as u32).collect())
                    .unwrap_or_else(|_| ArrayD::zeros(IxDyn(&shape))),
            ),
            Dtype::U64 => DynArray::U64(
                ArrayD::from_shape_vec(IxDyn(&shape), flat.iter().map(|&v| v as u64).collect())
                    .unwrap_or_else(|_| ArrayD::zeros(IxDyn(&shape))),
            ),
            Dtype::F64 => DynArray::F64(
                ArrayD::from_shape_vec(IxDyn(&shape), flat)
                    .unwrap_or_else(|_| ArrayD::zeros(IxDyn(&shape))),
            ),
        }
    }

    /// Elementwise add `other` into `self`. `self` must already be wide
    /// enough; values from `other` are widened as needed.
    pub fn add_assign_widened(&mut self, other: &DynArray) -> AcqResult<()> {
        if self.shape() != other.shape() {
            return Err(AcqError::External(format!(
                "cannot accumulate shape {:?} into {:?}",
                other.shape(),
                self.shape()
            )));
        }
        let rhs = other.to_f64_vec();
        let mut i = 0;
        match self {
            DynArray::U16(a) => {
                for v in a.iter_mut() {
                    *v += rhs[i] as u16;
                    i += 1;
                }
            }
            DynArray::U32(a) => {
                for v in a.iter_mut() {
                    *v += rhs[i] as u32;
                    i += 1;
                }
            }
            DynArray::U64(a) => {
                for v in a.iter_mut() {
                    *v += rhs[i] as u64;
                    i += 1;
                }
            }
            DynArray::F64(a) => {
                for v in a.iter_mut() {
                    *v += rhs[i];
                    i += 1;
                }
            }
        }
        Ok(())
    }

    /// Map every element `v` to `max_value - v` (detector inversion).
    pub fn invert(&mut self, max_value: f64) {
        with_array!(self, a => {
            for v in a.iter_mut() {
                *v = (max_value - *v as f64) as _;
            }
        });
    }

    /// Subtract a scalar baseline from every element, clamping at zero.
    pub fn subtract_baseline(&mut self, baseline: f64) {
        with_array!(self, a => {
            for v in a.iter_mut() {
                *v = ((*v as f64 - baseline).max(0.0)) as _;
            }
        });
    }

    /// Divide every element by `n` (integer division for integer types).
    pub fn div_scalar(&mut self, n: f64) {
        with_array!(self, a => {
            for v in a.iter_mut() {
                *v = (*v as f64 / n) as _;
            }
        });
    }

    pub fn as_u16(&self) -> Option<&ArrayD<u16>> {
        match self {
            DynArray::U16(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<&ArrayD<u32>> {
        match self {
            DynArray::U32(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<&ArrayD<f64>> {
        match self {
            DynArray::F64(a) => Some(a),
            _ => None,
        }
    }

    /// Reinterpret with a new shape of the same element count.
    pub fn into_shape(self, shape: &[usize]) -> AcqResult<DynArray> {
        let expected: usize = shape.iter().product();
        if expected != self.len() {
            return Err(AcqError::External(format!(
                "cannot reshape {} elements into {:?}",
                self.len(),
                shape
            )));
        }
        Ok(match self {
            DynArray::U16(a) => DynArray::U16(flat_reshape(a, shape)?),
            DynArray::U32(a) => DynArray::U32(flat_reshape(a, shape)?),
            DynArray::U64(a) => DynArray::U64(flat_reshape(a, shape)?),
            DynArray::F64(a) => DynArray::F64(flat_reshape(a, shape)?),
        })
    }

    /// Copy `src` (2-D, R rows) into rows `[r0, r0+R)` of this 2-D array.
    pub fn assign_rows(&mut self, r0: usize, src: &DynArray) -> AcqResult<()> {
        if self.ndim() != 2 || src.ndim() != 2 {
            return Err(AcqError::External("assign_rows expects 2-D arrays".into()));
        }
        let (rows, cols) = (src.shape()[0], src.shape()[1]);
        if self.shape()[1] != cols || r0 + rows > self.shape()[0] {
            return Err(AcqError::External(format!(
                "row block {:?}@{} does not fit in {:?}",
                src.shape(),
                r0,
                self.shape()
            )));
        }
        let flat = src.to_f64_vec();
        let mut i = 0;
        with_array!(self, a => {
            for r in r0..r0 + rows {
                for c in 0..cols {
                    a[IxDyn(&[r, c])] = flat[i] as _;
                    i += 1;
                }
            }
        });
        Ok(())
    }

    /// Write a 1-D vector along the first axis at trailing index (y, x) of a
    /// 5-D CTZYX (or TZ-compatible) array.
    pub fn assign_pixel_vector(&mut self, y: usize, x: usize, values: &DynArray) -> AcqResult<()> {
        if self.ndim() != 5 || values.ndim() != 1 {
            return Err(AcqError::External(
                "assign_pixel_vector expects a 5-D target and 1-D source".into(),
            ));
        }
        if values.len() != self.shape()[0] {
            return Err(AcqError::External(format!(
                "vector of {} does not match C dimension {}",
                values.len(),
                self.shape()[0]
            )));
        }
        let flat = values.to_f64_vec();
        with_array!(self, a => {
            for (c, &v) in flat.iter().enumerate() {
                a[IxDyn(&[c, 0, 0, y, x])] = v as _;
            }
        });
        Ok(())
    }

    /// Write a 2-D (C, T) plane at trailing index (y, x) of a 5-D CTZYX array.
    pub fn assign_pixel_plane(&mut self, y: usize, x: usize, plane: &DynArray) -> AcqResult<()> {
        if self.ndim() != 5 || plane.ndim() != 2 {
            return Err(AcqError::External(
                "assign_pixel_plane expects a 5-D target and 2-D source".into(),
            ));
        }
        let (nc, nt) = (plane.shape()[0], plane.shape()[1]);
        if nc != self.shape()[0] || nt != self.shape()[1] {
            return Err(AcqError::External(format!(
                "plane {:?} does not match CT dimensions {:?}",
                plane.shape(),
                &self.shape()[..2]
            )));
        }
        let flat = plane.to_f64_vec();
        let mut i = 0;
        with_array!(self, a => {
            for c in 0..nc {
                for t in 0..nt {
                    a[IxDyn(&[c, t, 0, y, x])] = flat[i] as _;
                    i += 1;
                }
            }
        });
        Ok(())
    }
}

fn flat_reshape<T: Clone>(a: ArrayD<T>, shape: &[usize]) -> AcqResult<ArrayD<T>> {
    let flat: Vec<T> = a.iter().cloned().collect();
    ArrayD::from_shape_vec(IxDyn(shape), flat)
        .map_err(|e| AcqError::External(format!("reshape failed: {e}")))
}

/// An immutable typed array plus the metadata describing its acquisition.
#[derive(Debug, Clone)]
pub struct DataArray {
    pub data: DynArray,
    pub metadata: Metadata,
}

impl DataArray {
    pub fn new(data: DynArray, metadata: Metadata) -> Self {
        Self { data, metadata }
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulator_widening() {
        // u16 max over 16 samples still fits u32
        assert_eq!(
            Dtype::for_accumulation(Dtype::U16, 65535.0, 16),
            Dtype::U32
        );
        // but 2^20 samples does not
        assert_eq!(
            Dtype::for_accumulation(Dtype::U16, 65535.0, 1 << 20),
            Dtype::U64
        );
        assert_eq!(Dtype::for_accumulation(Dtype::F64, 1.0, 4), Dtype::F64);
    }

    #[test]
    fn test_add_assign_widened() {
        let tile = DynArray::from_u16(&[2, 2], vec![1, 2, 3, 4]).unwrap();
        let mut acc = DynArray::zeros(Dtype::U32, &[2, 2]);
        acc.add_assign_widened(&tile).unwrap();
        acc.add_assign_widened(&tile).unwrap();
        assert_eq!(acc.at(&[1, 1]), 8.0);
        assert_eq!(acc.sum_f64(), 20.0);
    }

    #[test]
    fn test_invert_and_baseline() {
        let mut a = DynArray::from_u16(&[3], vec![0, 10, 100]).unwrap();
        a.invert(4095.0);
        assert_eq!(a.at(&[0]), 4095.0);
        assert_eq!(a.at(&[2]), 3995.0);

        let mut b = DynArray::from_u16(&[3], vec![5, 100, 200]).unwrap();
        b.subtract_baseline(50.0);
        // clamped at zero, not wrapped
        assert_eq!(b.at(&[0]), 0.0);
        assert_eq!(b.at(&[1]), 50.0);
    }

    #[test]
    fn test_assign_rows() {
        let mut out = DynArray::zeros(Dtype::U16, &[4, 3]);
        let block = DynArray::from_u16(&[2, 3], vec![1, 2, 3, 4, 5, 6]).unwrap();
        out.assign_rows(2, &block).unwrap();
        assert_eq!(out.at(&[2, 0]), 1.0);
        assert_eq!(out.at(&[3, 2]), 6.0);
        assert_eq!(out.at(&[0, 0]), 0.0);
    }

    #[test]
    fn test_assign_pixel_vector() {
        let mut cube = DynArray::zeros(Dtype::U16, &[3, 1, 1, 2, 2]);
        let spectrum = DynArray::from_u16(&[3], vec![7, 8, 9]).unwrap();
        cube.assign_pixel_vector(1, 0, &spectrum).unwrap();
        assert_eq!(cube.at(&[2, 0, 0, 1, 0]), 9.0);
        assert_eq!(cube.at(&[2, 0, 0, 0, 0]), 0.0);
    }

    #[test]
    fn test_reshape_mismatch_is_error() {
        let a = DynArray::from_u16(&[4], vec![1, 2, 3, 4]).unwrap();
        assert!(a.into_shape(&[3]).is_err());
    }
}
