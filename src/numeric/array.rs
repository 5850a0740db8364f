//! `Array`, the N-dimensional numeric value stored in contexts.
//!
//! Storage is an `ndarray::ArrayD<f64>` behind an `Arc`, so cloning an
//! `Array` is cheap and two clones share identity (`Array::ptr_eq`).
//! Operations never mutate in place: `put`, `put_mask` and friends return a
//! fresh array that the caller rebinds.
//!
//! The leading axis is the "row" axis used by every filtering operation
//! (`take`, `compress`, `put`, `row_is_finite`).

use crate::error::{FlowError, Result};
use crate::numeric::{BinaryOp, DType};
use ndarray::{Array1, ArrayD, Axis, IxDyn, Zip};
use std::fmt;
use std::sync::Arc;

#[derive(Clone)]
pub struct Array {
    data: Arc<ArrayD<f64>>,
    dtype: DType,
    units: Option<String>,
}

impl Array {
    pub fn new(data: ArrayD<f64>, dtype: DType) -> Self {
        Self {
            data: Arc::new(data),
            dtype,
            units: None,
        }
    }

    /// One-dimensional float array.
    pub fn from_vec(values: Vec<f64>) -> Self {
        Self::new(Array1::from_vec(values).into_dyn(), DType::Float)
    }

    /// One-dimensional integer array.
    pub fn from_ints(values: Vec<i64>) -> Self {
        let mut array = Self::from_vec(values.into_iter().map(|v| v as f64).collect());
        array.dtype = DType::Int;
        array
    }

    /// One-dimensional boolean mask.
    pub fn from_bools(values: Vec<bool>) -> Self {
        let mut array = Self::from_vec(values.into_iter().map(|b| if b { 1.0 } else { 0.0 }).collect());
        array.dtype = DType::Bool;
        array
    }

    pub fn from_shape_vec(shape: &[usize], values: Vec<f64>, dtype: DType) -> Result<Self> {
        let data = ArrayD::from_shape_vec(IxDyn(shape), values).map_err(|e| {
            FlowError::numeric("<array>", format!("cannot build array of shape {shape:?}: {e}"))
        })?;
        Ok(Self::new(data, dtype))
    }

    /// Rank-0 array holding a single value.
    pub fn scalar(value: f64) -> Self {
        Self::new(ArrayD::from_elem(IxDyn(&[]), value), DType::Float)
    }

    pub fn full(shape: &[usize], value: f64) -> Self {
        Self::new(ArrayD::from_elem(IxDyn(shape), value), DType::Float)
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self::full(shape, 0.0)
    }

    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn units(&self) -> Option<&str> {
        self.units.as_deref()
    }

    pub fn set_units(&mut self, units: Option<String>) {
        self.units = units;
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn ndim(&self) -> usize {
        self.data.ndim()
    }

    /// Length of the leading axis (0 for rank-0 arrays).
    pub fn len(&self) -> usize {
        self.shape().first().copied().unwrap_or(0)
    }

    /// Total number of elements.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Rank-0 arrays are values, not pipeline data: they never become items.
    pub fn is_pipeline_data(&self) -> bool {
        self.ndim() > 0
    }

    pub fn view(&self) -> &ArrayD<f64> {
        &self.data
    }

    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        self.data.iter().copied()
    }

    pub fn to_vec(&self) -> Vec<f64> {
        self.iter().collect()
    }

    /// Single value for rank-0 or one-element arrays.
    pub fn as_scalar(&self) -> Option<f64> {
        if self.size() == 1 {
            self.data.iter().next().copied()
        } else {
            None
        }
    }

    /// Row `index` along the leading axis.
    pub fn row(&self, index: usize) -> Result<Array> {
        if index >= self.len() {
            return Err(FlowError::numeric(
                "<array>",
                format!("index {index} out of bounds for length {}", self.len()),
            ));
        }
        let row = self.data.index_axis(Axis(0), index).to_owned();
        Ok(self.derive(row, self.dtype))
    }

    /// Pointer identity: true when both arrays share the same buffer.
    pub fn ptr_eq(&self, other: &Array) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    fn derive(&self, data: ArrayD<f64>, dtype: DType) -> Array {
        Array {
            data: Arc::new(data),
            dtype,
            units: self.units.clone(),
        }
    }

    // ── Elementwise ──

    /// Apply `op` elementwise, broadcasting either operand.
    pub fn binary(&self, other: &Array, op: BinaryOp) -> Result<Array> {
        let data = self.zip_with(other, |a, b| op.apply(a, b))?;
        let dtype = op.result_dtype(self.dtype, other.dtype);
        let units = if op.keeps_units() {
            self.units.clone().or_else(|| other.units.clone())
        } else {
            None
        };
        Ok(Array {
            data: Arc::new(data),
            dtype,
            units,
        })
    }

    fn zip_with(&self, other: &Array, f: impl Fn(f64, f64) -> f64) -> Result<ArrayD<f64>> {
        if self.shape() == other.shape() {
            return Ok(Zip::from(&*self.data)
                .and(&*other.data)
                .map_collect(|&a, &b| f(a, b)));
        }
        if let Some(rhs) = other.data.broadcast(self.data.raw_dim()) {
            return Ok(Zip::from(&*self.data).and(&rhs).map_collect(|&a, &b| f(a, b)));
        }
        if let Some(lhs) = self.data.broadcast(other.data.raw_dim()) {
            return Ok(Zip::from(&lhs).and(&*other.data).map_collect(|&a, &b| f(a, b)));
        }
        Err(FlowError::numeric(
            "<array>",
            format!(
                "operands could not be broadcast together with shapes {:?} {:?}",
                self.shape(),
                other.shape()
            ),
        ))
    }

    /// Combine two arrays elementwise with broadcasting. The result is
    /// untagged.
    pub fn zip_map(&self, other: &Array, dtype: DType, f: impl Fn(f64, f64) -> f64) -> Result<Array> {
        let data = self.zip_with(other, f)?;
        Ok(Array {
            data: Arc::new(data),
            dtype,
            units: None,
        })
    }

    /// numpy `where`: elements of `a` where `condition` holds, else `b`.
    pub fn select(condition: &Array, a: &Array, b: &Array) -> Result<Array> {
        let shape = broadcast_shape(condition.shape(), a.shape())
            .and_then(|s| broadcast_shape(&s, b.shape()))
            .ok_or_else(|| {
                FlowError::numeric(
                    "<array>",
                    format!(
                        "where() operands could not be broadcast together with shapes {:?} {:?} {:?}",
                        condition.shape(),
                        a.shape(),
                        b.shape()
                    ),
                )
            })?;
        let dim = IxDyn(&shape);
        let broadcast_error = || FlowError::numeric("<array>", "broadcast failed");
        let c = condition.data.broadcast(dim.clone()).ok_or_else(broadcast_error)?;
        let x = a.data.broadcast(dim.clone()).ok_or_else(broadcast_error)?;
        let y = b.data.broadcast(dim).ok_or_else(broadcast_error)?;
        let data = Zip::from(&c)
            .and(&x)
            .and(&y)
            .map_collect(|&c, &x, &y| if truthy(c) { x } else { y });
        Ok(Array {
            data: Arc::new(data),
            dtype: a.dtype.promote(b.dtype),
            units: a.units.clone().or_else(|| b.units.clone()),
        })
    }

    pub fn map(&self, f: impl Fn(f64) -> f64) -> Array {
        let dtype = if self.dtype == DType::Bool {
            DType::Float
        } else {
            self.dtype
        };
        self.derive(self.data.mapv(f), dtype)
    }

    pub fn map_float(&self, f: impl Fn(f64) -> f64) -> Array {
        self.derive(self.data.mapv(f), DType::Float)
    }

    pub fn logical_not(&self) -> Array {
        let mut out = self.derive(self.data.mapv(|v| if truthy(v) { 0.0 } else { 1.0 }), DType::Bool);
        out.units = None;
        out
    }

    pub fn cast(&self, dtype: DType) -> Array {
        let data = match dtype {
            DType::Bool => self.data.mapv(|v| if truthy(v) { 1.0 } else { 0.0 }),
            DType::Int => self.data.mapv(f64::trunc),
            DType::Float => (*self.data).clone(),
        };
        self.derive(data, dtype)
    }

    // ── Gathering along the leading axis ──

    /// Gather rows by index (numpy `take` along axis 0).
    pub fn take(&self, indices: &[usize]) -> Result<Array> {
        self.require_rows("take")?;
        let len = self.len();
        if let Some(bad) = indices.iter().find(|&&i| i >= len) {
            return Err(FlowError::numeric(
                "<array>",
                format!("index {bad} out of bounds for length {len}"),
            ));
        }
        Ok(self.derive(self.data.select(Axis(0), indices), self.dtype))
    }

    /// Gather rows where `mask` is nonzero (numpy `compress` along axis 0).
    pub fn compress(&self, mask: &Array) -> Result<Array> {
        self.check_mask(mask)?;
        self.take(&mask.nonzero())
    }

    /// Indices of nonzero entries of a one-dimensional array. NaN counts as zero.
    pub fn nonzero(&self) -> Vec<usize> {
        self.data
            .iter()
            .enumerate()
            .filter(|(_, &v)| truthy(v))
            .map(|(i, _)| i)
            .collect()
    }

    /// Number of truthy entries.
    pub fn count_nonzero(&self) -> usize {
        self.data.iter().filter(|&&v| truthy(v)).count()
    }

    /// Return a copy with rows at `indices` replaced by the rows of `values`.
    ///
    /// `values` either has one row per index or broadcasts to a single row.
    pub fn put(&self, indices: &[usize], values: &Array) -> Result<Array> {
        self.require_rows("put")?;
        let len = self.len();
        if let Some(bad) = indices.iter().find(|&&i| i >= len) {
            return Err(FlowError::numeric(
                "<array>",
                format!("index {bad} out of bounds for length {len}"),
            ));
        }
        let row_shape = &self.shape()[1..];
        let per_row = values.ndim() == self.ndim() && values.len() == indices.len();
        if !per_row && values.size() != 1 && values.shape() != row_shape {
            return Err(FlowError::numeric(
                "<array>",
                format!(
                    "cannot put {} values of shape {:?} into {} rows",
                    values.len(),
                    values.shape(),
                    indices.len()
                ),
            ));
        }

        let mut out = (*self.data).clone();
        for (j, &i) in indices.iter().enumerate() {
            let mut target = out.index_axis_mut(Axis(0), i);
            if per_row {
                target.assign(&values.data.index_axis(Axis(0), j));
            } else if let Some(v) = values.as_scalar() {
                target.fill(v);
            } else {
                target.assign(&*values.data);
            }
        }
        let dtype = self.dtype.promote(values.dtype);
        Ok(self.derive(out, dtype))
    }

    /// numpy `putmask`: set positions where `mask` is nonzero, cycling `values`.
    pub fn put_mask(&self, mask: &Array, values: &Array) -> Result<Array> {
        if mask.shape() != self.shape() {
            return Err(FlowError::numeric(
                "<array>",
                format!(
                    "mask shape {:?} does not match array shape {:?}",
                    mask.shape(),
                    self.shape()
                ),
            ));
        }
        if values.is_empty() {
            return Ok(self.clone());
        }
        let source: Vec<f64> = values.to_vec();
        let mut out = (*self.data).clone();
        for (position, (slot, &m)) in out.iter_mut().zip(mask.data.iter()).enumerate() {
            if truthy(m) {
                *slot = source[position % source.len()];
            }
        }
        Ok(self.derive(out, self.dtype.promote(values.dtype)))
    }

    /// Copy with rows where `mask` is zero replaced by `fill`.
    pub fn fill_unselected(&self, mask: &Array, fill: f64) -> Result<Array> {
        self.check_mask(mask)?;
        let mut out = (*self.data).clone();
        for (i, &m) in mask.data.iter().enumerate() {
            if !truthy(m) {
                out.index_axis_mut(Axis(0), i).fill(fill);
            }
        }
        let dtype = if fill.fract() != 0.0 || fill.is_nan() {
            DType::Float
        } else {
            self.dtype
        };
        Ok(self.derive(out, dtype))
    }

    pub fn reshape(&self, shape: &[usize]) -> Result<Array> {
        let reshaped = self
            .data
            .to_shape(shape.to_vec())
            .map_err(|e| {
                FlowError::numeric(
                    "<array>",
                    format!("cannot reshape {:?} into {:?}: {e}", self.shape(), shape),
                )
            })?
            .into_owned();
        Ok(self.derive(reshaped, self.dtype))
    }

    /// Join arrays along the leading axis.
    pub fn concatenate(arrays: &[Array]) -> Result<Array> {
        let first = arrays
            .first()
            .ok_or_else(|| FlowError::eval("concatenate needs at least one array"))?;
        let views: Vec<_> = arrays.iter().map(|a| a.data.view()).collect();
        let joined = ndarray::concatenate(Axis(0), &views).map_err(|e| {
            FlowError::numeric("<array>", format!("cannot concatenate arrays: {e}"))
        })?;
        let dtype = arrays
            .iter()
            .fold(first.dtype, |acc, a| acc.promote(a.dtype));
        Ok(first.derive(joined, dtype))
    }

    /// True for each leading-axis row whose elements are all finite.
    pub fn row_is_finite(&self) -> Vec<bool> {
        if self.ndim() == 0 {
            return Vec::new();
        }
        self.data
            .axis_iter(Axis(0))
            .map(|row| row.iter().all(|v| v.is_finite()))
            .collect()
    }

    // ── Reductions ──

    pub fn sum(&self) -> f64 {
        self.data.sum()
    }

    pub fn mean(&self) -> f64 {
        if self.is_empty() {
            f64::NAN
        } else {
            self.sum() / self.size() as f64
        }
    }

    pub fn min(&self) -> f64 {
        self.data.iter().copied().fold(f64::INFINITY, f64::min)
    }

    pub fn max(&self) -> f64 {
        self.data.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    pub fn all(&self) -> bool {
        self.data.iter().all(|&v| truthy(v))
    }

    pub fn any(&self) -> bool {
        self.data.iter().any(|&v| truthy(v))
    }

    fn require_rows(&self, operation: &str) -> Result<()> {
        if self.ndim() == 0 {
            return Err(FlowError::numeric(
                "<array>",
                format!("{operation} needs an array with at least one dimension"),
            ));
        }
        Ok(())
    }

    fn check_mask(&self, mask: &Array) -> Result<()> {
        self.require_rows("mask")?;
        if mask.ndim() != 1 || mask.len() != self.len() {
            return Err(FlowError::numeric(
                "<mask>",
                format!(
                    "mask of shape {:?} does not match leading length {}",
                    mask.shape(),
                    self.len()
                ),
            ));
        }
        Ok(())
    }
}

fn broadcast_shape(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let n = a.len().max(b.len());
    let dim = |shape: &[usize], i: usize| {
        let offset = n - shape.len();
        if i < offset {
            1
        } else {
            shape[i - offset]
        }
    };
    (0..n)
        .map(|i| match (dim(a, i), dim(b, i)) {
            (x, y) if x == y || y == 1 => Some(x),
            (1, y) => Some(y),
            _ => None,
        })
        .collect()
}

/// Truthiness of a stored element. NaN is false.
#[inline]
pub fn truthy(v: f64) -> bool {
    v != 0.0 && !v.is_nan()
}

impl PartialEq for Array {
    fn eq(&self, other: &Self) -> bool {
        self.shape() == other.shape() && self.data.iter().eq(other.data.iter())
    }
}

impl fmt::Debug for Array {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Array<{:?}{:?}>{}", self.dtype, self.shape(), self)?;
        if let Some(units) = &self.units {
            write!(f, " [{units}]")?;
        }
        Ok(())
    }
}

impl fmt::Display for Array {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ndim() == 0 {
            return write!(f, "{}", self.as_scalar().unwrap_or(f64::NAN));
        }
        write!(f, "[")?;
        for (i, v) in self.data.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match self.dtype {
                DType::Bool => write!(f, "{}", truthy(*v))?,
                DType::Int => write!(f, "{}", *v as i64)?,
                DType::Float => write!(f, "{v}")?,
            }
        }
        write!(f, "]")
    }
}

impl From<Vec<f64>> for Array {
    fn from(values: Vec<f64>) -> Self {
        Array::from_vec(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compress_and_take() {
        let depth = Array::from_vec(vec![0.0, 10.0, 20.0, 30.0, 40.0, 50.0]);
        let mask = Array::from_bools(vec![false, false, true, true, true, true]);
        assert_eq!(depth.compress(&mask).unwrap().to_vec(), vec![20.0, 30.0, 40.0, 50.0]);
        assert_eq!(depth.take(&[5, 0]).unwrap().to_vec(), vec![50.0, 0.0]);
        assert!(depth.take(&[6]).is_err());
    }

    #[test]
    fn test_empty_mask_keeps_dtype() {
        let ints = Array::from_ints(vec![1, 2, 3]);
        let none = Array::from_bools(vec![false, false, false]);
        let out = ints.compress(&none).unwrap();
        assert_eq!(out.len(), 0);
        assert_eq!(out.dtype(), DType::Int);
    }

    #[test]
    fn test_broadcast_comparison() {
        let a = Array::from_vec(vec![1.0, 5.0, 10.0]);
        let mask = a.binary(&Array::scalar(4.0), BinaryOp::Gt).unwrap();
        assert_eq!(mask.dtype(), DType::Bool);
        assert_eq!(mask.to_vec(), vec![0.0, 1.0, 1.0]);
    }

    #[test]
    fn test_incompatible_shapes() {
        let a = Array::from_vec(vec![1.0, 2.0, 3.0]);
        let b = Array::from_vec(vec![1.0, 2.0]);
        assert!(a.binary(&b, BinaryOp::Add).is_err());
    }

    #[test]
    fn test_put_rows() {
        let x = Array::from_vec(vec![1.0, 2.0, 3.0, 4.0]);
        let out = x.put(&[3, 1, 0], &Array::from_vec(vec![90.0, 80.0, 70.0])).unwrap();
        assert_eq!(out.to_vec(), vec![70.0, 80.0, 3.0, 90.0]);
        // Original untouched
        assert_eq!(x.to_vec(), vec![1.0, 2.0, 3.0, 4.0]);
        assert!(!out.ptr_eq(&x));
    }

    #[test]
    fn test_put_mask_cycles_values() {
        let x = Array::from_vec(vec![0.0; 5]);
        let mask = Array::from_bools(vec![true, false, true, true, false]);
        let out = x.put_mask(&mask, &Array::from_vec(vec![7.0, 8.0])).unwrap();
        assert_eq!(out.to_vec(), vec![7.0, 0.0, 7.0, 8.0, 0.0]);
    }

    #[test]
    fn test_fill_unselected() {
        let x = Array::from_vec(vec![1.0, 2.0, 3.0]);
        let mask = Array::from_bools(vec![true, false, true]);
        let out = x.fill_unselected(&mask, -1.0).unwrap();
        assert_eq!(out.to_vec(), vec![1.0, -1.0, 3.0]);
    }

    #[test]
    fn test_row_is_finite_2d() {
        let grid = Array::from_shape_vec(
            &[3, 2],
            vec![1.0, 2.0, f64::NAN, 4.0, 5.0, f64::INFINITY],
            DType::Float,
        )
        .unwrap();
        assert_eq!(grid.row_is_finite(), vec![true, false, false]);
    }

    #[test]
    fn test_reshape_and_concatenate() {
        let a = Array::from_vec(vec![1.0, 2.0, 3.0, 4.0]);
        let grid = a.reshape(&[2, 2]).unwrap();
        assert_eq!(grid.shape(), &[2, 2]);
        let joined = Array::concatenate(&[grid.clone(), grid]).unwrap();
        assert_eq!(joined.shape(), &[4, 2]);
        assert!(a.reshape(&[3]).is_err());
    }

    #[test]
    fn test_nan_is_not_selected() {
        let mask = Array::from_vec(vec![f64::NAN, 1.0, 0.0, 2.0]);
        assert_eq!(mask.nonzero(), vec![1, 3]);
    }

    #[test]
    fn test_select_broadcasts_scalar_branch() {
        let cond = Array::from_bools(vec![true, false, true]);
        let a = Array::from_vec(vec![1.0, 2.0, 3.0]);
        let out = Array::select(&cond, &a, &Array::scalar(-1.0)).unwrap();
        assert_eq!(out.to_vec(), vec![1.0, -1.0, 3.0]);
        assert!(Array::select(&cond, &a, &Array::zeros(&[2])).is_err());
    }
}
