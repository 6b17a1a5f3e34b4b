//! Host-side tensor storage and the borrowed views handed to backends.

use serde::{Deserialize, Serialize};

use crate::backend::{BackendError, BackendResult};
use crate::error::{RuntimeError, RuntimeResult};
use crate::layout::{element_count, DType, Dims};

/// Typed flat storage. Also the element type of a memory pool slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TensorData {
    F32(Vec<f32>),
    I32(Vec<i32>),
    U8(Vec<u8>),
}

impl TensorData {
    pub fn empty(dtype: DType) -> Self {
        match dtype {
            DType::F32 => TensorData::F32(Vec::new()),
            DType::I32 => TensorData::I32(Vec::new()),
            DType::U8 => TensorData::U8(Vec::new()),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            TensorData::F32(_) => DType::F32,
            TensorData::I32(_) => DType::I32,
            TensorData::U8(_) => DType::U8,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(values) => values.len(),
            TensorData::I32(values) => values.len(),
            TensorData::U8(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn byte_len(&self) -> usize {
        self.len() * self.dtype().size_in_bytes()
    }

    /// Grows the storage to `len` zeroed elements, reporting allocator failure instead of
    /// aborting. Never shrinks.
    pub fn try_grow(&mut self, len: usize) -> Result<(), std::collections::TryReserveError> {
        fn grow<T: Clone + Default>(
            values: &mut Vec<T>,
            len: usize,
        ) -> Result<(), std::collections::TryReserveError> {
            if values.len() >= len {
                return Ok(());
            }
            values.try_reserve_exact(len - values.len())?;
            values.resize(len, T::default());
            Ok(())
        }
        match self {
            TensorData::F32(values) => grow(values, len),
            TensorData::I32(values) => grow(values, len),
            TensorData::U8(values) => grow(values, len),
        }
    }

    /// Borrows the first `len` elements.
    pub fn view(&self, len: usize) -> BackendResult<DataRef<'_>> {
        if len > self.len() {
            return Err(BackendError::execution(format!(
                "view of {len} elements exceeds storage of {}",
                self.len()
            )));
        }
        Ok(match self {
            TensorData::F32(values) => DataRef::F32(&values[..len]),
            TensorData::I32(values) => DataRef::I32(&values[..len]),
            TensorData::U8(values) => DataRef::U8(&values[..len]),
        })
    }

    pub fn view_mut(&mut self, len: usize) -> BackendResult<DataMut<'_>> {
        if len > self.len() {
            return Err(BackendError::execution(format!(
                "view of {len} elements exceeds storage of {}",
                self.len()
            )));
        }
        Ok(match self {
            TensorData::F32(values) => DataMut::F32(&mut values[..len]),
            TensorData::I32(values) => DataMut::I32(&mut values[..len]),
            TensorData::U8(values) => DataMut::U8(&mut values[..len]),
        })
    }

    /// Copies `source` into the front of this storage. Dtypes must agree.
    pub fn copy_from(&mut self, source: &TensorData) -> BackendResult<()> {
        match (self, source) {
            (TensorData::F32(dst), TensorData::F32(src)) => copy_prefix(dst, src),
            (TensorData::I32(dst), TensorData::I32(src)) => copy_prefix(dst, src),
            (TensorData::U8(dst), TensorData::U8(src)) => copy_prefix(dst, src),
            (dst, src) => Err(BackendError::execution(format!(
                "cannot copy {:?} data into {:?} storage",
                src.dtype(),
                dst.dtype()
            ))),
        }
    }

    /// Clones the first `len` elements into a fresh vector.
    pub fn prefix(&self, len: usize) -> BackendResult<TensorData> {
        Ok(match self.view(len)? {
            DataRef::F32(values) => TensorData::F32(values.to_vec()),
            DataRef::I32(values) => TensorData::I32(values.to_vec()),
            DataRef::U8(values) => TensorData::U8(values.to_vec()),
        })
    }
}

fn copy_prefix<T: Copy>(dst: &mut [T], src: &[T]) -> BackendResult<()> {
    if src.len() > dst.len() {
        return Err(BackendError::execution(format!(
            "source of {} elements does not fit storage of {}",
            src.len(),
            dst.len()
        )));
    }
    dst[..src.len()].copy_from_slice(src);
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub enum DataRef<'a> {
    F32(&'a [f32]),
    I32(&'a [i32]),
    U8(&'a [u8]),
}

#[derive(Debug)]
pub enum DataMut<'a> {
    F32(&'a mut [f32]),
    I32(&'a mut [i32]),
    U8(&'a mut [u8]),
}

impl DataRef<'_> {
    pub fn dtype(&self) -> DType {
        match self {
            DataRef::F32(_) => DType::F32,
            DataRef::I32(_) => DType::I32,
            DataRef::U8(_) => DType::U8,
        }
    }
}

impl DataMut<'_> {
    pub fn dtype(&self) -> DType {
        match self {
            DataMut::F32(_) => DType::F32,
            DataMut::I32(_) => DType::I32,
            DataMut::U8(_) => DType::U8,
        }
    }
}

/// Read-only tensor argument of `Implementation::execute`.
#[derive(Debug, Clone, Copy)]
pub struct TensorView<'a> {
    pub dims: &'a [usize],
    pub data: DataRef<'a>,
}

impl<'a> TensorView<'a> {
    pub fn new(dims: &'a [usize], data: DataRef<'a>) -> Self {
        Self { dims, data }
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn as_f32(&self) -> BackendResult<&'a [f32]> {
        match self.data {
            DataRef::F32(values) => Ok(values),
            other => Err(dtype_mismatch(DType::F32, other.dtype())),
        }
    }

    pub fn as_i32(&self) -> BackendResult<&'a [i32]> {
        match self.data {
            DataRef::I32(values) => Ok(values),
            other => Err(dtype_mismatch(DType::I32, other.dtype())),
        }
    }

    pub fn as_u8(&self) -> BackendResult<&'a [u8]> {
        match self.data {
            DataRef::U8(values) => Ok(values),
            other => Err(dtype_mismatch(DType::U8, other.dtype())),
        }
    }
}

/// Writable tensor argument of `Implementation::execute`.
#[derive(Debug)]
pub struct TensorViewMut<'a> {
    pub dims: &'a [usize],
    pub data: DataMut<'a>,
}

impl<'a> TensorViewMut<'a> {
    pub fn new(dims: &'a [usize], data: DataMut<'a>) -> Self {
        Self { dims, data }
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn as_f32_mut(&mut self) -> BackendResult<&mut [f32]> {
        match &mut self.data {
            DataMut::F32(values) => Ok(&mut **values),
            other => Err(dtype_mismatch(DType::F32, other.dtype())),
        }
    }

    pub fn as_i32_mut(&mut self) -> BackendResult<&mut [i32]> {
        match &mut self.data {
            DataMut::I32(values) => Ok(&mut **values),
            other => Err(dtype_mismatch(DType::I32, other.dtype())),
        }
    }

    pub fn as_u8_mut(&mut self) -> BackendResult<&mut [u8]> {
        match &mut self.data {
            DataMut::U8(values) => Ok(&mut **values),
            other => Err(dtype_mismatch(DType::U8, other.dtype())),
        }
    }
}

fn dtype_mismatch(expected: DType, actual: DType) -> BackendError {
    BackendError::execution(format!("expected {expected:?} tensor, got {actual:?}"))
}

/// Owned tensor used for parameter bindings, constants and program outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostTensor {
    pub dims: Dims,
    pub data: TensorData,
}

impl HostTensor {
    pub fn new(dims: &[usize], data: TensorData) -> RuntimeResult<Self> {
        let expected = element_count(dims).ok_or_else(|| RuntimeError::InvalidGraph {
            reason: format!("tensor extents {dims:?} overflow"),
        })?;
        if expected != data.len() {
            return Err(RuntimeError::InvalidGraph {
                reason: format!(
                    "tensor extents {dims:?} need {expected} elements, got {}",
                    data.len()
                ),
            });
        }
        Ok(Self {
            dims: Dims::from_slice(dims),
            data,
        })
    }

    pub fn from_f32(dims: &[usize], values: Vec<f32>) -> RuntimeResult<Self> {
        Self::new(dims, TensorData::F32(values))
    }

    pub fn from_i32(dims: &[usize], values: Vec<i32>) -> RuntimeResult<Self> {
        Self::new(dims, TensorData::I32(values))
    }

    pub fn full_f32(dims: &[usize], value: f32) -> Self {
        let len = dims.iter().product();
        Self {
            dims: Dims::from_slice(dims),
            data: TensorData::F32(vec![value; len]),
        }
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            TensorData::F32(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<&[i32]> {
        match &self.data {
            TensorData::I32(values) => Some(values),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_tensor_rejects_length_mismatch() {
        let err = HostTensor::from_f32(&[2, 3], vec![0.0; 5]).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidGraph { .. }));
    }

    #[test]
    fn grow_keeps_prefix_and_zero_fills() {
        let mut data = TensorData::F32(vec![1.0, 2.0]);
        data.try_grow(4).expect("grow");
        assert_eq!(data, TensorData::F32(vec![1.0, 2.0, 0.0, 0.0]));
        data.try_grow(1).expect("no shrink");
        assert_eq!(data.len(), 4);
    }

    #[test]
    fn copy_between_dtypes_is_rejected() {
        let mut dst = TensorData::I32(vec![0; 4]);
        let src = TensorData::F32(vec![1.0]);
        assert!(dst.copy_from(&src).is_err());
    }
}
