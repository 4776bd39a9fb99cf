//! Dense host arrays backed by [`candle_core::Tensor`].
//!
//! [`HostArray`] is the data-carrying leaf of the tensor containers and the buffer type exchanged by the host
//! collectives in [`crate::runtime`]. It wraps a CPU tensor whose element type is fixed by `E` and adds the shape
//! checks the sharded transformer relies on (regions, concatenation, splitting, axis permutation) with errors that
//! name the offending shapes. Higher-level kernels (layer norm, rotary encoding, attention) live next to the layer
//! code that uses them in [`crate::layers`].

use std::marker::PhantomData;
use std::ops::Range;

use candle_core::{DType, Device, Tensor, WithDType};
use thiserror::Error;

use crate::parameters::Parameter;
use crate::types::DataType;

/// Error type for [`HostArray`] construction and shape operations.
#[derive(Error, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ArrayError {
    #[error("shape {shape:?} implies {expected} element(s), but got {actual}")]
    ElementCountMismatch { shape: Vec<usize>, expected: usize, actual: usize },

    #[error("expected an array of rank {expected}, but got rank {actual}")]
    RankMismatch { expected: usize, actual: usize },

    #[error("incompatible shapes {lhs:?} and {rhs:?} for {operation}")]
    IncompatibleShapes { operation: String, lhs: Vec<usize>, rhs: Vec<usize> },

    #[error("axis {axis} is out of range for an array of rank {rank}")]
    AxisOutOfRange { axis: usize, rank: usize },

    #[error("region at offsets {offsets:?} with shape {region_shape:?} does not fit in shape {shape:?}")]
    RegionOutOfBounds { offsets: Vec<usize>, region_shape: Vec<usize>, shape: Vec<usize> },

    #[error("axis {axis} of size {size} cannot be split into {parts} equal part(s)")]
    IndivisibleSplit { axis: usize, size: usize, parts: usize },

    #[error("cannot concatenate an empty list of arrays")]
    EmptyConcatenation,

    #[error("{permutation:?} is not a permutation of the axes of an array of rank {rank}")]
    InvalidPermutation { permutation: Vec<usize>, rank: usize },

    #[error("expected a tensor of {expected} elements, but got {actual}")]
    DTypeMismatch { expected: String, actual: String },

    #[error("tensor operation failed: {message}")]
    Tensor { message: String },
}

impl From<candle_core::Error> for ArrayError {
    fn from(error: candle_core::Error) -> Self {
        ArrayError::Tensor { message: error.to_string() }
    }
}

/// Dense array stored in host memory as a CPU [`Tensor`] with elements of type `E`.
///
/// The element type defaults to `f32`, which is what activations, weights, and caches use. Token ids and lengths are
/// carried as `HostArray<u32>`. Every array is kept contiguous, so row-major element order is well defined.
#[derive(Clone, Debug)]
pub struct HostArray<E = f32> {
    tensor: Tensor,
    element: PhantomData<E>,
}

impl<E> Parameter for HostArray<E> {}

impl<E: WithDType> PartialEq for HostArray<E> {
    fn eq(&self, other: &Self) -> bool {
        self.shape() == other.shape() && matches!((self.to_vec(), other.to_vec()), (Ok(lhs), Ok(rhs)) if lhs == rhs)
    }
}

impl<E: WithDType> HostArray<E> {
    /// Creates an array from its shape and row-major data.
    pub fn new(shape: Vec<usize>, data: Vec<E>) -> Result<Self, ArrayError> {
        let expected = shape.iter().product::<usize>();
        if data.len() != expected {
            return Err(ArrayError::ElementCountMismatch { shape, expected, actual: data.len() });
        }
        Ok(Self::wrap(Tensor::from_vec(data, shape, &Device::Cpu)?))
    }

    /// Wraps `tensor`, which must hold elements of type `E`. The tensor is moved to the host and made contiguous.
    pub fn from_tensor(tensor: Tensor) -> Result<Self, ArrayError> {
        if tensor.dtype() != E::DTYPE {
            return Err(ArrayError::DTypeMismatch {
                expected: E::DTYPE.as_str().to_string(),
                actual: tensor.dtype().as_str().to_string(),
            });
        }
        Ok(Self::wrap(tensor.to_device(&Device::Cpu)?.contiguous()?))
    }

    /// Creates an array with every element set to `value`.
    pub fn full(shape: Vec<usize>, value: E) -> Result<Self, ArrayError> {
        let count = shape.iter().product::<usize>();
        Self::new(shape, vec![value; count])
    }

    /// Creates an array filled with zeros.
    pub fn zeros(shape: Vec<usize>) -> Result<Self, ArrayError> {
        Ok(Self::wrap(Tensor::zeros(shape, E::DTYPE, &Device::Cpu)?))
    }

    /// Creates an array whose element at each multi-index is `element_fn(index)`.
    pub fn from_fn<F: FnMut(&[usize]) -> E>(shape: Vec<usize>, mut element_fn: F) -> Result<Self, ArrayError> {
        let element_count = shape.iter().product::<usize>();
        let mut data = Vec::with_capacity(element_count);
        let mut index = vec![0usize; shape.len()];
        for _ in 0..element_count {
            data.push(element_fn(index.as_slice()));
            for axis in (0..shape.len()).rev() {
                index[axis] += 1;
                if index[axis] < shape[axis] {
                    break;
                }
                index[axis] = 0;
            }
        }
        Self::new(shape, data)
    }

    /// Underlying tensor.
    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    /// Shape of this array.
    pub fn shape(&self) -> &[usize] {
        self.tensor.dims()
    }

    /// Rank (i.e., number of dimensions) of this array.
    pub fn rank(&self) -> usize {
        self.tensor.rank()
    }

    /// Size of dimension `axis`.
    pub fn dim(&self, axis: usize) -> Result<usize, ArrayError> {
        self.shape().get(axis).copied().ok_or(ArrayError::AxisOutOfRange { axis, rank: self.rank() })
    }

    /// Number of elements in this array.
    pub fn len(&self) -> usize {
        self.tensor.elem_count()
    }

    /// Returns `true` if this array has no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies the row-major elements of this array out of its tensor.
    pub fn to_vec(&self) -> Result<Vec<E>, ArrayError> {
        Ok(self.tensor.flatten_all()?.to_vec1::<E>()?)
    }

    /// Returns the element at `index`.
    pub fn get(&self, index: &[usize]) -> Result<E, ArrayError> {
        let element = self.region(index, &vec![1; index.len()])?.to_vec()?;
        element.first().copied().ok_or_else(|| self.out_of_bounds(index, &vec![1; index.len()]))
    }

    /// Returns the same elements with a new shape.
    pub fn reshape(self, shape: Vec<usize>) -> Result<Self, ArrayError> {
        let expected = shape.iter().product::<usize>();
        if expected != self.len() {
            return Err(ArrayError::ElementCountMismatch { shape, expected, actual: self.len() });
        }
        Ok(Self::wrap(self.tensor.reshape(shape)?))
    }

    /// Returns the sub-array with shape `region_shape` starting at `offsets`.
    pub fn region(&self, offsets: &[usize], region_shape: &[usize]) -> Result<Self, ArrayError> {
        self.check_region(offsets, region_shape)?;
        if region_shape.contains(&0) {
            return Self::zeros(region_shape.to_vec());
        }
        let mut tensor = self.tensor.clone();
        for (axis, (offset, size)) in offsets.iter().zip(region_shape).enumerate() {
            if *size != self.shape()[axis] {
                tensor = tensor.narrow(axis, *offset, *size)?;
            }
        }
        Ok(Self::wrap(tensor.contiguous()?))
    }

    /// Overwrites the region of this array starting at `offsets` with the contents of `source`.
    pub fn write_region(&mut self, offsets: &[usize], source: &Self) -> Result<(), ArrayError> {
        self.check_region(offsets, source.shape())?;
        if source.is_empty() {
            return Ok(());
        }
        let ranges = offsets.iter().zip(source.shape()).map(|(offset, size)| *offset..offset + size);
        let ranges = ranges.collect::<Vec<Range<usize>>>();
        self.tensor = self.tensor.slice_assign(&ranges, &source.tensor)?;
        Ok(())
    }

    /// Returns `length` consecutive entries along `axis`, starting at `start`.
    pub fn slice_axis(&self, axis: usize, start: usize, length: usize) -> Result<Self, ArrayError> {
        self.dim(axis)?;
        let mut offsets = vec![0; self.rank()];
        let mut region_shape = self.shape().to_vec();
        offsets[axis] = start;
        region_shape[axis] = length;
        self.region(&offsets, &region_shape)
    }

    /// Splits this array into `parts` equally sized arrays along `axis`.
    pub fn split(&self, axis: usize, parts: usize) -> Result<Vec<Self>, ArrayError> {
        let size = self.dim(axis)?;
        if parts == 0 || size % parts != 0 {
            return Err(ArrayError::IndivisibleSplit { axis, size, parts });
        }
        if size == 0 {
            return (0..parts).map(|_| Self::zeros(self.shape().to_vec())).collect();
        }
        self.tensor.chunk(parts, axis)?.into_iter().map(|part| Ok(Self::wrap(part.contiguous()?))).collect()
    }

    /// Returns part `index` of `parts` equally sized parts along `axis`.
    pub fn chunk(&self, axis: usize, parts: usize, index: usize) -> Result<Self, ArrayError> {
        let size = self.dim(axis)?;
        if parts == 0 || size % parts != 0 || index >= parts {
            return Err(ArrayError::IndivisibleSplit { axis, size, parts });
        }
        let part_size = size / parts;
        self.slice_axis(axis, index * part_size, part_size)
    }

    /// Concatenates `arrays` along `axis`. All other dimensions must agree.
    pub fn concat(arrays: &[Self], axis: usize) -> Result<Self, ArrayError> {
        let first = arrays.first().ok_or(ArrayError::EmptyConcatenation)?;
        first.dim(axis)?;
        let mut shape = first.shape().to_vec();
        shape[axis] = 0;
        for array in arrays {
            let compatible = array.rank() == first.rank()
                && array.shape().iter().zip(first.shape()).enumerate().all(|(i, (lhs, rhs))| i == axis || lhs == rhs);
            if !compatible {
                return Err(first.incompatible("concatenation", array));
            }
            shape[axis] += array.shape()[axis];
        }
        let tensors = arrays.iter().filter(|array| !array.is_empty()).map(|array| &array.tensor).collect::<Vec<_>>();
        match tensors.as_slice() {
            [] => Self::zeros(shape),
            [tensor] => Ok(Self::wrap((*tensor).clone())),
            tensors => Ok(Self::wrap(Tensor::cat(tensors, axis)?)),
        }
    }

    /// Permutes the axes of this array: axis `i` of the result is axis `permutation[i]` of this array.
    pub fn permute(&self, permutation: &[usize]) -> Result<Self, ArrayError> {
        let rank = self.rank();
        let mut seen = vec![false; rank];
        let valid = permutation.len() == rank
            && permutation.iter().all(|axis| *axis < rank && !std::mem::replace(&mut seen[*axis], true));
        if !valid {
            return Err(ArrayError::InvalidPermutation { permutation: permutation.to_vec(), rank });
        }
        Ok(Self::wrap(self.tensor.permute(permutation.to_vec())?.contiguous()?))
    }

    fn wrap(tensor: Tensor) -> Self {
        Self { tensor, element: PhantomData }
    }

    fn check_region(&self, offsets: &[usize], region_shape: &[usize]) -> Result<(), ArrayError> {
        let shape = self.shape();
        let fits = offsets.len() == self.rank()
            && region_shape.len() == self.rank()
            && (0..self.rank()).all(|axis| offsets[axis] + region_shape[axis] <= shape[axis]);
        if !fits {
            return Err(self.out_of_bounds(offsets, region_shape));
        }
        Ok(())
    }

    fn out_of_bounds(&self, offsets: &[usize], region_shape: &[usize]) -> ArrayError {
        ArrayError::RegionOutOfBounds {
            offsets: offsets.to_vec(),
            region_shape: region_shape.to_vec(),
            shape: self.shape().to_vec(),
        }
    }

    fn incompatible(&self, operation: &str, other: &Self) -> ArrayError {
        ArrayError::IncompatibleShapes {
            operation: operation.to_string(),
            lhs: self.shape().to_vec(),
            rhs: other.shape().to_vec(),
        }
    }
}

impl HostArray<f32> {
    /// Elementwise sum.
    pub fn add(&self, other: &Self) -> Result<Self, ArrayError> {
        if self.shape() != other.shape() {
            return Err(self.incompatible("an elementwise operation", other));
        }
        Ok(Self::wrap(self.tensor.add(&other.tensor)?))
    }

    /// Elementwise product.
    pub fn mul(&self, other: &Self) -> Result<Self, ArrayError> {
        if self.shape() != other.shape() {
            return Err(self.incompatible("an elementwise operation", other));
        }
        Ok(Self::wrap(self.tensor.mul(&other.tensor)?))
    }

    /// Matrix product of a `[m, k]` array with a `[k, n]` array.
    pub fn matmul(&self, rhs: &Self) -> Result<Self, ArrayError> {
        if self.rank() != 2 || rhs.rank() != 2 || self.shape()[1] != rhs.shape()[0] {
            return Err(self.incompatible("matmul", rhs));
        }
        if self.is_empty() || rhs.is_empty() {
            return Self::zeros(vec![self.shape()[0], rhs.shape()[1]]);
        }
        Ok(Self::wrap(self.tensor.matmul(&rhs.tensor)?))
    }

    /// Rounds every element to the nearest value representable in `data_type`.
    pub fn round_to(&self, data_type: DataType) -> Result<Self, ArrayError> {
        let tensor = match data_type {
            DataType::Float32 => return Ok(self.clone()),
            DataType::UInt32 => self.tensor.round()?,
            data_type => self.tensor.to_dtype(data_type.dtype())?.to_dtype(DType::F32)?,
        };
        Ok(Self::wrap(tensor))
    }

    /// Largest absolute elementwise difference between this array and `other`.
    pub fn max_abs_diff(&self, other: &Self) -> Result<f32, ArrayError> {
        if self.shape() != other.shape() {
            return Err(self.incompatible("comparison", other));
        }
        Self::wrap(self.tensor.sub(&other.tensor)?).max_abs()
    }

    /// Largest absolute value in this array.
    pub fn max_abs(&self) -> Result<f32, ArrayError> {
        if self.is_empty() {
            return Ok(0.0);
        }
        Ok(self.tensor.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?)
    }
}

#[cfg(test)]
mod tests {
    use half::{bf16, f16};

    use super::*;

    fn iota(shape: Vec<usize>) -> HostArray {
        let count = shape.iter().product::<usize>();
        HostArray::new(shape, (0..count).map(|value| value as f32).collect()).unwrap()
    }

    #[test]
    fn test_construction_validates_element_count() {
        assert_eq!(
            HostArray::new(vec![2, 3], vec![0.0f32; 5]),
            Err(ArrayError::ElementCountMismatch { shape: vec![2, 3], expected: 6, actual: 5 }),
        );
        let array = HostArray::from_fn(vec![2, 3], |index| (index[0] * 10 + index[1]) as u32).unwrap();
        assert_eq!(array.to_vec().unwrap(), [0, 1, 2, 10, 11, 12]);
        assert_eq!(array.get(&[1, 2]), Ok(12));
        assert!(matches!(array.get(&[2, 0]), Err(ArrayError::RegionOutOfBounds { .. })));
        assert_eq!(HostArray::<u32>::zeros(vec![]).unwrap().to_vec().unwrap(), [0]);
    }

    #[test]
    fn test_from_tensor_checks_the_element_type() {
        let tensor = Tensor::zeros((2, 2), DType::U32, &Device::Cpu).unwrap();
        assert!(HostArray::<u32>::from_tensor(tensor.clone()).is_ok());
        assert!(matches!(
            HostArray::<f32>::from_tensor(tensor),
            Err(ArrayError::DTypeMismatch { expected, actual }) if expected == "f32" && actual == "u32",
        ));
    }

    #[test]
    fn test_regions() {
        let mut array = iota(vec![2, 3, 4]);
        let region = array.region(&[1, 1, 2], &[1, 2, 2]).unwrap();
        assert_eq!(region.shape(), &[1, 2, 2]);
        assert_eq!(region.to_vec().unwrap(), [18.0, 19.0, 22.0, 23.0]);

        array.write_region(&[0, 2, 1], &HostArray::full(vec![2, 1, 2], -1.0).unwrap()).unwrap();
        assert_eq!(array.get(&[0, 2, 1]), Ok(-1.0));
        assert_eq!(array.get(&[1, 2, 2]), Ok(-1.0));
        assert_eq!(array.get(&[1, 2, 3]), Ok(23.0));

        assert!(matches!(array.region(&[1, 0, 0], &[2, 1, 1]), Err(ArrayError::RegionOutOfBounds { .. })));
        assert_eq!(array.region(&[1, 0, 0], &[1, 0, 4]).unwrap().shape(), &[1, 0, 4]);
    }

    #[test]
    fn test_split_and_concat_are_inverse() {
        let array = iota(vec![4, 2, 3]);
        for axis in 0..3 {
            let parts = array.dim(axis).unwrap();
            let pieces = array.split(axis, parts).unwrap();
            assert_eq!(pieces.len(), parts);
            assert_eq!(HostArray::concat(&pieces, axis).unwrap(), array);
        }
        assert_eq!(array.chunk(0, 2, 1).unwrap(), array.slice_axis(0, 2, 2).unwrap());
        assert_eq!(array.split(2, 2), Err(ArrayError::IndivisibleSplit { axis: 2, size: 3, parts: 2 }));
        assert_eq!(HostArray::<f32>::concat(&[], 0), Err(ArrayError::EmptyConcatenation));
    }

    #[test]
    fn test_concat_along_inner_axis() {
        let lhs = iota(vec![2, 1]);
        let rhs = HostArray::new(vec![2, 2], vec![10.0, 11.0, 12.0, 13.0]).unwrap();
        let empty = HostArray::zeros(vec![2, 0]).unwrap();
        let result = HostArray::concat(&[empty, lhs, rhs], 1).unwrap();
        assert_eq!(result.shape(), &[2, 3]);
        assert_eq!(result.to_vec().unwrap(), [0.0, 10.0, 11.0, 1.0, 12.0, 13.0]);
    }

    #[test]
    fn test_permute() {
        let array = iota(vec![2, 3, 4]);
        let permuted = array.permute(&[1, 0, 2]).unwrap();
        assert_eq!(permuted.shape(), &[3, 2, 4]);
        assert_eq!(permuted.get(&[2, 1, 3]), array.get(&[1, 2, 3]));
        assert_eq!(permuted.permute(&[1, 0, 2]).unwrap(), array);
        assert!(matches!(array.permute(&[0, 0, 1]), Err(ArrayError::InvalidPermutation { .. })));
    }

    #[test]
    fn test_matmul() {
        let lhs = HostArray::new(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let rhs = HostArray::new(vec![3, 2], vec![7.0, 8.0, 9.0, 10.0, 11.0, 12.0]).unwrap();
        let product = lhs.matmul(&rhs).unwrap();
        assert_eq!(product.shape(), &[2, 2]);
        assert_eq!(product.to_vec().unwrap(), [58.0, 64.0, 139.0, 154.0]);
        assert!(matches!(lhs.matmul(&lhs), Err(ArrayError::IncompatibleShapes { .. })));
    }

    #[test]
    fn test_elementwise_operations() {
        let lhs = iota(vec![3]);
        let rhs = HostArray::full(vec![3], 2.0).unwrap();
        assert_eq!(lhs.add(&rhs).unwrap().to_vec().unwrap(), [2.0, 3.0, 4.0]);
        assert_eq!(lhs.mul(&rhs).unwrap().to_vec().unwrap(), [0.0, 2.0, 4.0]);
        assert_eq!(lhs.max_abs_diff(&rhs).unwrap(), 2.0);
        assert!(matches!(lhs.add(&iota(vec![1, 3])), Err(ArrayError::IncompatibleShapes { .. })));
    }

    #[test]
    fn test_rounding_matches_half_precision() {
        let values = vec![1.0 + 1e-3, -3.3, 65519.0, 1e-8];
        let array = HostArray::new(vec![4], values.clone()).unwrap();
        let bfloat16 = values.iter().map(|value| bf16::from_f32(*value).to_f32()).collect::<Vec<_>>();
        let float16 = values.iter().map(|value| f16::from_f32(*value).to_f32()).collect::<Vec<_>>();
        assert_eq!(array.round_to(DataType::BFloat16).unwrap().to_vec().unwrap(), bfloat16);
        assert_eq!(array.round_to(DataType::Float16).unwrap().to_vec().unwrap(), float16);
        assert_eq!(array.round_to(DataType::Float32).unwrap(), array);
    }
}
