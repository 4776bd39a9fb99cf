//! Element and array types used to describe tensors without carrying their data.
//!
//! [`ArrayType`] is the leaf type used by shape-only views of the tensor containers (e.g.,
//! [`Weights::shapes`](crate::weights::Weights::shapes)), which is what external staging tooling consumes together
//! with the resolved shardings.

use std::fmt::Display;
use std::str::FromStr;

use candle_core::DType;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::parameters::Parameter;

/// Primitive data types that tensors in the inference stack are stored or computed in.
///
/// Activations are always held in `f32` host buffers. When an intermediate data type narrower than `f32` is
/// configured, values are rounded through it after every projection (see
/// [`HostArray::round_to`](crate::array::HostArray::round_to)), which reproduces the numerics of running the same
/// program on an accelerator with that activation type.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// 32-bit unsigned integers. Used for token ids and sequence lengths.
    #[serde(rename = "u32")]
    UInt32,

    /// [Brain floating-point](https://en.wikipedia.org/wiki/Bfloat16_floating-point_format) with 8 exponent bits and
    /// 7 mantissa bits.
    #[serde(rename = "bf16")]
    BFloat16,

    /// IEEE 754 half-precision floating-point.
    #[serde(rename = "f16")]
    Float16,

    /// IEEE 754 single-precision floating-point.
    #[default]
    #[serde(rename = "f32")]
    Float32,
}

impl DataType {
    /// Returns `true` if this is a floating-point [`DataType`].
    pub fn is_floating_point(&self) -> bool {
        !matches!(self, DataType::UInt32)
    }

    /// Size of one element of this [`DataType`], in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::UInt32 | DataType::Float32 => 4,
            DataType::BFloat16 | DataType::Float16 => 2,
        }
    }

    /// Tensor element type that arrays of this [`DataType`] are stored in.
    #[inline]
    pub fn dtype(&self) -> DType {
        match self {
            DataType::UInt32 => DType::U32,
            DataType::BFloat16 => DType::BF16,
            DataType::Float16 => DType::F16,
            DataType::Float32 => DType::F32,
        }
    }
}

impl Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self {
            DataType::UInt32 => write!(f, "u32"),
            DataType::BFloat16 => write!(f, "bf16"),
            DataType::Float16 => write!(f, "f16"),
            DataType::Float32 => write!(f, "f32"),
        }
    }
}

/// Error returned when parsing a [`DataType`] from an unrecognized name.
#[derive(Error, Clone, Debug, Eq, PartialEq, Hash)]
#[error("unknown data type '{name}'")]
pub struct UnknownDataTypeError {
    pub name: String,
}

impl FromStr for DataType {
    type Err = UnknownDataTypeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "u32" => Ok(DataType::UInt32),
            "bf16" => Ok(DataType::BFloat16),
            "f16" => Ok(DataType::Float16),
            "f32" => Ok(DataType::Float32),
            name => Err(UnknownDataTypeError { name: name.to_string() }),
        }
    }
}

/// Type of a dense array: its element [`DataType`] and its (static) shape.
///
/// ```rust
/// # use tessera_core::types::{ArrayType, DataType};
/// assert_eq!(ArrayType::new(DataType::BFloat16, vec![8, 16, 4]).to_string(), "bf16[8, 16, 4]");
/// assert_eq!(ArrayType::new(DataType::UInt32, vec![]).to_string(), "u32[]");
/// ```
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ArrayType {
    /// [`DataType`] of the elements stored in the array.
    pub data_type: DataType,

    /// Dimension sizes of the array.
    pub shape: Vec<usize>,
}

impl ArrayType {
    /// Constructs a new [`ArrayType`] with the provided [`DataType`] and shape.
    #[inline]
    pub fn new(data_type: DataType, shape: Vec<usize>) -> Self {
        Self { data_type, shape }
    }

    /// Returns the rank (i.e., the number of dimensions) of this [`ArrayType`].
    #[inline]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Returns the number of elements of arrays of this type.
    #[inline]
    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    /// Returns the size of arrays of this type, in bytes.
    #[inline]
    pub fn size_in_bytes(&self) -> usize {
        self.element_count() * self.data_type.size_in_bytes()
    }
}

impl Parameter for ArrayType {}

impl Display for ArrayType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shape = self.shape.iter().map(|size| size.to_string()).collect::<Vec<_>>().join(", ");
        write!(f, "{}[{shape}]", self.data_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_type_display_and_parsing() {
        for data_type in [DataType::UInt32, DataType::BFloat16, DataType::Float16, DataType::Float32] {
            assert_eq!(data_type.to_string().parse::<DataType>(), Ok(data_type));
        }
        assert_eq!("f8".parse::<DataType>(), Err(UnknownDataTypeError { name: "f8".to_string() }));
    }

    #[test]
    fn test_data_type_tensor_types() {
        assert_eq!(DataType::UInt32.dtype(), DType::U32);
        assert_eq!(DataType::BFloat16.dtype(), DType::BF16);
        for data_type in [DataType::UInt32, DataType::BFloat16, DataType::Float16, DataType::Float32] {
            assert_eq!(data_type.dtype().size_in_bytes(), data_type.size_in_bytes());
        }
    }

    #[test]
    fn test_array_type_sizes() {
        let array_type = ArrayType::new(DataType::BFloat16, vec![8, 16, 4]);
        assert_eq!(array_type.rank(), 3);
        assert_eq!(array_type.element_count(), 512);
        assert_eq!(array_type.size_in_bytes(), 1024);
        assert_eq!(ArrayType::new(DataType::Float32, vec![]).element_count(), 1);
    }
}
