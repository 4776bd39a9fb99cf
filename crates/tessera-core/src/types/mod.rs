pub mod array_type;

pub use array_type::{ArrayType, DataType};
