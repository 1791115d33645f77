pub mod tensor;
pub mod types;

pub use tensor::Tensor;
pub use types::{DataType, Format, Shape};
