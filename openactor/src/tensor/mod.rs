mod shape;
mod tensor;
mod value;

pub use shape::{broadcast_shape, format_shape, numel};
pub use tensor::Tensor;
pub use value::{DType, TensorElement, TensorValue};
