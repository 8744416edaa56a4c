use std::fmt;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use super::shape::format_shape;
use super::Tensor;

/// Element type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DType {
    F32,
    F64,
    I32,
    I64,
    Bool,
}

impl DType {
    pub fn size_of(&self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F64 | DType::I64 => 8,
            DType::Bool => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::Bool => "bool",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Element type that can be converted to/from `TensorValue`.
pub trait TensorElement: Sized + Clone {
    const DTYPE: DType;
    /// Attempt to extract a typed tensor from a generic value.
    fn from_value(value: &TensorValue) -> Option<Tensor<Self>>;
    /// Wrap a typed tensor into a generic value.
    fn into_value(tensor: Tensor<Self>) -> TensorValue;
}

macro_rules! tensor_element {
    ($ty:ty, $variant:ident) => {
        impl TensorElement for $ty {
            const DTYPE: DType = DType::$variant;

            fn from_value(value: &TensorValue) -> Option<Tensor<Self>> {
                match value {
                    TensorValue::$variant(tensor) => Some(tensor.clone()),
                    _ => None,
                }
            }

            fn into_value(tensor: Tensor<Self>) -> TensorValue {
                TensorValue::$variant(tensor)
            }
        }
    };
}

tensor_element!(f32, F32);
tensor_element!(f64, F64);
tensor_element!(i32, I32);
tensor_element!(i64, I64);
tensor_element!(bool, Bool);

/// Dynamically typed tensor, the payload of every data arrow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TensorValue {
    F32(Tensor<f32>),
    F64(Tensor<f64>),
    I32(Tensor<i32>),
    I64(Tensor<i64>),
    Bool(Tensor<bool>),
}

macro_rules! each_variant {
    ($value:expr, $tensor:ident => $body:expr) => {
        match $value {
            TensorValue::F32($tensor) => $body,
            TensorValue::F64($tensor) => $body,
            TensorValue::I32($tensor) => $body,
            TensorValue::I64($tensor) => $body,
            TensorValue::Bool($tensor) => $body,
        }
    };
}

impl TensorValue {
    pub fn dtype(&self) -> DType {
        match self {
            TensorValue::F32(_) => DType::F32,
            TensorValue::F64(_) => DType::F64,
            TensorValue::I32(_) => DType::I32,
            TensorValue::I64(_) => DType::I64,
            TensorValue::Bool(_) => DType::Bool,
        }
    }

    pub fn shape(&self) -> &[usize] {
        each_variant!(self, tensor => tensor.shape())
    }

    pub fn len(&self) -> usize {
        each_variant!(self, tensor => tensor.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn nbytes(&self) -> usize {
        self.len() * self.dtype().size_of()
    }

    pub fn scalar<T: TensorElement>(value: T) -> Self {
        T::into_value(Tensor::scalar(value))
    }

    pub fn zeros(dtype: DType, shape: Vec<usize>) -> Self {
        match dtype {
            DType::F32 => TensorValue::F32(Tensor::zeros(shape)),
            DType::F64 => TensorValue::F64(Tensor::zeros(shape)),
            DType::I32 => TensorValue::I32(Tensor::zeros(shape)),
            DType::I64 => TensorValue::I64(Tensor::zeros(shape)),
            DType::Bool => TensorValue::Bool(Tensor::zeros(shape)),
        }
    }

    /// Typed view of the value; fails on a dtype mismatch.
    pub fn as_tensor<T: TensorElement>(&self) -> Result<Tensor<T>> {
        T::from_value(self).ok_or_else(|| {
            anyhow!(
                "expected {} tensor, got {}",
                T::DTYPE,
                self.describe()
            )
        })
    }

    /// Interpret a single-element value as a branch selector.
    ///
    /// Integers select the branch with that index; `true` selects branch 0 and
    /// `false` branch 1.
    pub fn branch_index(&self) -> Result<usize> {
        if self.len() != 1 {
            return Err(anyhow!(
                "branch condition must hold one element, got {}",
                self.describe()
            ));
        }
        let index: i64 = match self {
            TensorValue::I32(tensor) => tensor.data[0] as i64,
            TensorValue::I64(tensor) => tensor.data[0],
            TensorValue::Bool(tensor) => {
                if tensor.data[0] {
                    0
                } else {
                    1
                }
            }
            other => {
                return Err(anyhow!(
                    "branch condition must be integer or bool, got {}",
                    other.describe()
                ))
            }
        };
        usize::try_from(index).map_err(|_| anyhow!("negative branch index {}", index))
    }

    /// Short `dtype[shape]` description used in logs and dumps.
    pub fn describe(&self) -> String {
        format!("{}{}", self.dtype(), format_shape(self.shape()))
    }
}

impl<T: TensorElement> From<Tensor<T>> for TensorValue {
    fn from(value: Tensor<T>) -> Self {
        T::into_value(value)
    }
}

impl<T: TensorElement> From<Vec<T>> for TensorValue {
    fn from(value: Vec<T>) -> Self {
        T::into_value(Tensor::new(value))
    }
}
