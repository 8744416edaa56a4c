use anyhow::{anyhow, Result};

use crate::tensor::{broadcast_shape, numel, Tensor, TensorValue};

use super::Operation;

fn check_arity(name: &str, inputs: &[&TensorValue], count: usize) -> Result<()> {
    if inputs.len() != count {
        return Err(anyhow!("{} expects {} inputs, got {}", name, count, inputs.len()));
    }
    Ok(())
}

fn zip_broadcast<T: Copy, U>(
    lhs: &Tensor<T>,
    rhs: &Tensor<T>,
    f: impl Fn(T, T) -> U,
) -> Result<Tensor<U>> {
    let shape = broadcast_shape(lhs.shape(), rhs.shape())?;
    let pick = |tensor: &Tensor<T>, index: usize| {
        if tensor.len() == 1 {
            tensor.data[0]
        } else {
            tensor.data[index]
        }
    };
    let data = (0..numel(&shape))
        .map(|index| f(pick(lhs, index), pick(rhs, index)))
        .collect();
    Tensor::from_vec_with_shape(data, shape)
}

/// Identity kernel; the copy actor's fixed operation.
#[derive(Debug, Default)]
pub struct CopyOp;

impl Operation for CopyOp {
    fn name(&self) -> &str {
        "copy"
    }

    fn execute(&self, inputs: &[&TensorValue]) -> Result<Vec<TensorValue>> {
        check_arity(self.name(), inputs, 1)?;
        Ok(vec![inputs[0].clone()])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryKind {
    Add,
    Sub,
    Mul,
}

trait Arith: Copy {
    fn apply(kind: BinaryKind, lhs: Self, rhs: Self) -> Self;
}

macro_rules! float_arith {
    ($ty:ty) => {
        impl Arith for $ty {
            fn apply(kind: BinaryKind, lhs: Self, rhs: Self) -> Self {
                match kind {
                    BinaryKind::Add => lhs + rhs,
                    BinaryKind::Sub => lhs - rhs,
                    BinaryKind::Mul => lhs * rhs,
                }
            }
        }
    };
}

macro_rules! int_arith {
    ($ty:ty) => {
        impl Arith for $ty {
            fn apply(kind: BinaryKind, lhs: Self, rhs: Self) -> Self {
                match kind {
                    BinaryKind::Add => lhs.wrapping_add(rhs),
                    BinaryKind::Sub => lhs.wrapping_sub(rhs),
                    BinaryKind::Mul => lhs.wrapping_mul(rhs),
                }
            }
        }
    };
}

float_arith!(f32);
float_arith!(f64);
int_arith!(i32);
int_arith!(i64);

/// Elementwise arithmetic with single-element broadcasting.
#[derive(Debug)]
pub struct BinaryOp {
    kind: BinaryKind,
    name: &'static str,
}

impl BinaryOp {
    pub fn new(kind: BinaryKind) -> Self {
        let name = match kind {
            BinaryKind::Add => "add",
            BinaryKind::Sub => "sub",
            BinaryKind::Mul => "mul",
        };
        Self { kind, name }
    }
}

impl Operation for BinaryOp {
    fn name(&self) -> &str {
        self.name
    }

    fn execute(&self, inputs: &[&TensorValue]) -> Result<Vec<TensorValue>> {
        check_arity(self.name, inputs, 2)?;
        let kind = self.kind;
        let out = match (inputs[0], inputs[1]) {
            (TensorValue::F32(a), TensorValue::F32(b)) => {
                TensorValue::F32(zip_broadcast(a, b, |x, y| Arith::apply(kind, x, y))?)
            }
            (TensorValue::F64(a), TensorValue::F64(b)) => {
                TensorValue::F64(zip_broadcast(a, b, |x, y| Arith::apply(kind, x, y))?)
            }
            (TensorValue::I32(a), TensorValue::I32(b)) => {
                TensorValue::I32(zip_broadcast(a, b, |x, y| Arith::apply(kind, x, y))?)
            }
            (TensorValue::I64(a), TensorValue::I64(b)) => {
                TensorValue::I64(zip_broadcast(a, b, |x, y| Arith::apply(kind, x, y))?)
            }
            (lhs, rhs) => {
                return Err(anyhow!(
                    "{} does not support {} and {}",
                    self.name,
                    lhs.describe(),
                    rhs.describe()
                ))
            }
        };
        Ok(vec![out])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareKind {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
}

impl CompareKind {
    fn holds<T: PartialOrd>(self, lhs: T, rhs: T) -> bool {
        match self {
            CompareKind::Lt => lhs < rhs,
            CompareKind::Le => lhs <= rhs,
            CompareKind::Gt => lhs > rhs,
            CompareKind::Ge => lhs >= rhs,
            CompareKind::Eq => lhs == rhs,
        }
    }
}

/// Elementwise comparison producing a bool tensor.
#[derive(Debug)]
pub struct CompareOp {
    kind: CompareKind,
    name: &'static str,
}

impl CompareOp {
    pub fn new(kind: CompareKind) -> Self {
        let name = match kind {
            CompareKind::Lt => "lt",
            CompareKind::Le => "le",
            CompareKind::Gt => "gt",
            CompareKind::Ge => "ge",
            CompareKind::Eq => "eq",
        };
        Self { kind, name }
    }
}

impl Operation for CompareOp {
    fn name(&self) -> &str {
        self.name
    }

    fn execute(&self, inputs: &[&TensorValue]) -> Result<Vec<TensorValue>> {
        check_arity(self.name, inputs, 2)?;
        let kind = self.kind;
        let out = match (inputs[0], inputs[1]) {
            (TensorValue::F32(a), TensorValue::F32(b)) => zip_broadcast(a, b, |x, y| kind.holds(x, y))?,
            (TensorValue::F64(a), TensorValue::F64(b)) => zip_broadcast(a, b, |x, y| kind.holds(x, y))?,
            (TensorValue::I32(a), TensorValue::I32(b)) => zip_broadcast(a, b, |x, y| kind.holds(x, y))?,
            (TensorValue::I64(a), TensorValue::I64(b)) => zip_broadcast(a, b, |x, y| kind.holds(x, y))?,
            (TensorValue::Bool(a), TensorValue::Bool(b)) => zip_broadcast(a, b, |x, y| kind.holds(x, y))?,
            (lhs, rhs) => {
                return Err(anyhow!(
                    "{} cannot compare {} with {}",
                    self.name,
                    lhs.describe(),
                    rhs.describe()
                ))
            }
        };
        Ok(vec![TensorValue::Bool(out)])
    }
}
