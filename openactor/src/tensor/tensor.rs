//! Owned tensor container.
//!
//! `Tensor<T>` keeps a flat row-major buffer plus its shape. The scheduler
//! never indexes into tensors itself; reference kernels work on the flat data.
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use super::shape::{format_shape, numel};

/// Owned, contiguous tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor<T> {
    pub data: Vec<T>,
    shape: Vec<usize>,
}

impl<T> Tensor<T> {
    /// Build a rank-1 tensor from a flat data vector.
    pub fn new(data: Vec<T>) -> Self {
        let shape = vec![data.len()];
        Self { data, shape }
    }

    /// Build a tensor with an explicit shape.
    pub fn from_vec_with_shape(data: Vec<T>, shape: Vec<usize>) -> Result<Self> {
        let expected = numel(&shape);
        if expected != data.len() {
            return Err(anyhow!(
                "shape {} needs {} elements, got {}",
                format_shape(&shape),
                expected,
                data.len()
            ));
        }
        Ok(Self { data, shape })
    }

    /// Rank-0 tensor holding one value.
    pub fn scalar(value: T) -> Self {
        Self {
            data: vec![value],
            shape: Vec::new(),
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// Reinterpret the buffer under a new shape with the same element count.
    pub fn reshape(self, shape: Vec<usize>) -> Result<Self> {
        Self::from_vec_with_shape(self.data, shape)
    }
}

impl<T: Clone> Tensor<T> {
    /// First element, used for scalar conditions and label indices.
    pub fn first(&self) -> Option<T> {
        self.data.first().cloned()
    }
}

impl<T: Clone + Default> Tensor<T> {
    pub fn zeros(shape: Vec<usize>) -> Self {
        let data = vec![T::default(); numel(&shape)];
        Self { data, shape }
    }
}

impl<T> From<Vec<T>> for Tensor<T> {
    fn from(value: Vec<T>) -> Self {
        Tensor::new(value)
    }
}
