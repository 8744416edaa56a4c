//! Executable operations and their descriptors.
//!
//! The scheduler treats kernels as opaque: it only sees the [`Operation`]
//! trait plus the slot/side-effect metadata carried by [`OpDescriptor`].
use std::fmt;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::tensor::{DType, TensorValue};

mod host;
mod registry;

pub use host::{BinaryKind, BinaryOp, CompareKind, CompareOp, CopyOp};
pub use registry::{host_op, host_op_names};

/// Uniform executable unit invoked by kernel actors.
pub trait Operation: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// One-time setup before the first execution.
    fn prepare(&self) -> Result<()> {
        Ok(())
    }

    /// Called before an execution whose input shapes differ from the previous one.
    fn resize(&self, _shapes: &[Vec<usize>]) -> Result<()> {
        Ok(())
    }

    fn execute(&self, inputs: &[&TensorValue]) -> Result<Vec<TensorValue>>;
}

/// Declared type of one input or output slot; `None` accepts any dtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SlotType {
    pub dtype: Option<DType>,
}

impl SlotType {
    pub fn any() -> Self {
        Self { dtype: None }
    }

    pub fn of(dtype: DType) -> Self {
        Self { dtype: Some(dtype) }
    }

    pub fn accepts(&self, value: &TensorValue) -> bool {
        self.dtype.map_or(true, |dtype| dtype == value.dtype())
    }
}

/// Effect an operation has beyond producing its outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SideEffect {
    #[default]
    None,
    /// Output 0 aliases input `input`; when that input is a persistent
    /// tensor the result is written back to the store.
    InPlace { input: usize },
    /// Observable effect outside the graph; ordered with other effects.
    Opaque,
}

/// Operation id, slot signature, backend handle and scheduling flags.
#[derive(Clone)]
pub struct OpDescriptor {
    pub id: String,
    pub inputs: Vec<SlotType>,
    pub outputs: Vec<SlotType>,
    pub backend: Arc<dyn Operation>,
    pub side_effect: SideEffect,
    /// Communication group; members of a group are issued in one global order.
    pub collective: Option<String>,
}

impl fmt::Debug for OpDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpDescriptor")
            .field("id", &self.id)
            .field("backend", &self.backend.name())
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .field("side_effect", &self.side_effect)
            .field("collective", &self.collective)
            .finish()
    }
}

impl OpDescriptor {
    pub fn new(
        id: impl Into<String>,
        backend: Arc<dyn Operation>,
        inputs: usize,
        outputs: usize,
    ) -> Self {
        Self {
            id: id.into(),
            inputs: vec![SlotType::any(); inputs],
            outputs: vec![SlotType::any(); outputs],
            backend,
            side_effect: SideEffect::None,
            collective: None,
        }
    }

    /// Descriptor for one of the built-in host kernels.
    pub fn host(id: impl Into<String>, kernel: &str) -> Result<Self> {
        let entry = host_op(kernel)?;
        Ok(Self::new(id, entry.op.clone(), entry.inputs, entry.outputs))
    }

    pub fn with_input_types(mut self, inputs: Vec<SlotType>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_output_types(mut self, outputs: Vec<SlotType>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn in_place(mut self, input: usize) -> Self {
        self.side_effect = SideEffect::InPlace { input };
        self
    }

    pub fn with_side_effect(mut self, side_effect: SideEffect) -> Self {
        self.side_effect = side_effect;
        self
    }

    pub fn collective(mut self, group: impl Into<String>) -> Self {
        self.collective = Some(group.into());
        self
    }

    pub fn has_side_effect(&self) -> bool {
        !matches!(self.side_effect, SideEffect::None)
    }

    pub fn check_inputs(&self, inputs: &[&TensorValue]) -> Result<()> {
        if inputs.len() != self.inputs.len() {
            return Err(anyhow!(
                "op {} expects {} inputs, got {}",
                self.id,
                self.inputs.len(),
                inputs.len()
            ));
        }
        for (index, (slot, value)) in self.inputs.iter().zip(inputs).enumerate() {
            if !slot.accepts(value) {
                return Err(anyhow!(
                    "op {} input {} expects {:?}, got {}",
                    self.id,
                    index,
                    slot.dtype,
                    value.describe()
                ));
            }
        }
        Ok(())
    }

    pub fn check_outputs(&self, outputs: &[TensorValue]) -> Result<()> {
        if outputs.len() != self.outputs.len() {
            return Err(anyhow!(
                "op {} declared {} outputs, produced {}",
                self.id,
                self.outputs.len(),
                outputs.len()
            ));
        }
        for (index, (slot, value)) in self.outputs.iter().zip(outputs).enumerate() {
            if !slot.accepts(value) {
                return Err(anyhow!(
                    "op {} output {} declared {:?}, produced {}",
                    self.id,
                    index,
                    slot.dtype,
                    value.describe()
                ));
            }
        }
        Ok(())
    }
}
