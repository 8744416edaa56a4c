//! Execution contexts and device-resident tensors.
//!
//! A `DeviceContext` owns the residency of the tensors its kernels consume.
//! Tensors never cross contexts implicitly: the linker inserts copy actors
//! that call [`DeviceContext::copy`] on the destination.
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::tensor::TensorValue;

mod cpu;
mod sim;

pub use cpu::CpuContext;
pub use sim::SimDevice;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceKind {
    Cpu,
    Sim,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Cpu => write!(f, "cpu"),
            DeviceKind::Sim => write!(f, "sim"),
        }
    }
}

/// Identity of one execution context, printed as `cpu:0`, `sim:1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId {
    pub kind: DeviceKind,
    pub index: u32,
}

impl DeviceId {
    pub fn new(kind: DeviceKind, index: u32) -> Self {
        Self { kind, index }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.index)
    }
}

/// A tensor resident on one device. Cloning shares the buffer.
#[derive(Debug, Clone)]
pub struct DeviceTensor {
    value: Arc<TensorValue>,
    device: DeviceId,
}

impl DeviceTensor {
    pub fn new(value: TensorValue, device: DeviceId) -> Self {
        Self {
            value: Arc::new(value),
            device,
        }
    }

    pub(crate) fn from_shared(value: Arc<TensorValue>, device: DeviceId) -> Self {
        Self { value, device }
    }

    pub fn value(&self) -> &TensorValue {
        &self.value
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub(crate) fn shared(&self) -> &Arc<TensorValue> {
        &self.value
    }
}

/// Uniform interface to an execution context.
pub trait DeviceContext: Send + Sync + fmt::Debug {
    fn id(&self) -> DeviceId;

    fn kind(&self) -> DeviceKind {
        self.id().kind
    }

    /// Host value → tensor resident on this device.
    fn upload(&self, value: &TensorValue) -> Result<DeviceTensor>;

    /// Tensor on any device → tensor resident on this device.
    fn copy(&self, tensor: &DeviceTensor) -> Result<DeviceTensor>;

    /// Tensor on this device → host value.
    fn download(&self, tensor: &DeviceTensor) -> Result<TensorValue>;
}

pub type SharedDevice = Arc<dyn DeviceContext>;

/// Shorthand for the host CPU context with index 0.
pub fn cpu() -> SharedDevice {
    Arc::new(CpuContext::new(0))
}
