use anyhow::{anyhow, Result};

use super::{DeviceContext, DeviceId, DeviceKind, DeviceTensor};
use crate::tensor::TensorValue;

/// Host memory context. Uploads and same-host copies share buffers.
#[derive(Debug, Clone)]
pub struct CpuContext {
    id: DeviceId,
}

impl CpuContext {
    pub fn new(index: u32) -> Self {
        Self {
            id: DeviceId::new(DeviceKind::Cpu, index),
        }
    }
}

impl DeviceContext for CpuContext {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn upload(&self, value: &TensorValue) -> Result<DeviceTensor> {
        Ok(DeviceTensor::new(value.clone(), self.id))
    }

    fn copy(&self, tensor: &DeviceTensor) -> Result<DeviceTensor> {
        Ok(DeviceTensor::from_shared(tensor.shared().clone(), self.id))
    }

    fn download(&self, tensor: &DeviceTensor) -> Result<TensorValue> {
        if tensor.device() != self.id {
            return Err(anyhow!(
                "{} cannot download tensor resident on {}",
                self.id,
                tensor.device()
            ));
        }
        Ok(tensor.value().clone())
    }
}
