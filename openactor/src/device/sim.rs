use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{anyhow, Result};

use super::{DeviceContext, DeviceId, DeviceKind, DeviceTensor};
use crate::tensor::TensorValue;

/// Simulated accelerator with its own address space.
///
/// Every transfer materializes a fresh buffer and is counted, which lets
/// callers observe how many host/device crossings a run performed.
#[derive(Debug)]
pub struct SimDevice {
    id: DeviceId,
    uploads: AtomicUsize,
    copies: AtomicUsize,
}

impl SimDevice {
    pub fn new(index: u32) -> Self {
        Self {
            id: DeviceId::new(DeviceKind::Sim, index),
            uploads: AtomicUsize::new(0),
            copies: AtomicUsize::new(0),
        }
    }

    pub fn uploads(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn copies(&self) -> usize {
        self.copies.load(Ordering::SeqCst)
    }
}

impl DeviceContext for SimDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn upload(&self, value: &TensorValue) -> Result<DeviceTensor> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(DeviceTensor::new(value.clone(), self.id))
    }

    fn copy(&self, tensor: &DeviceTensor) -> Result<DeviceTensor> {
        if tensor.device() == self.id {
            return Ok(tensor.clone());
        }
        self.copies.fetch_add(1, Ordering::SeqCst);
        Ok(DeviceTensor::new(tensor.value().clone(), self.id))
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
