use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{anyhow, Result};
use serde::Serialize;

use crate::device::{DeviceId, DeviceTensor, SharedDevice};
use crate::tensor::TensorValue;

use super::actor::Stamp;

/// Key of one persistent tensor: logical name plus the device holding it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct StoreKey {
    pub name: String,
    pub device: DeviceId,
}

impl StoreKey {
    pub fn new(name: impl Into<String>, device: DeviceId) -> Self {
        Self {
            name: name.into(),
            device,
        }
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.device)
    }
}

/// Persistent tensors shared by every actor set of one scheduler.
///
/// The lock only protects the map; ordering between writers and readers of
/// one entry comes from control arrows.
#[derive(Debug, Default)]
pub struct DeviceTensorStore {
    entries: RwLock<HashMap<StoreKey, DeviceTensor>>,
}

impl DeviceTensorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &StoreKey) -> bool {
        self.entries
            .read()
            .map(|entries| entries.contains_key(key))
            .unwrap_or(false)
    }

    pub fn fetch(&self, key: &StoreKey) -> Result<DeviceTensor> {
        let entries = self
            .entries
            .read()
            .map_err(|_| anyhow!("device tensor store poisoned"))?;
        entries
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow!("no device tensor store entry {}", key))
    }

    pub fn insert(&self, key: StoreKey, tensor: DeviceTensor) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| anyhow!("device tensor store poisoned"))?;
        entries.insert(key, tensor);
        Ok(())
    }

    /// Host view of one entry.
    pub fn value(&self, name: &str, device: DeviceId) -> Option<TensorValue> {
        self.fetch(&StoreKey::new(name, device))
            .ok()
            .map(|tensor| tensor.value().clone())
    }

    pub fn keys(&self) -> Vec<StoreKey> {
        let mut keys: Vec<StoreKey> = self
            .entries
            .read()
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }
}

/// Store entry an actor set uploads on first use.
#[derive(Debug, Clone)]
pub(crate) struct PersistentTensor {
    pub key: StoreKey,
    pub value: TensorValue,
    pub device: SharedDevice,
}

/// Host inputs published by DataPrepare, stamped per iteration.
#[derive(Debug, Default)]
pub(crate) struct HostQueue {
    batches: Mutex<BTreeMap<Stamp, Arc<Vec<TensorValue>>>>,
}

impl HostQueue {
    pub fn push(&self, stamp: Stamp, batch: Arc<Vec<TensorValue>>) -> Result<()> {
        let mut batches = self
            .batches
            .lock()
            .map_err(|_| anyhow!("host queue poisoned"))?;
        batches.retain(|held, _| held.run == stamp.run && held.iteration + 1 >= stamp.iteration);
        batches.insert(stamp, batch);
        Ok(())
    }

    pub fn fetch(&self, stamp: Stamp) -> Result<Arc<Vec<TensorValue>>> {
        let batches = self
            .batches
            .lock()
            .map_err(|_| anyhow!("host queue poisoned"))?;
        batches
            .get(&stamp)
            .cloned()
            .ok_or_else(|| anyhow!("no host batch for {}", stamp))
    }

    pub fn clear(&self) {
        if let Ok(mut batches) = self.batches.lock() {
            batches.clear();
        }
    }
}
