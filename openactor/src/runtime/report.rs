use anyhow::{anyhow, Result};
use serde::Serialize;
use uuid::Uuid;

use crate::tensor::{Tensor, TensorElement, TensorValue};

use super::trace::TraceEvent;

/// Values held by the Output actor at the end of one iteration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputSnapshot {
    pub iteration: usize,
    pub values: Vec<TensorValue>,
}

/// Branch a call site selected in one iteration.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct BranchRecord {
    pub iteration: usize,
    pub call: String,
    pub branch: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub actor_set: String,
    /// Number of DataPrepare firings.
    pub iterations: usize,
    /// Graph outputs of the last iteration.
    pub outputs: Vec<TensorValue>,
    pub snapshots: Vec<OutputSnapshot>,
    pub branches: Vec<BranchRecord>,
    pub trace: Vec<TraceEvent>,
    pub elapsed_micros: u128,
}

impl RunReport {
    pub(crate) fn validated(run_id: Uuid, actor_set: &str) -> Self {
        Self {
            run_id,
            actor_set: actor_set.to_string(),
            iterations: 0,
            outputs: Vec::new(),
            snapshots: Vec::new(),
            branches: Vec::new(),
            trace: Vec::new(),
            elapsed_micros: 0,
        }
    }

    pub fn output<T: TensorElement>(&self, index: usize) -> Result<Tensor<T>> {
        self.outputs
            .get(index)
            .ok_or_else(|| anyhow!("run has {} outputs, requested {}", self.outputs.len(), index))?
            .as_tensor::<T>()
    }

    /// Branches taken by one call site, in iteration order.
    pub fn branches_of(&self, call: &str) -> Vec<usize> {
        self.branches
            .iter()
            .filter(|record| record.call == call)
            .map(|record| record.branch)
            .collect()
    }
}
