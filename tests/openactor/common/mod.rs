#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use openactor::{
    ActorSet, CompiledGraph, ExecutionStrategy, OpDescriptor, Operation, Scheduler,
    SchedulerConfig, SchedulerError, TensorValue,
};

pub const STRATEGIES: [ExecutionStrategy; 2] = [ExecutionStrategy::Step, ExecutionStrategy::Pipeline];

pub fn host(id: &str, kernel: &str) -> OpDescriptor {
    OpDescriptor::host(id, kernel).unwrap_or_else(|err| panic!("host op {}: {}", kernel, err))
}

pub fn config() -> SchedulerConfig {
    SchedulerConfig::new()
        .with_threads(4)
        .with_run_timeout(Duration::from_secs(20))
}

pub fn scheduler() -> Scheduler {
    Scheduler::new(config())
}

/// Transform and schedule in one step.
pub fn launch(scheduler: &Scheduler, graph: &CompiledGraph) -> Result<Arc<ActorSet>> {
    let set = scheduler.transform(graph)?;
    scheduler.schedule(&set)?;
    Ok(set)
}

pub fn classify(err: &anyhow::Error) -> SchedulerError {
    SchedulerError::of(err)
        .cloned()
        .unwrap_or_else(|| panic!("unclassified error: {:#}", err))
}

pub fn i32s(value: &TensorValue) -> Vec<i32> {
    value
        .as_tensor::<i32>()
        .unwrap_or_else(|err| panic!("{}", err))
        .data
}

/// Identity op counting its executions.
#[derive(Debug, Default)]
pub struct Counting {
    pub calls: AtomicUsize,
}

impl Counting {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn op(self: &Arc<Self>, id: &str) -> OpDescriptor {
        OpDescriptor::new(id, self.clone(), 1, 1)
    }
}

impl Operation for Counting {
    fn name(&self) -> &str {
        "counting"
    }

    fn execute(&self, inputs: &[&TensorValue]) -> Result<Vec<TensorValue>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let first = inputs.first().ok_or_else(|| anyhow!("counting needs an input"))?;
        Ok(vec![(*first).clone()])
    }
}

/// Identity op appending its label to a shared journal.
#[derive(Debug)]
pub struct Journal {
    label: String,
    entries: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    pub fn op(id: &str, entries: &Arc<Mutex<Vec<String>>>) -> OpDescriptor {
        let journal = Journal {
            label: id.to_string(),
            entries: Arc::clone(entries),
        };
        OpDescriptor::new(id, Arc::new(journal), 1, 1)
    }
}

impl Operation for Journal {
    fn name(&self) -> &str {
        "journal"
    }

    fn execute(&self, inputs: &[&TensorValue]) -> Result<Vec<TensorValue>> {
        self.entries
            .lock()
            .map_err(|_| anyhow!("journal poisoned"))?
            .push(self.label.clone());
        let first = inputs.first().ok_or_else(|| anyhow!("journal needs an input"))?;
        Ok(vec![(*first).clone()])
    }
}

/// Op failing on every execution.
#[derive(Debug)]
pub struct Failing;

impl Operation for Failing {
    fn name(&self) -> &str {
        "failing"
    }

    fn execute(&self, _inputs: &[&TensorValue]) -> Result<Vec<TensorValue>> {
        Err(anyhow!("device lost"))
    }
}
