//! Actor runtime: transformation of compiled graphs into linked actor sets
//! and their execution.
use anyhow::Result;

use crate::graph::CompiledGraph;

mod actor;
mod build;
mod context;
mod dump;
mod global;
mod link;
mod report;
mod scheduler;
mod set;
mod store;
mod trace;
mod validate;

pub use actor::{
    Actor, ActorId, ActorType, BranchArrow, ControlArrow, DataArrow, Expect, InputSlot,
    ResultArrow, Scope, Stamp,
};
pub use dump::{ActorNode, GroupNode, Topology};
pub use global::{DeviceMemory, RunSummary};
pub use report::{BranchRecord, OutputSnapshot, RunReport};
pub use scheduler::{ExecutionStrategy, RunInputs, Scheduler};
pub use set::ActorSet;
pub use store::{DeviceTensorStore, StoreKey};
pub use trace::TraceEvent;

/// Build, link and check the actor set of one compiled graph.
pub(crate) fn transform(graph: &CompiledGraph) -> Result<ActorSet> {
    let mut draft = build::build(graph)?;
    draft.link()?;
    draft.finish()
}
