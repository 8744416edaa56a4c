//! Actor types, arrows and the closed set of actor kinds.
use std::fmt;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use serde::Serialize;

use crate::device::{DeviceId, SharedDevice};
use crate::graph::CallId;
use crate::ops::OpDescriptor;

use super::store::StoreKey;

mod fire;
mod inbox;

pub(crate) use inbox::{Fired, Inbox, Message};

pub type ActorId = usize;

/// Generation of an inbox: run sequence number and iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Stamp {
    pub run: u64,
    pub iteration: usize,
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run {} iteration {}", self.run, self.iteration)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    DataPrepare,
    DataSource,
    Kernel,
    NoInputKernel,
    Switch,
    Gather,
    Copy,
    LoopCount,
    Output,
}

impl fmt::Display for ActorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActorType::DataPrepare => "data_prepare",
            ActorType::DataSource => "data_source",
            ActorType::Kernel => "kernel",
            ActorType::NoInputKernel => "no_input_kernel",
            ActorType::Switch => "switch",
            ActorType::Gather => "gather",
            ActorType::Copy => "copy",
            ActorType::LoopCount => "loop_count",
            ActorType::Output => "output",
        };
        write!(f, "{}", name)
    }
}

/// Part of the graph an actor belongs to. Branch actors only run when their
/// call site selects the branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Root,
    Branch { call: CallId, branch: usize },
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Root => write!(f, "root"),
            Scope::Branch { call, branch } => write!(f, "call{}.b{}", call.0, branch),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DataArrow {
    pub from_output: usize,
    pub to: ActorId,
    pub to_input: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ControlArrow {
    pub to: ActorId,
}

/// Carries the selected branch id: Switch → Gather, Gather → LoopCount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct BranchArrow {
    pub to: ActorId,
}

/// Value delivered into an Output slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ResultArrow {
    pub from_output: usize,
    pub to: ActorId,
    pub to_input: usize,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Arrows {
    pub data: Vec<DataArrow>,
    pub control: Vec<ControlArrow>,
    pub branch: Vec<BranchArrow>,
    pub result: Vec<ResultArrow>,
    /// Actors with no other inputs, fired by `Message::Trigger`.
    pub trigger: Vec<ActorId>,
}

impl Arrows {
    /// Arrows that keep the iteration going; result arrows do not count.
    pub fn has_successors(&self) -> bool {
        !self.data.is_empty()
            || !self.control.is_empty()
            || !self.branch.is_empty()
            || !self.trigger.is_empty()
    }
}

/// Where one input slot gets its value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InputSlot {
    Arrow,
    Store(StoreKey),
}

/// Readiness thresholds. Gathers keep one entry per branch in `data` and
/// `control`; every other actor has exactly one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Expect {
    pub data: Vec<usize>,
    pub control: Vec<usize>,
    pub branch: usize,
    pub by_branch: bool,
}

impl Expect {
    pub fn is_empty(&self) -> bool {
        self.branch == 0
            && self.data.iter().all(|count| *count == 0)
            && self.control.iter().all(|count| *count == 0)
    }
}

/// Arrows a switch emits when it selects one branch.
#[derive(Debug, Clone, Default)]
pub(crate) struct BranchGroup {
    pub data: Vec<DataArrow>,
    pub control: Vec<ControlArrow>,
    pub gather: Option<ActorId>,
}

#[derive(Debug)]
pub(crate) struct DataSourceActor {
    /// Host input position of each output.
    pub positions: Vec<usize>,
}

#[derive(Debug, Default)]
pub(crate) struct KernelState {
    pub prepared: bool,
    pub shapes: Option<Vec<Vec<usize>>>,
}

#[derive(Debug)]
pub(crate) struct KernelActor {
    pub op: OpDescriptor,
    /// Store entry updated with output 0 of an in-place op.
    pub write_back: Option<StoreKey>,
    pub state: Mutex<KernelState>,
}

#[derive(Debug)]
pub(crate) struct CopyActor {
    pub from: DeviceId,
}

#[derive(Debug)]
pub(crate) struct SwitchActor {
    pub call: CallId,
    pub call_name: String,
    pub has_cond: bool,
    /// First input slot of each branch's arguments.
    pub arg_offsets: Vec<usize>,
    pub groups: Vec<BranchGroup>,
}

#[derive(Debug)]
pub(crate) struct GatherActor {
    pub call: CallId,
    pub call_name: String,
}

#[derive(Debug)]
pub(crate) enum ActorKind {
    DataPrepare,
    DataSource(DataSourceActor),
    Kernel(KernelActor),
    Copy(CopyActor),
    Switch(SwitchActor),
    Gather(GatherActor),
    LoopCount,
    Output,
}

#[derive(Debug)]
pub struct Actor {
    pub(crate) id: ActorId,
    pub(crate) name: String,
    pub(crate) kind: ActorKind,
    pub(crate) scope: Scope,
    pub(crate) device: Option<SharedDevice>,
    /// Input slots per branch variant; see [`Expect`].
    pub(crate) inputs: Vec<Vec<InputSlot>>,
    pub(crate) expect: Expect,
    pub(crate) arrows: Arrows,
    pub(crate) inbox: Mutex<Inbox>,
}

impl Actor {
    pub(crate) fn new(
        id: ActorId,
        name: String,
        kind: ActorKind,
        scope: Scope,
        device: Option<SharedDevice>,
        inputs: Vec<Vec<InputSlot>>,
    ) -> Self {
        Self {
            id,
            name,
            kind,
            scope,
            device,
            inputs,
            expect: Expect::default(),
            arrows: Arrows::default(),
            inbox: Mutex::new(Inbox::default()),
        }
    }

    pub fn id(&self) -> ActorId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn expect(&self) -> &Expect {
        &self.expect
    }

    pub fn device_id(&self) -> Option<DeviceId> {
        self.device.as_ref().map(|device| device.id())
    }

    pub fn actor_type(&self) -> ActorType {
        match &self.kind {
            ActorKind::DataPrepare => ActorType::DataPrepare,
            ActorKind::DataSource(_) => ActorType::DataSource,
            ActorKind::Kernel(_) if self.expect.is_empty() => ActorType::NoInputKernel,
            ActorKind::Kernel(_) => ActorType::Kernel,
            ActorKind::Copy(_) => ActorType::Copy,
            ActorKind::Switch(_) => ActorType::Switch,
            ActorKind::Gather(_) => ActorType::Gather,
            ActorKind::LoopCount => ActorType::LoopCount,
            ActorKind::Output => ActorType::Output,
        }
    }

    pub(crate) fn device(&self) -> Result<&SharedDevice> {
        self.device
            .as_ref()
            .ok_or_else(|| anyhow!("actor {} has no device", self.name))
    }

    pub(crate) fn slot_count(&self) -> usize {
        self.inputs.first().map_or(0, Vec::len)
    }

    pub(crate) fn switch(&self) -> Option<&SwitchActor> {
        match &self.kind {
            ActorKind::Switch(switch) => Some(switch),
            _ => None,
        }
    }

    pub(crate) fn switch_mut(&mut self) -> Option<&mut SwitchActor> {
        match &mut self.kind {
            ActorKind::Switch(switch) => Some(switch),
            _ => None,
        }
    }

    pub(crate) fn gather_call(&self) -> Option<CallId> {
        match &self.kind {
            ActorKind::Gather(gather) => Some(gather.call),
            _ => None,
        }
    }

    pub(crate) fn kernel(&self) -> Option<&KernelActor> {
        match &self.kind {
            ActorKind::Kernel(kernel) => Some(kernel),
            _ => None,
        }
    }

    /// One-line progress summary of a pending actor for the given run.
    pub(crate) fn progress(&self, run: u64) -> Option<String> {
        let inbox = self.inbox.lock().ok()?;
        inbox.progress(run, &self.expect).map(|summary| format!("{} ({})", self.name, summary))
    }
}
