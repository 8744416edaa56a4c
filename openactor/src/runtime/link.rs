//! Second transformation pass: wire arrows between the built actors.
//!
//! Steps run in a fixed order and only ever append arrows, so linking the
//! same compiled graph twice yields the same topology.
use std::collections::{BTreeMap, HashSet};

use anyhow::Result;

use crate::device::{DeviceId, SharedDevice};
use crate::error::SchedulerError;
use crate::graph::{CallId, GraphNode, NodeId, NodeKind, ParameterKind, ValueRef};
use crate::ops::SideEffect;

use super::actor::{
    Actor, ActorId, ActorKind, BranchArrow, BranchGroup, ControlArrow, DataArrow, InputSlot,
    ResultArrow, Scope,
};
use super::build::{copy_kind, Draft, Item};
use super::store::{PersistentTensor, StoreKey};

/// Actor output a value reference resolves to. `group` is set for switch
/// outputs, which only flow when that branch is selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Endpoint {
    pub actor: ActorId,
    pub output: usize,
    pub group: Option<usize>,
    pub device: DeviceId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Source {
    /// Persistent tensor read straight from the device tensor store.
    Store { node: NodeId },
    Actor(Endpoint),
}

type ControlSource = (ActorId, Option<usize>);

/// One ordered use of a store entry, effect chain or collective group: a
/// kernel, or a whole call site as seen from its caller's scope.
#[derive(Debug, Clone, Copy)]
struct Access {
    entry: ActorId,
    exit: ActorId,
    writes: bool,
}

impl Access {
    fn kernel(actor: ActorId, writes: bool) -> Self {
        Self {
            entry: actor,
            exit: actor,
            writes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Chain {
    Store(String),
    Effects,
    Collective(String),
}

/// Accesses per scope in topological order. Accesses inside a call are
/// also summarized per call site, and lifted into the caller's scope when
/// the call's gather is reached.
#[derive(Debug, Default)]
struct Chains {
    accesses: BTreeMap<(Scope, Chain), Vec<Access>>,
    nested: BTreeMap<CallId, BTreeMap<Chain, bool>>,
}

impl Chains {
    fn record(&mut self, scope: Scope, chain: Chain, access: Access) {
        if let Scope::Branch { call, .. } = scope {
            *self
                .nested
                .entry(call)
                .or_default()
                .entry(chain.clone())
                .or_default() |= access.writes;
        }
        let accesses = self.accesses.entry((scope, chain)).or_default();
        match accesses.last_mut() {
            Some(last) if last.entry == access.entry => last.writes |= access.writes,
            _ => accesses.push(access),
        }
    }
}

impl<'a> Draft<'a> {
    pub fn link(&mut self) -> Result<()> {
        self.link_kernel_inputs()?;
        self.link_ordering()?;
        self.link_results()?;
        self.link_control_flow()?;
        crate::trace!(
            "linked {}: {} actors, {} copies",
            self.graph.name,
            self.actors.len(),
            self.copies.len()
        );
        Ok(())
    }

    fn actor_mut(&mut self, id: ActorId) -> Result<&mut Actor> {
        self.actors
            .get_mut(id)
            .ok_or_else(|| SchedulerError::link(format!("no actor #{}", id)))
    }

    fn group_mut(&mut self, switch: ActorId, branch: usize) -> Result<&mut BranchGroup> {
        self.actor_mut(switch)?
            .switch_mut()
            .and_then(|switch| switch.groups.get_mut(branch))
            .ok_or_else(|| SchedulerError::link(format!("actor #{} has no branch group {}", switch, branch)))
    }

    fn node(&self, id: NodeId) -> Result<&'a GraphNode> {
        let graph = self.graph;
        graph
            .node(id)
            .ok_or_else(|| SchedulerError::link(format!("no producer for g{}.n{}", id.graph.0, id.index)))
    }

    fn is_skipped(&self, id: NodeId) -> bool {
        self.graph
            .node(id)
            .and_then(GraphNode::kernel)
            .map_or(false, |kernel| kernel.skipped)
    }

    /// Memoized value reference → producer lookup.
    fn resolve(&mut self, value: ValueRef) -> Result<Source> {
        if let Some(source) = self.resolved.get(&value) {
            return Ok(*source);
        }
        let source = match value {
            ValueRef::Node { node, output } => self.resolve_node(node, output)?,
            ValueRef::Call { call, output } => {
                let site = self.call_of(call)?;
                if output >= site.outputs {
                    return Err(SchedulerError::link(format!(
                        "call {} has {} outputs, {} referenced",
                        site.name, site.outputs, value
                    )));
                }
                let device = self.graph_of(site.caller)?.device.id();
                let actor = *self.gathers.get(&call).ok_or_else(|| {
                    SchedulerError::link(format!("unresolved call reference {}", value))
                })?;
                Source::Actor(Endpoint {
                    actor,
                    output,
                    group: None,
                    device,
                })
            }
        };
        self.resolved.insert(value, source);
        Ok(source)
    }

    fn resolve_node(&mut self, id: NodeId, output: usize) -> Result<Source> {
        let node = self.node(id)?;
        if output >= node.output_count() {
            return Err(SchedulerError::link(format!(
                "{} has {} outputs, {} referenced",
                node.name,
                node.output_count(),
                id.out(output)
            )));
        }
        let device = self.graph_of(id.graph)?.device.id();
        let endpoint = match &node.kind {
            NodeKind::Parameter(ParameterKind::Input { position }) => {
                let (actor, output) = *self.input_slots.get(position).ok_or_else(|| {
                    SchedulerError::link(format!("no data source for input {}", node.name))
                })?;
                Endpoint {
                    actor,
                    output,
                    group: None,
                    device,
                }
            }
            NodeKind::Parameter(ParameterKind::Weight { .. }) | NodeKind::Value(_) => {
                return Ok(Source::Store { node: id });
            }
            NodeKind::Parameter(ParameterKind::Formal { position }) => {
                let Scope::Branch { call, branch } = self.scope_of(id.graph) else {
                    return Err(SchedulerError::link(format!(
                        "parameter {} belongs to a graph nobody calls",
                        node.name
                    )));
                };
                let switch = *self.switches.get(&call).ok_or_else(|| {
                    SchedulerError::link(format!("no switch for call{}", call.0))
                })?;
                let offset = self
                    .actors
                    .get(switch)
                    .and_then(Actor::switch)
                    .and_then(|switch| switch.arg_offsets.get(branch).copied())
                    .ok_or_else(|| SchedulerError::link(format!("no argument slots for {}", node.name)))?;
                let caller = self.call_of(call)?.caller;
                Endpoint {
                    actor: switch,
                    output: offset + position,
                    group: Some(branch),
                    device: self.graph_of(caller)?.device.id(),
                }
            }
            NodeKind::Kernel(kernel) if kernel.skipped => {
                let aliased = kernel.inputs.first().copied().ok_or_else(|| {
                    SchedulerError::link(format!("skipped node {} has no input", node.name))
                })?;
                return self.resolve(aliased);
            }
            NodeKind::Kernel(_) => {
                let actor = *self.kernels.get(&id).ok_or_else(|| {
                    SchedulerError::link(format!("no kernel actor for {}", node.name))
                })?;
                Endpoint {
                    actor,
                    output,
                    group: None,
                    device,
                }
            }
        };
        Ok(Source::Actor(endpoint))
    }

    fn persistent(&mut self, node: NodeId, device: &SharedDevice) -> Result<StoreKey> {
        let graph_node = self.node(node)?;
        let value = graph_node.persistent_value().ok_or_else(|| {
            SchedulerError::link(format!("{} is not a persistent tensor", graph_node.name))
        })?;
        let key = StoreKey::new(graph_node.name.clone(), device.id());
        self.persistents
            .entry(key.clone())
            .or_insert_with(|| PersistentTensor {
                key: key.clone(),
                value: value.clone(),
                device: device.clone(),
            });
        Ok(key)
    }

    fn set_slot(&mut self, actor: ActorId, variant: usize, slot: usize, input: InputSlot) -> Result<()> {
        let target = self.actor_mut(actor)?;
        let name = target.name.clone();
        let entry = target
            .inputs
            .get_mut(variant)
            .and_then(|slots| slots.get_mut(slot))
            .ok_or_else(|| SchedulerError::link(format!("{} has no input slot {}", name, slot)))?;
        *entry = input;
        Ok(())
    }

    fn add_data(&mut self, from: Endpoint, to: ActorId, slot: usize) -> Result<()> {
        let arrow = DataArrow {
            from_output: from.output,
            to,
            to_input: slot,
        };
        match from.group {
            Some(branch) => self.group_mut(from.actor, branch)?.data.push(arrow),
            None => self.actor_mut(from.actor)?.arrows.data.push(arrow),
        }
        Ok(())
    }

    fn add_control(&mut self, from: ControlSource, to: ActorId) -> Result<()> {
        if from == (to, None) || !self.controls.insert((from.0, from.1, to)) {
            return Ok(());
        }
        let arrow = ControlArrow { to };
        match from.1 {
            Some(branch) => self.group_mut(from.0, branch)?.control.push(arrow),
            None => self.actor_mut(from.0)?.arrows.control.push(arrow),
        }
        Ok(())
    }

    /// Feed one input slot, through a copy actor when devices differ.
    fn connect(
        &mut self,
        source: Source,
        consumer: ActorId,
        variant: usize,
        slot: usize,
        scope: Scope,
        device: Option<&SharedDevice>,
    ) -> Result<()> {
        match source {
            Source::Store { node } => {
                let device = match device {
                    Some(device) => device.clone(),
                    None => self.graph_of(node.graph)?.device.clone(),
                };
                let key = self.persistent(node, &device)?;
                self.set_slot(consumer, variant, slot, InputSlot::Store(key))
            }
            Source::Actor(endpoint) => {
                let endpoint = match device {
                    Some(device) if device.id() != endpoint.device => {
                        self.copy_of(endpoint, device, scope)?
                    }
                    _ => endpoint,
                };
                self.add_data(endpoint, consumer, slot)
            }
        }
    }

    /// One copy actor per (endpoint, destination device, scope).
    fn copy_of(&mut self, endpoint: Endpoint, device: &SharedDevice, scope: Scope) -> Result<Endpoint> {
        let key = (endpoint, device.id(), scope);
        let actor = match self.copies.get(&key) {
            Some(actor) => *actor,
            None => {
                let source = self
                    .actors
                    .get(endpoint.actor)
                    .map(|actor| actor.name.clone())
                    .unwrap_or_default();
                let detail = source
                    .strip_prefix(self.graph.name.as_str())
                    .and_then(|rest| rest.strip_prefix('/'))
                    .unwrap_or(&source);
                let mut name = format!(
                    "{}/copy/{}:{}->{}",
                    self.graph.name,
                    detail,
                    endpoint.output,
                    device.id()
                );
                if scope != Scope::Root {
                    name.push_str(&format!("@{}", scope));
                }
                let actor = self.push(
                    name,
                    copy_kind(endpoint.device),
                    scope,
                    Some(device.clone()),
                    vec![vec![InputSlot::Arrow]],
                );
                self.add_data(endpoint, actor, 0)?;
                self.copies.insert(key, actor);
                actor
            }
        };
        Ok(Endpoint {
            actor,
            output: 0,
            group: None,
            device: device.id(),
        })
    }

    fn link_kernel_inputs(&mut self) -> Result<()> {
        for item in self.order.clone() {
            let Item::Kernel(id) = item else {
                continue;
            };
            let Some(actor) = self.kernels.get(&id).copied() else {
                continue;
            };
            let Some(kernel) = self.node(id)?.kernel() else {
                continue;
            };
            let scope = self.scope_of(id.graph);
            let device = self.graph_of(id.graph)?.device.clone();
            for (slot, input) in kernel.inputs.iter().enumerate() {
                let source = self.resolve(*input)?;
                self.connect(source, actor, 0, slot, scope, Some(&device))?;
            }
        }
        Ok(())
    }

    /// Actors that must have run before anything ordered after `node`.
    /// Skipped nodes stand for the producers of their inputs.
    fn producers(&mut self, node: NodeId, seen: &mut HashSet<NodeId>) -> Result<Vec<ControlSource>> {
        if !seen.insert(node) {
            return Ok(Vec::new());
        }
        if let Some(actor) = self.kernels.get(&node) {
            return Ok(vec![(*actor, None)]);
        }
        let Some(kernel) = self.node(node)?.kernel() else {
            return Ok(Vec::new());
        };
        let mut found = Vec::new();
        for input in &kernel.inputs {
            match input {
                ValueRef::Node { node: inner, .. } if self.is_skipped(*inner) => {
                    found.extend(self.producers(*inner, seen)?);
                }
                _ => {
                    if let Source::Actor(endpoint) = self.resolve(*input)? {
                        found.push((endpoint.actor, endpoint.group));
                    }
                }
            }
        }
        for after in &kernel.after {
            found.extend(self.producers(*after, seen)?);
        }
        Ok(found)
    }

    /// Controls standing in for skipped nodes among `inputs`.
    fn order_after_skipped(&mut self, inputs: &[ValueRef], consumer: ActorId) -> Result<()> {
        for input in inputs {
            if let ValueRef::Node { node, .. } = input {
                if self.is_skipped(*node) {
                    for producer in self.producers(*node, &mut HashSet::new())? {
                        self.add_control(producer, consumer)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn link_ordering(&mut self) -> Result<()> {
        let graph = self.graph;
        let mut chains = Chains::default();

        for item in self.order.clone() {
            match item {
                Item::Kernel(id) => {
                    let Some(actor) = self.kernels.get(&id).copied() else {
                        continue;
                    };
                    let Some(kernel) = self.node(id)?.kernel() else {
                        continue;
                    };
                    let scope = self.scope_of(id.graph);
                    for after in &kernel.after {
                        for producer in self.producers(*after, &mut HashSet::new())? {
                            self.add_control(producer, actor)?;
                        }
                    }
                    self.order_after_skipped(&kernel.inputs, actor)?;

                    for (slot, input) in kernel.inputs.iter().enumerate() {
                        let Source::Store { node } = self.resolve(*input)? else {
                            continue;
                        };
                        let writer = kernel.op.side_effect == SideEffect::InPlace { input: slot };
                        if writer {
                            self.mark_write_back(actor, slot)?;
                        }
                        let name = self.node(node)?.name.clone();
                        chains.record(scope, Chain::Store(name), Access::kernel(actor, writer));
                    }
                    if kernel.op.side_effect == SideEffect::Opaque {
                        chains.record(scope, Chain::Effects, Access::kernel(actor, true));
                    }
                    if let Some(group) = &kernel.op.collective {
                        chains.record(scope, Chain::Collective(group.clone()), Access::kernel(actor, true));
                    }
                }
                Item::Switch(call) => {
                    let Some(switch) = self.switches.get(&call).copied() else {
                        continue;
                    };
                    let operands: Vec<ValueRef> = self.call_of(call)?.operands().copied().collect();
                    self.order_after_skipped(&operands, switch)?;
                }
                Item::Gather(call) => {
                    let Some(gather) = self.gathers.get(&call).copied() else {
                        continue;
                    };
                    let site = self.call_of(call)?;
                    for branch in &site.branches {
                        if let Some(callee) = graph.graph(branch.graph) {
                            self.order_after_skipped(&callee.results, gather)?;
                        }
                    }
                    // Seen from the caller, the whole call site is one access
                    // entered at its switch and left at its gather.
                    let Some(switch) = self.switches.get(&call).copied() else {
                        continue;
                    };
                    let scope = self.scope_of(site.caller);
                    for (chain, writes) in chains.nested.remove(&call).unwrap_or_default() {
                        let access = Access {
                            entry: switch,
                            exit: gather,
                            writes,
                        };
                        chains.record(scope, chain, access);
                    }
                }
            }
        }

        for ((_, chain), accesses) in &chains.accesses {
            match chain {
                Chain::Store(_) => self.order_store_accesses(accesses)?,
                Chain::Effects | Chain::Collective(_) => {
                    for pair in accesses.windows(2) {
                        self.add_control((pair[0].exit, None), pair[1].entry)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Readers before a writer, the writer before later readers, writers in
    /// sequence.
    fn order_store_accesses(&mut self, accesses: &[Access]) -> Result<()> {
        let mut writer: Option<Access> = None;
        let mut readers: Vec<Access> = Vec::new();
        for access in accesses {
            if access.writes {
                for reader in readers.drain(..) {
                    self.add_control((reader.exit, None), access.entry)?;
                }
                if let Some(previous) = writer {
                    self.add_control((previous.exit, None), access.entry)?;
                }
                writer = Some(*access);
            } else {
                if let Some(previous) = writer {
                    self.add_control((previous.exit, None), access.entry)?;
                }
                readers.push(*access);
            }
        }
        Ok(())
    }

    fn mark_write_back(&mut self, actor: ActorId, slot: usize) -> Result<()> {
        let target = self.actor_mut(actor)?;
        let key = match target.inputs.first().and_then(|slots| slots.get(slot)) {
            Some(InputSlot::Store(key)) => key.clone(),
            _ => return Ok(()),
        };
        if let ActorKind::Kernel(kernel) = &mut target.kind {
            kernel.write_back = Some(key);
        }
        Ok(())
    }

    fn link_results(&mut self) -> Result<()> {
        let graph = self.graph;
        let output = self.output;
        for (position, value) in graph.outputs.iter().enumerate() {
            match self.resolve(*value)? {
                source @ Source::Store { .. } => {
                    // LoopCount reads the entry before the next iteration can
                    // write it and forwards it as a result.
                    let loop_count = self.loop_count;
                    let slot = {
                        let actor = self.actor_mut(loop_count)?;
                        let slots = actor.inputs.first_mut().ok_or_else(|| {
                            SchedulerError::link(format!("{} has no input slots", actor.name))
                        })?;
                        slots.push(InputSlot::Arrow);
                        slots.len() - 1
                    };
                    self.connect(source, loop_count, 0, slot, Scope::Root, None)?;
                    self.actor_mut(loop_count)?.arrows.result.push(ResultArrow {
                        from_output: slot,
                        to: output,
                        to_input: position,
                    });
                }
                Source::Actor(endpoint) => {
                    let scope = self.actors.get(endpoint.actor).map(|actor| actor.scope);
                    if endpoint.group.is_some() || scope != Some(Scope::Root) {
                        return Err(SchedulerError::link(format!(
                            "graph output {} refers to branch-local value {}",
                            position, value
                        )));
                    }
                    self.actor_mut(endpoint.actor)?.arrows.result.push(ResultArrow {
                        from_output: endpoint.output,
                        to: output,
                        to_input: position,
                    });
                }
            }
        }
        Ok(())
    }

    fn link_control_flow(&mut self) -> Result<()> {
        for item in self.order.clone() {
            match item {
                Item::Switch(call) => self.link_switch(call)?,
                Item::Gather(call) => self.link_gather(call)?,
                Item::Kernel(_) => {}
            }
        }
        self.link_entries()?;
        self.link_tails()?;
        self.add_control((self.loop_count, None), self.output)
    }

    fn link_switch(&mut self, call: CallId) -> Result<()> {
        let site = self.call_of(call)?;
        let switch = *self
            .switches
            .get(&call)
            .ok_or_else(|| SchedulerError::link(format!("no switch for {}", site.name)))?;
        let gather = *self
            .gathers
            .get(&call)
            .ok_or_else(|| SchedulerError::link(format!("no gather for {}", site.name)))?;
        let device = self.graph_of(site.caller)?.device.clone();
        let scope = self.scope_of(site.caller);
        let offsets = self
            .actors
            .get(switch)
            .and_then(Actor::switch)
            .map(|switch| switch.arg_offsets.clone())
            .unwrap_or_default();
        if let Some(cond) = site.cond {
            let source = self.resolve(cond)?;
            self.connect(source, switch, 0, 0, scope, Some(&device))?;
        }
        for (index, branch) in site.branches.iter().enumerate() {
            let offset = offsets.get(index).copied().unwrap_or(0);
            for (position, arg) in branch.args.iter().enumerate() {
                let source = self.resolve(*arg)?;
                self.connect(source, switch, 0, offset + position, scope, Some(&device))?;
            }
            self.group_mut(switch, index)?.gather = Some(gather);
        }
        Ok(())
    }

    fn link_gather(&mut self, call: CallId) -> Result<()> {
        let site = self.call_of(call)?;
        let gather = *self
            .gathers
            .get(&call)
            .ok_or_else(|| SchedulerError::link(format!("no gather for {}", site.name)))?;
        let device = self.graph_of(site.caller)?.device.clone();
        for (index, branch) in site.branches.iter().enumerate() {
            let scope = Scope::Branch {
                call,
                branch: index,
            };
            for (position, result) in self.graph_of(branch.graph)?.results.iter().enumerate() {
                let source = self.resolve(*result)?;
                self.connect(source, gather, index, position, scope, Some(&device))?;
            }
        }
        Ok(())
    }

    fn incoming(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.actors.len()];
        let mut hit = |to: ActorId| {
            if let Some(count) = counts.get_mut(to) {
                *count += 1;
            }
        };
        for actor in &self.actors {
            let arrows = &actor.arrows;
            arrows.data.iter().for_each(|arrow| hit(arrow.to));
            arrows.control.iter().for_each(|arrow| hit(arrow.to));
            arrows.branch.iter().for_each(|arrow| hit(arrow.to));
            arrows.result.iter().for_each(|arrow| hit(arrow.to));
            arrows.trigger.iter().for_each(|to| hit(*to));
            if let Some(switch) = actor.switch() {
                for group in &switch.groups {
                    group.data.iter().for_each(|arrow| hit(arrow.to));
                    group.control.iter().for_each(|arrow| hit(arrow.to));
                    group.gather.iter().for_each(|to| hit(*to));
                }
            }
        }
        counts
    }

    /// Actors nothing feeds: triggered by DataPrepare at the root, entered
    /// through their switch's branch group inside a branch.
    fn link_entries(&mut self) -> Result<()> {
        let incoming = self.incoming();
        let data_prepare = self.data_prepare;
        for id in 0..self.actors.len() {
            let actor = &self.actors[id];
            let fixed = matches!(
                actor.kind,
                ActorKind::DataPrepare | ActorKind::DataSource(_) | ActorKind::LoopCount | ActorKind::Output
            );
            let scope = actor.scope;
            if fixed || incoming.get(id).copied().unwrap_or(0) > 0 {
                continue;
            }
            match scope {
                Scope::Root => self.actor_mut(data_prepare)?.arrows.trigger.push(id),
                Scope::Branch { call, branch } => {
                    let switch = *self.switches.get(&call).ok_or_else(|| {
                        SchedulerError::link(format!("no switch for call{}", call.0))
                    })?;
                    self.add_control((switch, Some(branch)), id)?;
                }
            }
        }
        for source in self.data_sources.clone() {
            self.add_control((data_prepare, None), source)?;
        }
        Ok(())
    }

    /// Actors without successors report to their gather or to LoopCount.
    fn link_tails(&mut self) -> Result<()> {
        let loop_count = self.loop_count;
        for id in 0..self.actors.len() {
            let actor = &self.actors[id];
            if matches!(actor.kind, ActorKind::LoopCount | ActorKind::Output | ActorKind::Switch(_)) {
                continue;
            }
            let scope = actor.scope;
            let root_gather = matches!(actor.kind, ActorKind::Gather(_)) && scope == Scope::Root;
            let tail = !actor.arrows.has_successors();
            if root_gather {
                self.actor_mut(id)?.arrows.branch.push(BranchArrow { to: loop_count });
                continue;
            }
            if !tail {
                continue;
            }
            let target = match scope {
                Scope::Root => loop_count,
                Scope::Branch { call, .. } => *self.gathers.get(&call).ok_or_else(|| {
                    SchedulerError::link(format!("no gather for call{}", call.0))
                })?,
            };
            self.add_control((id, None), target)?;
        }
        Ok(())
    }
}
