//! First transformation pass: validate the compiled graph, order its
//! kernels and call sites, and create one actor per schedulable item.
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use anyhow::Result;

use crate::device::{DeviceId, SharedDevice};
use crate::error::SchedulerError;
use crate::graph::{
    CallId, CallSite, CompiledGraph, GraphId, GraphNode, KernelGraph, NodeId, NodeKind,
    ParameterKind, ValueRef,
};

use super::actor::{
    Actor, ActorId, ActorKind, BranchGroup, CopyActor, DataSourceActor, Expect, GatherActor,
    InputSlot, KernelActor, KernelState, Scope, SwitchActor,
};
use super::link::{Endpoint, Source};
use super::set::ActorSet;
use super::store::{PersistentTensor, StoreKey};
use super::validate;

/// Schedulable unit of the compiled graph, in dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) enum Item {
    Kernel(NodeId),
    Switch(CallId),
    Gather(CallId),
}

/// Actor set under construction, shared by build and link.
pub(crate) struct Draft<'a> {
    pub graph: &'a CompiledGraph,
    pub actors: Vec<Actor>,
    pub scopes: Vec<Scope>,
    pub order: Vec<Item>,
    pub data_prepare: ActorId,
    pub data_sources: Vec<ActorId>,
    /// Host input position → (data source, output).
    pub input_slots: HashMap<usize, (ActorId, usize)>,
    pub kernels: HashMap<NodeId, ActorId>,
    pub switches: HashMap<CallId, ActorId>,
    pub gathers: HashMap<CallId, ActorId>,
    pub loop_count: ActorId,
    pub output: ActorId,
    pub persistents: BTreeMap<StoreKey, PersistentTensor>,
    pub resolved: HashMap<ValueRef, Source>,
    pub copies: HashMap<(Endpoint, DeviceId, Scope), ActorId>,
    pub controls: HashSet<(ActorId, Option<usize>, ActorId)>,
}

pub(crate) fn build(graph: &CompiledGraph) -> Result<Draft<'_>> {
    let owners = check_graph(graph)?;
    let scopes = graph
        .graphs
        .iter()
        .map(|kernel_graph| match owners.get(&kernel_graph.id) {
            Some((call, branch)) => Scope::Branch {
                call: *call,
                branch: *branch,
            },
            None => Scope::Root,
        })
        .collect();
    let order = topological_order(graph, &owners)?;
    let mut draft = Draft {
        graph,
        actors: Vec::new(),
        scopes,
        order,
        data_prepare: 0,
        data_sources: Vec::new(),
        input_slots: HashMap::new(),
        kernels: HashMap::new(),
        switches: HashMap::new(),
        gathers: HashMap::new(),
        loop_count: 0,
        output: 0,
        persistents: BTreeMap::new(),
        resolved: HashMap::new(),
        copies: HashMap::new(),
        controls: HashSet::new(),
    };
    draft.create_actors()?;
    crate::trace!(
        "built {} actors for {} ({} kernels, {} calls)",
        draft.actors.len(),
        graph.name,
        draft.kernels.len(),
        graph.calls.len()
    );
    Ok(draft)
}

type Owners = HashMap<GraphId, (CallId, usize)>;

fn check_graph(graph: &CompiledGraph) -> Result<Owners> {
    let mut graph_names = HashSet::new();
    for (index, kernel_graph) in graph.graphs.iter().enumerate() {
        if kernel_graph.id.0 != index {
            return Err(SchedulerError::build(format!(
                "graph {} is stored at position {}",
                kernel_graph.name, index
            )));
        }
        if !graph_names.insert(kernel_graph.name.as_str()) {
            return Err(SchedulerError::build(format!(
                "duplicate graph name {}",
                kernel_graph.name
            )));
        }
        let mut node_names = HashSet::new();
        for (position, node) in kernel_graph.nodes.iter().enumerate() {
            let expected = NodeId {
                graph: kernel_graph.id,
                index: position,
            };
            if node.id != expected {
                return Err(SchedulerError::build(format!(
                    "node {} of graph {} carries a foreign id",
                    node.name, kernel_graph.name
                )));
            }
            if !node_names.insert(node.name.as_str()) {
                return Err(SchedulerError::build(format!(
                    "duplicate node name {} in graph {}",
                    node.name, kernel_graph.name
                )));
            }
        }
    }

    let mut call_names = HashSet::new();
    let mut owners = Owners::new();
    for (index, call) in graph.calls.iter().enumerate() {
        if call.id.0 != index {
            return Err(SchedulerError::build(format!(
                "call {} is stored at position {}",
                call.name, index
            )));
        }
        if !call_names.insert(call.name.as_str()) {
            return Err(SchedulerError::build(format!("duplicate call name {}", call.name)));
        }
        if graph.graph(call.caller).is_none() {
            return Err(SchedulerError::build(format!(
                "call {} is made from unknown graph g{}",
                call.name, call.caller.0
            )));
        }
        if call.branches.is_empty() {
            return Err(SchedulerError::build(format!("call {} has no branches", call.name)));
        }
        if call.branches.len() > 1 && call.cond.is_none() {
            return Err(SchedulerError::build(format!(
                "call {} selects among {} branches without a condition",
                call.name,
                call.branches.len()
            )));
        }
        for (branch, target) in call.branches.iter().enumerate() {
            let callee = graph.graph(target.graph).ok_or_else(|| {
                SchedulerError::build(format!(
                    "call {} targets unknown graph g{}",
                    call.name, target.graph.0
                ))
            })?;
            if target.graph == call.caller {
                return Err(SchedulerError::build(format!(
                    "graph {} calls itself through {}; recursive programs must be linearized",
                    callee.name, call.name
                )));
            }
            if let Some((other, _)) = owners.insert(target.graph, (call.id, branch)) {
                let other = graph.call(other).map_or("?", |site| site.name.as_str());
                return Err(SchedulerError::build(format!(
                    "graph {} is called from {} and {}; a branch graph has a single call site",
                    callee.name, other, call.name
                )));
            }
            if callee.formal_count() != target.args.len() {
                return Err(SchedulerError::build(format!(
                    "call {} passes {} arguments to graph {} which declares {} parameters",
                    call.name,
                    target.args.len(),
                    callee.name,
                    callee.formal_count()
                )));
            }
            if callee.results.len() != call.outputs {
                return Err(SchedulerError::build(format!(
                    "graph {} returns {} values but call {} expects {}",
                    callee.name,
                    callee.results.len(),
                    call.name,
                    call.outputs
                )));
            }
        }
    }

    for kernel_graph in &graph.graphs {
        let owned = owners.contains_key(&kernel_graph.id);
        check_nodes(graph, kernel_graph, owned)?;
        let from = Some(kernel_graph.id);
        for node in &kernel_graph.nodes {
            if let Some(kernel) = node.kernel() {
                for input in &kernel.inputs {
                    check_visible(graph, &owners, from, input, &node.name)?;
                }
            }
        }
        for result in &kernel_graph.results {
            check_visible(graph, &owners, from, result, &kernel_graph.name)?;
        }
    }
    for call in &graph.calls {
        for operand in call.operands() {
            check_visible(graph, &owners, Some(call.caller), operand, &call.name)?;
        }
    }
    for output in &graph.outputs {
        check_visible(graph, &owners, None, output, "graph output")?;
    }
    Ok(owners)
}

fn check_nodes(graph: &CompiledGraph, kernel_graph: &KernelGraph, owned: bool) -> Result<()> {
    let formals = kernel_graph.formal_count();
    for node in &kernel_graph.nodes {
        match &node.kind {
            NodeKind::Parameter(ParameterKind::Input { .. }) if owned => {
                return Err(SchedulerError::build(format!(
                    "branch graph {} declares input {}",
                    kernel_graph.name, node.name
                )));
            }
            NodeKind::Parameter(ParameterKind::Formal { .. }) if !owned => {
                return Err(SchedulerError::build(format!(
                    "graph {} is never called but declares parameter {}",
                    kernel_graph.name, node.name
                )));
            }
            NodeKind::Parameter(ParameterKind::Formal { position }) if *position >= formals => {
                return Err(SchedulerError::build(format!(
                    "parameter {} of graph {} has position {} out of {}",
                    node.name, kernel_graph.name, position, formals
                )));
            }
            NodeKind::Kernel(kernel) => {
                if kernel.inputs.len() != kernel.op.inputs.len() {
                    return Err(SchedulerError::build(format!(
                        "node {} passes {} inputs to op {} which takes {}",
                        node.name,
                        kernel.inputs.len(),
                        kernel.op.id,
                        kernel.op.inputs.len()
                    )));
                }
                if kernel.skipped && kernel.inputs.is_empty() {
                    return Err(SchedulerError::build(format!(
                        "skipped node {} has no input to alias",
                        node.name
                    )));
                }
                for after in &kernel.after {
                    let is_kernel = graph.node(*after).and_then(GraphNode::kernel).is_some();
                    if after.graph != kernel_graph.id || !is_kernel {
                        return Err(SchedulerError::build(format!(
                            "ordering marker of {} must name a kernel of graph {}",
                            node.name, kernel_graph.name
                        )));
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Branch graphs only see their own values and persistent tensors; root
/// graphs see every root value.
fn check_visible(
    graph: &CompiledGraph,
    owners: &Owners,
    from: Option<GraphId>,
    value: &ValueRef,
    user: &str,
) -> Result<()> {
    let (owner, name) = match value {
        ValueRef::Node { node, .. } => match graph.node(*node) {
            Some(target) if target.persistent_value().is_some() => return Ok(()),
            Some(target) => (node.graph, target.name.as_str()),
            None => return Ok(()),
        },
        ValueRef::Call { call, .. } => match graph.call(*call) {
            Some(site) => (site.caller, site.name.as_str()),
            None => return Ok(()),
        },
    };
    let from_root = from.map_or(true, |id| !owners.contains_key(&id));
    if from == Some(owner) || (from_root && !owners.contains_key(&owner)) {
        return Ok(());
    }
    Err(SchedulerError::build(format!(
        "{} references {} outside its scope",
        user, name
    )))
}

fn item_key(graph: &CompiledGraph, item: Item) -> (usize, usize, u8, usize) {
    let call_key = |call: CallId, rank: u8| match graph.call(call) {
        Some(site) => (site.caller.0, site.position, rank, call.0),
        None => (usize::MAX, usize::MAX, rank, call.0),
    };
    match item {
        Item::Switch(call) => call_key(call, 0),
        Item::Gather(call) => call_key(call, 1),
        Item::Kernel(node) => (node.graph.0, node.index, 2, 0),
    }
}

pub(crate) fn describe_item(graph: &CompiledGraph, item: Item) -> String {
    let call_name = |call: CallId| graph.call(call).map_or("?", |site| site.name.as_str());
    match item {
        Item::Kernel(node) => graph
            .node(node)
            .map_or_else(|| format!("g{}.n{}", node.graph.0, node.index), |n| n.name.clone()),
        Item::Switch(call) => format!("switch {}", call_name(call)),
        Item::Gather(call) => format!("gather {}", call_name(call)),
    }
}

/// Kahn sort over kernels and call sites; ties break on graph position so
/// repeated builds yield the same order.
fn topological_order(graph: &CompiledGraph, owners: &Owners) -> Result<Vec<Item>> {
    let value_item = |value: &ValueRef| match value {
        ValueRef::Node { node, .. } => graph
            .node(*node)
            .and_then(GraphNode::kernel)
            .map(|_| Item::Kernel(*node)),
        ValueRef::Call { call, .. } => graph.call(*call).map(|_| Item::Gather(*call)),
    };
    let entry = |graph_id: GraphId| owners.get(&graph_id).map(|(call, _)| Item::Switch(*call));

    let mut members: HashMap<GraphId, Vec<Item>> = HashMap::new();
    let mut deps: BTreeMap<Item, BTreeSet<Item>> = BTreeMap::new();
    for kernel_graph in &graph.graphs {
        for (node, kernel) in kernel_graph.kernels() {
            let item = Item::Kernel(node.id);
            members.entry(kernel_graph.id).or_default().push(item);
            let needs = deps.entry(item).or_default();
            needs.extend(kernel.inputs.iter().filter_map(value_item));
            needs.extend(kernel.after.iter().map(|after| Item::Kernel(*after)));
            needs.extend(entry(kernel_graph.id));
        }
    }
    for call in &graph.calls {
        let items = members.entry(call.caller).or_default();
        items.push(Item::Switch(call.id));
        items.push(Item::Gather(call.id));
    }
    for call in &graph.calls {
        let switch = deps.entry(Item::Switch(call.id)).or_default();
        switch.extend(call.operands().filter_map(value_item));
        switch.extend(entry(call.caller));
        let gather = gather_deps(graph, call, &members, &value_item);
        deps.insert(Item::Gather(call.id), gather);
    }

    let mut indegree: HashMap<Item, usize> = HashMap::new();
    let mut users: HashMap<Item, Vec<Item>> = HashMap::new();
    for (item, needs) in &deps {
        indegree.insert(*item, needs.len());
        for need in needs {
            users.entry(*need).or_default().push(*item);
        }
    }
    let mut ready: BTreeSet<((usize, usize, u8, usize), Item)> = indegree
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(item, _)| (item_key(graph, *item), *item))
        .collect();
    let mut order = Vec::with_capacity(deps.len());
    while let Some(next) = ready.iter().next().copied() {
        ready.remove(&next);
        let item = next.1;
        order.push(item);
        for user in users.get(&item).map(Vec::as_slice).unwrap_or_default() {
            if let Some(count) = indegree.get_mut(user) {
                *count -= 1;
                if *count == 0 {
                    ready.insert((item_key(graph, *user), *user));
                }
            }
        }
    }
    if order.len() != deps.len() {
        let placed: HashSet<Item> = order.iter().copied().collect();
        let mut stuck: Vec<String> = deps
            .keys()
            .filter(|item| !placed.contains(item))
            .map(|item| describe_item(graph, *item))
            .collect();
        stuck.sort();
        return Err(SchedulerError::build(format!(
            "dependency cycle among {}",
            stuck.join(", ")
        )));
    }
    Ok(order)
}

fn gather_deps(
    graph: &CompiledGraph,
    call: &CallSite,
    members: &HashMap<GraphId, Vec<Item>>,
    value_item: &dyn Fn(&ValueRef) -> Option<Item>,
) -> BTreeSet<Item> {
    let mut needs = BTreeSet::new();
    needs.insert(Item::Switch(call.id));
    for branch in &call.branches {
        if let Some(items) = members.get(&branch.graph) {
            needs.extend(items.iter().copied());
        }
        if let Some(callee) = graph.graph(branch.graph) {
            needs.extend(callee.results.iter().filter_map(value_item));
        }
    }
    needs
}

impl<'a> Draft<'a> {
    pub fn graph_of(&self, id: GraphId) -> Result<&'a KernelGraph> {
        let graph = self.graph;
        graph
            .graph(id)
            .ok_or_else(|| SchedulerError::link(format!("unknown graph g{}", id.0)))
    }

    pub fn call_of(&self, id: CallId) -> Result<&'a CallSite> {
        let graph = self.graph;
        graph
            .call(id)
            .ok_or_else(|| SchedulerError::link(format!("unresolved call reference call{}", id.0)))
    }

    pub fn scope_of(&self, id: GraphId) -> Scope {
        self.scopes.get(id.0).copied().unwrap_or(Scope::Root)
    }

    pub fn push(
        &mut self,
        name: String,
        kind: ActorKind,
        scope: Scope,
        device: Option<SharedDevice>,
        inputs: Vec<Vec<InputSlot>>,
    ) -> ActorId {
        let id = self.actors.len();
        self.actors.push(Actor::new(id, name, kind, scope, device, inputs));
        id
    }

    fn create_actors(&mut self) -> Result<()> {
        let graph = self.graph;
        let set = graph.name.as_str();
        self.data_prepare = self.push(
            format!("{set}/data_prepare"),
            ActorKind::DataPrepare,
            Scope::Root,
            None,
            vec![Vec::new()],
        );

        let mut hosts: BTreeMap<DeviceId, (SharedDevice, Vec<usize>)> = BTreeMap::new();
        for kernel_graph in &graph.graphs {
            for node in &kernel_graph.nodes {
                if let NodeKind::Parameter(ParameterKind::Input { position }) = node.kind {
                    hosts
                        .entry(kernel_graph.device.id())
                        .or_insert_with(|| (kernel_graph.device.clone(), Vec::new()))
                        .1
                        .push(position);
                }
            }
        }
        for (device_id, (device, mut positions)) in hosts {
            positions.sort_unstable();
            let actor = self.push(
                format!("{set}/data_source/{device_id}"),
                ActorKind::DataSource(DataSourceActor {
                    positions: positions.clone(),
                }),
                Scope::Root,
                Some(device),
                vec![Vec::new()],
            );
            for (output, position) in positions.into_iter().enumerate() {
                self.input_slots.insert(position, (actor, output));
            }
            self.data_sources.push(actor);
        }

        for item in self.order.clone() {
            match item {
                Item::Kernel(id) => {
                    let kernel_graph = self.graph_of(id.graph)?;
                    let Some(node) = kernel_graph.nodes.get(id.index) else {
                        continue;
                    };
                    let Some(kernel) = node.kernel() else {
                        continue;
                    };
                    if kernel.skipped {
                        continue;
                    }
                    let actor = self.push(
                        format!("{set}/kernel/{}/{}", kernel_graph.name, node.name),
                        ActorKind::Kernel(KernelActor {
                            op: kernel.op.clone(),
                            write_back: None,
                            state: std::sync::Mutex::new(KernelState::default()),
                        }),
                        self.scope_of(id.graph),
                        Some(kernel_graph.device.clone()),
                        vec![vec![InputSlot::Arrow; kernel.inputs.len()]],
                    );
                    self.kernels.insert(id, actor);
                }
                Item::Switch(call) => {
                    let site = self.call_of(call)?;
                    let caller = self.graph_of(site.caller)?;
                    let mut offset = usize::from(site.cond.is_some());
                    let mut arg_offsets = Vec::with_capacity(site.branches.len());
                    for branch in &site.branches {
                        arg_offsets.push(offset);
                        offset += branch.args.len();
                    }
                    let actor = self.push(
                        format!("{set}/switch/{}", site.name),
                        ActorKind::Switch(SwitchActor {
                            call,
                            call_name: site.name.clone(),
                            has_cond: site.cond.is_some(),
                            arg_offsets,
                            groups: vec![BranchGroup::default(); site.branches.len()],
                        }),
                        self.scope_of(site.caller),
                        Some(caller.device.clone()),
                        vec![vec![InputSlot::Arrow; offset]],
                    );
                    self.switches.insert(call, actor);
                }
                Item::Gather(call) => {
                    let site = self.call_of(call)?;
                    let caller = self.graph_of(site.caller)?;
                    let actor = self.push(
                        format!("{set}/gather/{}", site.name),
                        ActorKind::Gather(GatherActor {
                            call,
                            call_name: site.name.clone(),
                        }),
                        self.scope_of(site.caller),
                        Some(caller.device.clone()),
                        vec![vec![InputSlot::Arrow; site.outputs]; site.branches.len()],
                    );
                    self.gathers.insert(call, actor);
                }
            }
        }

        self.loop_count = self.push(
            format!("{set}/loop_count"),
            ActorKind::LoopCount,
            Scope::Root,
            None,
            vec![Vec::new()],
        );
        self.output = self.push(
            format!("{set}/output"),
            ActorKind::Output,
            Scope::Root,
            None,
            vec![vec![InputSlot::Arrow; graph.outputs.len()]],
        );
        Ok(())
    }

    /// Derive readiness thresholds from the linked arrows and check the result.
    pub fn finish(mut self) -> Result<ActorSet> {
        let mut control: Vec<Vec<usize>> = self
            .actors
            .iter()
            .map(|actor| vec![0; actor.inputs.len()])
            .collect();
        let mut branch = vec![0usize; self.actors.len()];
        for actor in &self.actors {
            let mut sends: Vec<(ActorId, Scope)> = actor
                .arrows
                .control
                .iter()
                .map(|arrow| (arrow.to, actor.scope))
                .collect();
            for arrow in &actor.arrows.branch {
                bump(&mut branch, arrow.to, &actor.name)?;
            }
            if let Some(switch) = actor.switch() {
                // One Branch message per firing, whichever group is taken.
                let mut gathers = BTreeSet::new();
                for (index, group) in switch.groups.iter().enumerate() {
                    let scope = Scope::Branch {
                        call: switch.call,
                        branch: index,
                    };
                    sends.extend(group.control.iter().map(|arrow| (arrow.to, scope)));
                    gathers.extend(group.gather);
                }
                for gather in gathers {
                    bump(&mut branch, gather, &actor.name)?;
                }
            }
            for (to, scope) in sends {
                let target = self.actors.get(to).ok_or_else(|| {
                    SchedulerError::validity(format!("control arrow from {} to missing actor #{}", actor.name, to))
                })?;
                let variant = validate::variant_for(target, scope, &actor.name)?;
                if let Some(count) = control.get_mut(to).and_then(|counts| counts.get_mut(variant)) {
                    *count += 1;
                }
            }
        }
        for (actor, (control, branch)) in self.actors.iter_mut().zip(control.into_iter().zip(branch)) {
            actor.expect = Expect {
                data: actor
                    .inputs
                    .iter()
                    .map(|slots| slots.iter().filter(|slot| **slot == InputSlot::Arrow).count())
                    .collect(),
                control,
                branch,
                by_branch: matches!(actor.kind, ActorKind::Gather(_)),
            };
        }
        let set = ActorSet::new(
            self.graph.name.clone(),
            self.actors,
            self.data_prepare,
            self.loop_count,
            self.output,
            self.persistents.into_values().collect(),
            self.graph.input_count(),
            self.graph.loop_count,
        );
        validate::check(&set)?;
        Ok(set)
    }
}

fn bump(counts: &mut [usize], to: ActorId, from: &str) -> Result<()> {
    let count = counts.get_mut(to).ok_or_else(|| {
        SchedulerError::validity(format!("branch arrow from {} to missing actor #{}", from, to))
    })?;
    *count += 1;
    Ok(())
}

pub(crate) fn copy_kind(from: DeviceId) -> ActorKind {
    ActorKind::Copy(CopyActor { from })
}
