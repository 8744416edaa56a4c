use std::fmt::Write;

use serde::Serialize;

use crate::device::DeviceId;

use super::actor::{
    Actor, ActorId, ActorKind, ActorType, BranchArrow, ControlArrow, DataArrow, Expect, InputSlot,
    ResultArrow, Scope,
};
use super::set::ActorSet;

/// Serializable view of a linked actor set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Topology {
    pub name: String,
    pub actors: Vec<ActorNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActorNode {
    pub id: ActorId,
    pub name: String,
    pub kind: ActorType,
    pub scope: Scope,
    pub device: Option<DeviceId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub op: Option<String>,
    pub inputs: Vec<Vec<InputSlot>>,
    pub expect: Expect,
    pub data: Vec<DataArrow>,
    pub control: Vec<ControlArrow>,
    pub branch: Vec<BranchArrow>,
    pub result: Vec<ResultArrow>,
    pub trigger: Vec<ActorId>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<GroupNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupNode {
    pub data: Vec<DataArrow>,
    pub control: Vec<ControlArrow>,
    pub gather: Option<ActorId>,
}

impl ActorNode {
    fn of(actor: &Actor) -> Self {
        let op = match &actor.kind {
            ActorKind::Kernel(kernel) => Some(kernel.op.id.clone()),
            ActorKind::Copy(copy) => Some(format!("copy {}", copy.from)),
            _ => None,
        };
        let groups = actor
            .switch()
            .map(|switch| {
                switch
                    .groups
                    .iter()
                    .map(|group| GroupNode {
                        data: group.data.clone(),
                        control: group.control.clone(),
                        gather: group.gather,
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self {
            id: actor.id,
            name: actor.name.clone(),
            kind: actor.actor_type(),
            scope: actor.scope,
            device: actor.device_id(),
            op,
            inputs: actor.inputs.clone(),
            expect: actor.expect.clone(),
            data: actor.arrows.data.clone(),
            control: actor.arrows.control.clone(),
            branch: actor.arrows.branch.clone(),
            result: actor.arrows.result.clone(),
            trigger: actor.arrows.trigger.clone(),
            groups,
        }
    }
}

impl ActorSet {
    pub fn topology(&self) -> Topology {
        Topology {
            name: self.name.clone(),
            actors: self.actors.iter().map(ActorNode::of).collect(),
        }
    }

    /// Human readable listing of every actor and its arrows.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let name = |id: ActorId| self.actors.get(id).map_or("?", |actor| actor.name.as_str());
        let _ = writeln!(out, "actor set {} ({} actors)", self.name, self.actors.len());
        for actor in &self.actors {
            let _ = write!(out, "#{} {} [{}] {}", actor.id, actor.name, actor.actor_type(), actor.scope);
            if let Some(device) = actor.device_id() {
                let _ = write!(out, " on {}", device);
            }
            let _ = writeln!(out);
            let expect = &actor.expect;
            if !expect.is_empty() {
                let _ = writeln!(
                    out,
                    "    expect data {:?} control {:?} branch {}",
                    expect.data, expect.control, expect.branch
                );
            }
            for (variant, slots) in actor.inputs.iter().enumerate() {
                for (slot, input) in slots.iter().enumerate() {
                    if let InputSlot::Store(key) = input {
                        let _ = writeln!(out, "    store {} -> [{}]{}", key, variant, slot);
                    }
                }
            }
            for arrow in &actor.arrows.result {
                let _ = writeln!(out, "    result {} -> {}:{}", arrow.from_output, name(arrow.to), arrow.to_input);
            }
            for arrow in &actor.arrows.data {
                let _ = writeln!(out, "    data {} -> {}:{}", arrow.from_output, name(arrow.to), arrow.to_input);
            }
            for arrow in &actor.arrows.control {
                let _ = writeln!(out, "    control -> {}", name(arrow.to));
            }
            for arrow in &actor.arrows.branch {
                let _ = writeln!(out, "    branch -> {}", name(arrow.to));
            }
            for to in &actor.arrows.trigger {
                let _ = writeln!(out, "    trigger -> {}", name(*to));
            }
            if let Some(switch) = actor.switch() {
                for (index, group) in switch.groups.iter().enumerate() {
                    let _ = writeln!(out, "    branch {}:", index);
                    for arrow in &group.data {
                        let _ = writeln!(out, "      data {} -> {}:{}", arrow.from_output, name(arrow.to), arrow.to_input);
                    }
                    for arrow in &group.control {
                        let _ = writeln!(out, "      control -> {}", name(arrow.to));
                    }
                    if let Some(gather) = group.gather {
                        let _ = writeln!(out, "      branch id -> {}", name(gather));
                    }
                }
            }
        }
        out
    }
}
