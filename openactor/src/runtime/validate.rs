use std::collections::{HashMap, VecDeque};

use anyhow::Result;

use crate::error::SchedulerError;

use super::actor::{Actor, ActorId, ActorKind, InputSlot, Scope};
use super::set::ActorSet;

/// Branch variant of `target` that an arrow sent from `scope` feeds.
pub(crate) fn variant_for(target: &Actor, scope: Scope, from: &str) -> Result<usize> {
    let Some(call) = target.gather_call() else {
        return Ok(0);
    };
    match scope {
        Scope::Branch { call: owner, branch } if owner == call => Ok(branch),
        _ => Err(SchedulerError::validity(format!(
            "{} feeds {} from outside the called branches",
            from, target.name
        ))),
    }
}

struct DataEdge {
    from: ActorId,
    scope: Scope,
    to: ActorId,
    slot: usize,
}

fn data_edges(set: &ActorSet) -> Vec<DataEdge> {
    let mut edges = Vec::new();
    for actor in &set.actors {
        for arrow in &actor.arrows.data {
            edges.push(DataEdge {
                from: actor.id,
                scope: actor.scope,
                to: arrow.to,
                slot: arrow.to_input,
            });
        }
        for arrow in &actor.arrows.result {
            edges.push(DataEdge {
                from: actor.id,
                scope: actor.scope,
                to: arrow.to,
                slot: arrow.to_input,
            });
        }
        if let ActorKind::Switch(switch) = &actor.kind {
            for (branch, group) in switch.groups.iter().enumerate() {
                let scope = Scope::Branch {
                    call: switch.call,
                    branch,
                };
                for arrow in &group.data {
                    edges.push(DataEdge {
                        from: actor.id,
                        scope,
                        to: arrow.to,
                        slot: arrow.to_input,
                    });
                }
            }
        }
    }
    edges
}

fn successors(actor: &Actor) -> Vec<ActorId> {
    let arrows = &actor.arrows;
    let mut next: Vec<ActorId> = arrows
        .data
        .iter()
        .map(|arrow| arrow.to)
        .chain(arrows.control.iter().map(|arrow| arrow.to))
        .chain(arrows.branch.iter().map(|arrow| arrow.to))
        .chain(arrows.result.iter().map(|arrow| arrow.to))
        .chain(arrows.trigger.iter().copied())
        .collect();
    if let Some(switch) = actor.switch() {
        for group in &switch.groups {
            next.extend(group.data.iter().map(|arrow| arrow.to));
            next.extend(group.control.iter().map(|arrow| arrow.to));
            next.extend(group.gather);
        }
    }
    next
}

/// Structural check of a linked actor set: arrow endpoints, one producer per
/// data slot, device residency, trigger targets and reachability.
pub(crate) fn check(set: &ActorSet) -> Result<()> {
    for (index, actor) in set.actors.iter().enumerate() {
        if actor.id != index {
            return Err(SchedulerError::validity(format!(
                "{} is stored at position {} but has id {}",
                actor.name, index, actor.id
            )));
        }
        for to in successors(actor) {
            if to >= set.actors.len() {
                return Err(SchedulerError::validity(format!(
                    "arrow from {} to missing actor #{}",
                    actor.name, to
                )));
            }
        }
        for to in &actor.arrows.trigger {
            if !set.actors[*to].expect.is_empty() {
                return Err(SchedulerError::validity(format!(
                    "{} triggers {} which expects inputs",
                    actor.name, set.actors[*to].name
                )));
            }
        }
    }

    let mut coverage: HashMap<(ActorId, usize, usize), usize> = HashMap::new();
    for edge in data_edges(set) {
        let source = &set.actors[edge.from];
        let target = &set.actors[edge.to];
        let variant = variant_for(target, edge.scope, &source.name)?;
        match target.inputs.get(variant).and_then(|slots| slots.get(edge.slot)) {
            Some(InputSlot::Arrow) => {}
            _ => {
                return Err(SchedulerError::validity(format!(
                    "{} writes slot {} of {} which takes no arrow",
                    source.name, edge.slot, target.name
                )));
            }
        }
        let crosses = !matches!(target.kind, ActorKind::Copy(_) | ActorKind::Output);
        if let (true, Some(from), Some(to)) = (crosses, source.device_id(), target.device_id()) {
            if from != to {
                return Err(SchedulerError::validity(format!(
                    "tensor from {} to {} crosses {} -> {} without a copy",
                    source.name, target.name, from, to
                )));
            }
        }
        *coverage.entry((edge.to, variant, edge.slot)).or_default() += 1;
    }
    for actor in &set.actors {
        for (variant, slots) in actor.inputs.iter().enumerate() {
            for (slot, input) in slots.iter().enumerate() {
                if *input != InputSlot::Arrow {
                    continue;
                }
                let producers = coverage.get(&(actor.id, variant, slot)).copied().unwrap_or(0);
                if producers != 1 {
                    return Err(SchedulerError::validity(format!(
                        "slot {} of {} has {} producers",
                        slot, actor.name, producers
                    )));
                }
            }
        }
    }

    let mut reached = vec![false; set.actors.len()];
    let mut queue = VecDeque::from([set.data_prepare]);
    while let Some(id) = queue.pop_front() {
        if std::mem::replace(&mut reached[id], true) {
            continue;
        }
        queue.extend(successors(&set.actors[id]).into_iter().filter(|next| !reached[*next]));
    }
    let unreached: Vec<&str> = set
        .actors
        .iter()
        .filter(|actor| !reached[actor.id])
        .map(|actor| actor.name.as_str())
        .collect();
    if !unreached.is_empty() {
        return Err(SchedulerError::validity(format!(
            "actors unreachable from {}: {}",
            set.actors[set.data_prepare].name,
            unreached.join(", ")
        )));
    }
    if set.actors[set.loop_count].expect.is_empty() {
        return Err(SchedulerError::validity(format!(
            "{} waits for nothing",
            set.actors[set.loop_count].name
        )));
    }
    Ok(())
}
