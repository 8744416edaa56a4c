use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;

use crate::error::SchedulerError;

use super::actor::{Actor, ActorId, ActorType};
use super::store::{HostQueue, PersistentTensor};

/// Linked actors of one compiled graph. Arrows never change after linking;
/// only inbox state varies between runs.
#[derive(Debug)]
pub struct ActorSet {
    pub(crate) name: String,
    pub(crate) actors: Vec<Actor>,
    pub(crate) data_prepare: ActorId,
    pub(crate) loop_count: ActorId,
    pub(crate) output: ActorId,
    pub(crate) persistents: Vec<PersistentTensor>,
    pub(crate) input_count: usize,
    pub(crate) default_iterations: usize,
    pub(crate) host_queue: HostQueue,
    running: AtomicBool,
}

impl ActorSet {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: String,
        actors: Vec<Actor>,
        data_prepare: ActorId,
        loop_count: ActorId,
        output: ActorId,
        persistents: Vec<PersistentTensor>,
        input_count: usize,
        default_iterations: usize,
    ) -> Self {
        Self {
            name,
            actors,
            data_prepare,
            loop_count,
            output,
            persistents,
            input_count,
            default_iterations,
            host_queue: HostQueue::default(),
            running: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.actors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }

    pub fn actors(&self) -> &[Actor] {
        &self.actors
    }

    pub fn actor(&self, name: &str) -> Option<&Actor> {
        self.actors.iter().find(|actor| actor.name == name)
    }

    pub fn input_count(&self) -> usize {
        self.input_count
    }

    pub fn output_count(&self) -> usize {
        self.actors
            .get(self.output)
            .map_or(0, Actor::slot_count)
    }

    pub fn default_iterations(&self) -> usize {
        self.default_iterations
    }

    /// Names of the actors of one type, in creation order.
    pub fn names_of(&self, kind: ActorType) -> Vec<&str> {
        self.actors
            .iter()
            .filter(|actor| actor.actor_type() == kind)
            .map(Actor::name)
            .collect()
    }

    pub fn count_of(&self, kind: ActorType) -> usize {
        self.actors
            .iter()
            .filter(|actor| actor.actor_type() == kind)
            .count()
    }

    /// Actors of the given run that received some but not all inputs.
    pub(crate) fn pending(&self, run: u64) -> Vec<String> {
        let pending: Vec<String> = self
            .actors
            .iter()
            .filter_map(|actor| actor.progress(run))
            .collect();
        if !pending.is_empty() {
            return pending;
        }
        self.actors
            .get(self.loop_count)
            .map(|actor| actor.name.clone())
            .into_iter()
            .collect()
    }

    pub(crate) fn begin_run(self: &Arc<Self>) -> Result<RunGuard> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::registry(format!(
                "actor set {} is already running",
                self.name
            )));
        }
        Ok(RunGuard {
            set: Arc::clone(self),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Clears the running flag when dropped. The run context drops it once no
/// dispatched actor is left, so a timed-out run keeps the set busy until its
/// in-flight actors are done.
pub(crate) struct RunGuard {
    set: Arc<ActorSet>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.set.running.store(false, Ordering::SeqCst);
    }
}
