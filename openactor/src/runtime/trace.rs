use std::time::Duration;

use serde::ser::{SerializeStruct, Serializer};
use uuid::Uuid;

use super::actor::ActorType;

/// Execution trace record for a single actor firing.
#[derive(Debug, Clone)]
pub struct TraceEvent {
    pub run_id: Uuid,
    pub kind: ActorType,
    pub actor: String,
    pub iteration: usize,
    pub thread: String,
    pub micros: String,
    pub micros_parts: [u64; 3],
}

impl TraceEvent {
    pub(crate) fn new(run_id: Uuid, kind: ActorType, actor: &str, iteration: usize, elapsed: Duration) -> Self {
        let timing = format_trace_timing(elapsed);
        let current = std::thread::current();
        let thread = match current.name() {
            Some(name) => name.to_string(),
            None => format!("{:?}", current.id()),
        };
        Self {
            run_id,
            kind,
            actor: actor.to_string(),
            iteration,
            thread,
            micros: timing.0,
            micros_parts: timing.1,
        }
    }
}

impl serde::Serialize for TraceEvent {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("TraceEvent", 6)?;
        state.serialize_field("run_id", &self.run_id)?;
        state.serialize_field("actor", &self.actor)?;
        state.serialize_field("kind", &self.kind)?;
        state.serialize_field("iteration", &self.iteration)?;
        state.serialize_field("thread", &self.thread)?;
        state.serialize_field("micros", &self.micros_parts)?;
        state.end()
    }
}

fn format_trace_timing(duration: Duration) -> (String, [u64; 3]) {
    let total_ns = duration.as_nanos();
    let ms = (total_ns / 1_000_000) as u64;
    let us = ((total_ns / 1_000) % 1_000) as u64;
    let ns = (total_ns % 1_000) as u64;
    (format!("{ms}ms {us}us {ns}ns"), [ms, us, ns])
}
