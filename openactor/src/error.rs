//! Error kinds surfaced by the scheduler.
//!
//! Every public operation returns `anyhow::Result`; the underlying cause is a
//! [`SchedulerError`] which callers can recover with `downcast_ref`.
use thiserror::Error;

/// Classified scheduler failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// The compiled graph is malformed (cycles, count mismatches, scope misuse).
    #[error("build error: {0}")]
    Build(String),
    /// An input could not be resolved to a producer while wiring arrows.
    #[error("link error: {0}")]
    Link(String),
    /// The linked actor set failed its structural check.
    #[error("invalid actor set: {0}")]
    Validity(String),
    /// Control-flow linearization failed.
    #[error("linearize error: {0}")]
    Linearize(String),
    /// An actor failed while firing.
    #[error("actor {actor} failed: {message}")]
    Runtime { actor: String, message: String },
    /// No actor is runnable while the run has neither completed nor failed.
    #[error("run stalled; pending actors: {}", .pending.join(", "))]
    Stall { pending: Vec<String> },
    /// The run did not complete within the configured timeout.
    #[error("run timed out after {millis}ms")]
    Timeout { millis: u128 },
    /// Actor set registry misuse (duplicate names, unknown sets, concurrent runs).
    #[error("registry error: {0}")]
    Registry(String),
}

impl SchedulerError {
    /// Recover the classified error from an `anyhow` chain.
    pub fn of(err: &anyhow::Error) -> Option<&SchedulerError> {
        err.chain().find_map(|cause| cause.downcast_ref::<SchedulerError>())
    }

    pub(crate) fn build(message: impl Into<String>) -> anyhow::Error {
        SchedulerError::Build(message.into()).into()
    }

    pub(crate) fn link(message: impl Into<String>) -> anyhow::Error {
        SchedulerError::Link(message.into()).into()
    }

    pub(crate) fn validity(message: impl Into<String>) -> anyhow::Error {
        SchedulerError::Validity(message.into()).into()
    }

    pub(crate) fn linearize(message: impl Into<String>) -> anyhow::Error {
        SchedulerError::Linearize(message.into()).into()
    }

    pub(crate) fn registry(message: impl Into<String>) -> anyhow::Error {
        SchedulerError::Registry(message.into()).into()
    }

    /// Convert an arbitrary actor failure into a runtime error naming the actor.
    pub(crate) fn runtime(actor: &str, err: &anyhow::Error) -> SchedulerError {
        match SchedulerError::of(err) {
            Some(inner @ SchedulerError::Runtime { .. }) => inner.clone(),
            _ => SchedulerError::Runtime {
                actor: actor.to_string(),
                message: format!("{:#}", err),
            },
        }
    }
}
