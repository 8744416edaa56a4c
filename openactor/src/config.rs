//! Scheduler configuration.
//!
//! Values come from code (builder methods), JSON, or `OPENACTOR_*`
//! environment variables.
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

pub const THREADS_ENV: &str = "OPENACTOR_THREADS";
pub const RUN_TIMEOUT_ENV: &str = "OPENACTOR_RUN_TIMEOUT_MS";
pub const DUMP_DIR_ENV: &str = "OPENACTOR_DUMP_DIR";
pub const TRACE_EVENTS_ENV: &str = "OPENACTOR_TRACE_EVENTS";

/// Tunables shared by every actor set a scheduler owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Worker threads for the pipeline strategy; `0` lets rayon decide.
    pub threads: usize,
    /// Upper bound on a single run; `0` disables the bound.
    pub run_timeout_ms: u64,
    /// Directory receiving actor set and linear program dumps.
    pub dump_dir: Option<PathBuf>,
    /// Collect per-fire trace events into the run report.
    pub trace_events: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            run_timeout_ms: 60_000,
            dump_dir: None,
            trace_events: false,
        }
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by whichever `OPENACTOR_*` variables are set.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(value) = env_value(THREADS_ENV) {
            config.threads = value
                .parse()
                .with_context(|| format!("{THREADS_ENV} must be an integer, got {value:?}"))?;
        }
        if let Some(value) = env_value(RUN_TIMEOUT_ENV) {
            config.run_timeout_ms = value
                .parse()
                .with_context(|| format!("{RUN_TIMEOUT_ENV} must be an integer, got {value:?}"))?;
        }
        if let Some(value) = env_value(DUMP_DIR_ENV) {
            config.dump_dir = Some(PathBuf::from(value));
        }
        if let Some(value) = env_value(TRACE_EVENTS_ENV) {
            config.trace_events = parse_flag(&value)
                .ok_or_else(|| anyhow!("{TRACE_EVENTS_ENV} must be 0/1/true/false, got {value:?}"))?;
        }
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("invalid scheduler config")
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn without_run_timeout(mut self) -> Self {
        self.run_timeout_ms = 0;
        self
    }

    pub fn with_dump_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.dump_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn with_trace_events(mut self) -> Self {
        self.trace_events = true;
        self
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        match self.run_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

fn env_value(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" => Some(true),
        "0" | "false" | "off" => Some(false),
        _ => None,
    }
}
