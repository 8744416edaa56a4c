//! Scheduler-wide services created once by `Scheduler::initialize`.
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use serde::Serialize;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::control_flow::LinearProgram;
use crate::device::DeviceId;

use super::scheduler::ExecutionStrategy;
use super::set::ActorSet;

/// Transfer counters of one device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeviceMemory {
    pub uploads: usize,
    pub upload_bytes: usize,
    pub copies: usize,
    pub copy_bytes: usize,
}

/// Accounts for every tensor moved onto a device.
#[derive(Debug, Default)]
pub struct MemoryManager {
    devices: Mutex<BTreeMap<DeviceId, DeviceMemory>>,
}

impl MemoryManager {
    pub(crate) fn record_upload(&self, device: DeviceId, bytes: usize) {
        if let Ok(mut devices) = self.devices.lock() {
            let entry = devices.entry(device).or_default();
            entry.uploads += 1;
            entry.upload_bytes += bytes;
        }
    }

    pub(crate) fn record_copy(&self, device: DeviceId, bytes: usize) {
        if let Ok(mut devices) = self.devices.lock() {
            let entry = devices.entry(device).or_default();
            entry.copies += 1;
            entry.copy_bytes += bytes;
        }
    }

    pub fn snapshot(&self) -> BTreeMap<DeviceId, DeviceMemory> {
        self.devices
            .lock()
            .map(|devices| devices.clone())
            .unwrap_or_default()
    }

    pub(crate) fn reset(&self) {
        if let Ok(mut devices) = self.devices.lock() {
            devices.clear();
        }
    }
}

/// Outcome of one `Scheduler::run` call.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub actor_set: String,
    pub strategy: ExecutionStrategy,
    pub iterations: usize,
    pub elapsed_micros: u128,
    pub error: Option<String>,
}

const HISTORY: usize = 64;

/// Keeps the most recent run summaries.
#[derive(Debug, Default)]
pub struct Recorder {
    runs: Mutex<VecDeque<RunSummary>>,
}

impl Recorder {
    pub(crate) fn record(&self, summary: RunSummary) {
        crate::trace!(
            "run {} of {}: {} iterations in {}us{}",
            summary.run_id,
            summary.actor_set,
            summary.iterations,
            summary.elapsed_micros,
            summary
                .error
                .as_ref()
                .map(|err| format!(" ({})", err))
                .unwrap_or_default()
        );
        if let Ok(mut runs) = self.runs.lock() {
            if runs.len() == HISTORY {
                runs.pop_front();
            }
            runs.push_back(summary);
        }
    }

    pub fn history(&self) -> Vec<RunSummary> {
        self.runs
            .lock()
            .map(|runs| runs.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Writes actor sets and linear programs into the configured dump directory.
#[derive(Debug)]
pub struct DebugDumper {
    dir: Option<PathBuf>,
}

impl DebugDumper {
    pub(crate) fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub(crate) fn dump_actor_set(&self, set: &ActorSet) -> Result<Option<PathBuf>> {
        let Some(dir) = &self.dir else {
            return Ok(None);
        };
        let stem = file_stem(set.name());
        let topology = serde_json::to_string_pretty(&set.topology())?;
        write_file(dir, &format!("{stem}.actors.json"), &topology)?;
        let path = write_file(dir, &format!("{stem}.actors.txt"), &set.dump())?;
        Ok(Some(path))
    }

    pub(crate) fn dump_program(&self, program: &LinearProgram) -> Result<Option<PathBuf>> {
        let Some(dir) = &self.dir else {
            return Ok(None);
        };
        let path = write_file(
            dir,
            &format!("{}.linear.txt", file_stem(program.name())),
            &program.dump(),
        )?;
        Ok(Some(path))
    }
}

fn file_stem(name: &str) -> String {
    name.chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' { ch } else { '_' })
        .collect()
}

fn write_file(dir: &Path, file: &str, contents: &str) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .map_err(|err| anyhow!("failed to create dump directory {}: {}", dir.display(), err))?;
    let path = dir.join(file);
    fs::write(&path, contents).map_err(|err| anyhow!("failed to write {}: {}", path.display(), err))?;
    Ok(path)
}

#[derive(Debug)]
pub(crate) struct GlobalActors {
    pub memory: Arc<MemoryManager>,
    pub recorder: Recorder,
    pub dumper: DebugDumper,
}

impl GlobalActors {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            memory: Arc::new(MemoryManager::default()),
            recorder: Recorder::default(),
            dumper: DebugDumper::new(config.dump_dir.clone()),
        }
    }
}
