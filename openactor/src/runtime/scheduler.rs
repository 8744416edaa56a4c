use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use once_cell::sync::OnceCell;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};

use crate::config::SchedulerConfig;
use crate::control_flow::LinearProgram;
use crate::device::DeviceId;
use crate::error::SchedulerError;
use crate::graph::CompiledGraph;
use crate::tensor::TensorValue;

use super::context::{Dispatcher, RunContext, RunParams};
use super::global::{DeviceMemory, GlobalActors, RunSummary};
use super::report::RunReport;
use super::set::ActorSet;
use super::store::DeviceTensorStore;
use super::{transform, validate};

/// How fired actors are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// Actors run concurrently on the worker pool.
    #[default]
    Pipeline,
    /// Actors run one at a time on the calling thread, in FIFO order.
    Step,
}

/// Per-run inputs of an actor set.
#[derive(Debug, Clone, Default)]
pub struct RunInputs {
    /// Host inputs by position.
    pub tensors: Vec<TensorValue>,
    /// Replacement values for persistent tensors, by node name.
    pub value_nodes: BTreeMap<String, TensorValue>,
    /// Iteration count; the graph's loop count when unset.
    pub iterations: Option<usize>,
}

impl RunInputs {
    pub fn new(tensors: Vec<TensorValue>) -> Self {
        Self {
            tensors,
            ..Self::default()
        }
    }

    pub fn with_value_node(mut self, name: impl Into<String>, value: TensorValue) -> Self {
        self.value_nodes.insert(name.into(), value);
        self
    }

    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = Some(iterations);
        self
    }
}

#[derive(Debug, Default)]
struct Registry {
    sets: BTreeMap<String, Arc<ActorSet>>,
    /// Actor name → owning set.
    actors: HashMap<String, String>,
    scheduled: BTreeSet<String>,
}

/// Owns actor sets, the device tensor store and the worker pool.
///
/// Several schedulers may coexist; nothing is process-global.
pub struct Scheduler {
    config: SchedulerConfig,
    pool: OnceCell<Arc<ThreadPool>>,
    globals: OnceCell<GlobalActors>,
    store: Arc<DeviceTensorStore>,
    registry: RwLock<Registry>,
    runs: AtomicU64,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            pool: OnceCell::new(),
            globals: OnceCell::new(),
            store: Arc::new(DeviceTensorStore::new()),
            registry: RwLock::new(Registry::default()),
            runs: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Build the worker pool and the global actors. Idempotent.
    pub fn initialize(&self) -> Result<()> {
        self.pool()?;
        self.globals();
        Ok(())
    }

    fn pool(&self) -> Result<&Arc<ThreadPool>> {
        self.pool.get_or_try_init(|| {
            let mut builder = ThreadPoolBuilder::new().thread_name(|index| format!("openactor-{index}"));
            if self.config.threads > 0 {
                builder = builder.num_threads(self.config.threads);
            }
            let pool = builder
                .build()
                .map_err(|err| anyhow!("failed to build actor threadpool: {}", err))?;
            crate::trace!("actor threadpool ready with {} threads", pool.current_num_threads());
            Ok(Arc::new(pool))
        })
    }

    fn globals(&self) -> &GlobalActors {
        self.globals.get_or_init(|| GlobalActors::new(&self.config))
    }

    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Build, link and check the actor set of `graph`, then register it.
    pub fn transform(&self, graph: &CompiledGraph) -> Result<Arc<ActorSet>> {
        self.initialize()?;
        if self.read().sets.contains_key(&graph.name) {
            return Err(SchedulerError::registry(format!(
                "actor set {} already exists",
                graph.name
            )));
        }
        let set = self.register(transform(graph)?)?;
        if let Some(path) = self.globals().dumper.dump_actor_set(&set)? {
            crate::trace!("dumped actor set {} to {}", set.name(), path.display());
        }
        Ok(set)
    }

    pub(crate) fn register(&self, set: ActorSet) -> Result<Arc<ActorSet>> {
        let mut registry = self.write();
        if registry.sets.contains_key(set.name()) {
            return Err(SchedulerError::registry(format!(
                "actor set {} already exists",
                set.name()
            )));
        }
        if let Some(actor) = set.actors().iter().find(|actor| registry.actors.contains_key(actor.name())) {
            return Err(SchedulerError::registry(format!(
                "actor {} is already registered by {}",
                actor.name(),
                registry.actors[actor.name()]
            )));
        }
        for actor in set.actors() {
            registry
                .actors
                .insert(actor.name().to_string(), set.name().to_string());
        }
        let set = Arc::new(set);
        registry.sets.insert(set.name().to_string(), Arc::clone(&set));
        crate::trace!("registered actor set {} ({} actors)", set.name(), set.len());
        Ok(set)
    }

    fn check_registered(&self, set: &ActorSet) -> Result<()> {
        let registry = self.read();
        match registry.sets.get(set.name()) {
            Some(known) if std::ptr::eq(Arc::as_ptr(known), set) => Ok(()),
            _ => Err(SchedulerError::registry(format!(
                "actor set {} is not registered with this scheduler",
                set.name()
            ))),
        }
    }

    /// Mark a registered set as dispatchable.
    pub fn schedule(&self, set: &ActorSet) -> Result<()> {
        self.check_registered(set)?;
        self.write().scheduled.insert(set.name().to_string());
        crate::trace!("scheduled actor set {}", set.name());
        Ok(())
    }

    pub fn is_scheduled(&self, name: &str) -> bool {
        self.read().scheduled.contains(name)
    }

    pub fn fetch(&self, name: &str) -> Option<Arc<ActorSet>> {
        self.read().sets.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.read().sets.keys().cloned().collect()
    }

    /// Forget one actor set. Store entries are kept for other sets.
    pub fn clear(&self, name: &str) -> Result<()> {
        let mut registry = self.write();
        if registry.sets.remove(name).is_none() {
            return Err(SchedulerError::registry(format!("unknown actor set {}", name)));
        }
        registry.actors.retain(|_, owner| owner != name);
        registry.scheduled.remove(name);
        Ok(())
    }

    /// Forget every actor set and empty the device tensor store.
    pub fn clear_all(&self) {
        let mut registry = self.write();
        for set in registry.sets.values() {
            set.host_queue.clear();
        }
        *registry = Registry::default();
        self.store.clear();
        if let Some(globals) = self.globals.get() {
            globals.memory.reset();
        }
    }

    pub fn store(&self) -> &Arc<DeviceTensorStore> {
        &self.store
    }

    pub fn memory(&self) -> BTreeMap<DeviceId, DeviceMemory> {
        self.globals().memory.snapshot()
    }

    pub fn history(&self) -> Vec<RunSummary> {
        self.globals().recorder.history()
    }

    /// Write the listing of a linear program into the dump directory, if any.
    pub fn dump_program(&self, program: &LinearProgram) -> Result<Option<PathBuf>> {
        self.globals().dumper.dump_program(program)
    }

    /// Run a scheduled actor set for the requested number of iterations.
    pub fn run(&self, set: &Arc<ActorSet>, inputs: &RunInputs, strategy: ExecutionStrategy) -> Result<RunReport> {
        self.initialize()?;
        self.check_registered(set)?;
        if !self.is_scheduled(set.name()) {
            return Err(SchedulerError::registry(format!(
                "actor set {} has not been scheduled",
                set.name()
            )));
        }
        let running = set.begin_run()?;
        let prepare = set
            .actors()
            .get(set.data_prepare)
            .map(|actor| actor.name().to_string())
            .unwrap_or_default();
        if inputs.tensors.len() != set.input_count() {
            return Err(SchedulerError::Runtime {
                actor: prepare,
                message: format!(
                    "expected {} inputs, got {}",
                    set.input_count(),
                    inputs.tensors.len()
                ),
            }
            .into());
        }
        if let Some(name) = inputs
            .value_nodes
            .keys()
            .find(|name| !set.persistents.iter().any(|entry| &entry.key.name == *name))
        {
            return Err(SchedulerError::Runtime {
                actor: prepare,
                message: format!("unknown value node {}", name),
            }
            .into());
        }

        let iterations = inputs.iterations.unwrap_or(set.default_iterations());
        if iterations == 0 {
            validate::check(set)?;
            return Ok(RunReport::validated(uuid::Uuid::new_v4(), set.name()));
        }
        self.overwrite_value_nodes(set, inputs)?;

        let globals = self.globals();
        let dispatcher = match strategy {
            ExecutionStrategy::Pipeline => Dispatcher::Pool(Arc::clone(self.pool()?)),
            ExecutionStrategy::Step => Dispatcher::inline(),
        };
        let ctx = Arc::new(RunContext::new(RunParams {
            seq: self.runs.fetch_add(1, Ordering::SeqCst) + 1,
            target: iterations,
            set: Arc::clone(set),
            store: Arc::clone(&self.store),
            memory: Arc::clone(&globals.memory),
            inputs: inputs.tensors.clone(),
            dispatcher,
            trace: self.config.trace_events,
            running,
        }));
        ctx.start();
        let outcome = ctx.wait(self.config.run_timeout());
        globals.recorder.record(RunSummary {
            run_id: ctx.run_id,
            actor_set: set.name().to_string(),
            strategy,
            iterations: ctx.iterations(),
            elapsed_micros: ctx.elapsed().as_micros(),
            error: outcome.as_ref().err().map(ToString::to_string),
        });
        match outcome {
            Ok(()) => Ok(ctx.report()),
            Err(err) => Err(err.into()),
        }
    }

    fn overwrite_value_nodes(&self, set: &ActorSet, inputs: &RunInputs) -> Result<()> {
        let memory = &self.globals().memory;
        for entry in &set.persistents {
            let Some(value) = inputs.value_nodes.get(&entry.key.name) else {
                continue;
            };
            let tensor = entry.device.upload(value)?;
            memory.record_upload(tensor.device(), value.nbytes());
            self.store.insert(entry.key.clone(), tensor)?;
        }
        Ok(())
    }
}
