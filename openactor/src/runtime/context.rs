use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use rayon::ThreadPool;
use uuid::Uuid;

use crate::error::SchedulerError;
use crate::tensor::TensorValue;

use super::actor::{Actor, ActorId, Fired, Message, Stamp};
use super::global::MemoryManager;
use super::report::{BranchRecord, OutputSnapshot, RunReport};
use super::set::{ActorSet, RunGuard};
use super::store::DeviceTensorStore;
use super::trace::TraceEvent;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

type Task = (ActorId, Fired);

pub(crate) enum Dispatcher {
    /// Fired actors run on the worker pool.
    Pool(Arc<ThreadPool>),
    /// Fired actors queue up and run on the thread waiting for the run.
    Inline(Mutex<VecDeque<Task>>),
}

impl Dispatcher {
    pub fn inline() -> Self {
        Dispatcher::Inline(Mutex::new(VecDeque::new()))
    }
}

#[derive(Debug, Default)]
struct RunState {
    in_flight: usize,
    completed: bool,
}

/// State of one `Scheduler::run` call shared by every actor it fires.
pub(crate) struct RunContext {
    pub run_id: Uuid,
    pub seq: u64,
    pub target: usize,
    pub set: Arc<ActorSet>,
    pub store: Arc<DeviceTensorStore>,
    pub memory: Arc<MemoryManager>,
    pub inputs: Arc<Vec<TensorValue>>,
    dispatcher: Dispatcher,
    error: Mutex<Option<SchedulerError>>,
    state: Mutex<RunState>,
    idle: Condvar,
    snapshots: Mutex<Vec<OutputSnapshot>>,
    branches: Mutex<Vec<BranchRecord>>,
    trace: Option<Mutex<Vec<TraceEvent>>>,
    prepared: AtomicUsize,
    started: Instant,
    /// Held until no dispatched actor is left, even after `wait` gave up.
    running: Mutex<Option<RunGuard>>,
}

pub(crate) struct RunParams {
    pub seq: u64,
    pub target: usize,
    pub set: Arc<ActorSet>,
    pub store: Arc<DeviceTensorStore>,
    pub memory: Arc<MemoryManager>,
    pub inputs: Vec<TensorValue>,
    pub dispatcher: Dispatcher,
    pub trace: bool,
    pub running: RunGuard,
}

impl RunContext {
    pub fn new(params: RunParams) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            seq: params.seq,
            target: params.target,
            set: params.set,
            store: params.store,
            memory: params.memory,
            inputs: Arc::new(params.inputs),
            dispatcher: params.dispatcher,
            error: Mutex::new(None),
            state: Mutex::new(RunState::default()),
            idle: Condvar::new(),
            snapshots: Mutex::new(Vec::new()),
            branches: Mutex::new(Vec::new()),
            trace: params.trace.then(|| Mutex::new(Vec::new())),
            prepared: AtomicUsize::new(0),
            started: Instant::now(),
            running: Mutex::new(Some(params.running)),
        }
    }

    pub fn start(self: &Arc<Self>) {
        crate::trace!("run {} of {} starts ({} iterations)", self.run_id, self.set.name(), self.target);
        self.send(
            self.set.data_prepare,
            Stamp {
                run: self.seq,
                iteration: 0,
            },
            Message::Trigger,
        );
    }

    /// Deliver one message and dispatch the target if it became runnable.
    pub fn send(self: &Arc<Self>, to: ActorId, stamp: Stamp, message: Message) {
        let Some(actor) = self.set.actors.get(to) else {
            self.fail(SchedulerError::Runtime {
                actor: format!("#{}", to),
                message: "arrow points at a missing actor".to_string(),
            });
            return;
        };
        match actor.deliver(stamp, message) {
            Ok(Some(fired)) => self.dispatch(to, fired),
            Ok(None) => {}
            Err(err) => self.fail(SchedulerError::runtime(&actor.name, &err)),
        }
    }

    fn dispatch(self: &Arc<Self>, actor: ActorId, fired: Fired) {
        lock(&self.state).in_flight += 1;
        match &self.dispatcher {
            Dispatcher::Pool(pool) => {
                let ctx = Arc::clone(self);
                pool.spawn(move || ctx.execute(actor, fired));
            }
            Dispatcher::Inline(queue) => lock(queue).push_back((actor, fired)),
        }
    }

    fn execute(self: &Arc<Self>, id: ActorId, fired: Fired) {
        if let Some(actor) = self.set.actors.get(id) {
            if !self.failed() {
                self.fire(actor, fired);
            }
        }
        self.finish();
    }

    fn fire(self: &Arc<Self>, actor: &Actor, fired: Fired) {
        let iteration = fired.stamp.iteration;
        let start = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| actor.fire(self, fired)))
            .unwrap_or_else(|payload| Err(anyhow!("panicked: {}", panic_message(payload.as_ref()))));
        if let Some(trace) = &self.trace {
            lock(trace).push(TraceEvent::new(
                self.run_id,
                actor.actor_type(),
                &actor.name,
                iteration,
                start.elapsed(),
            ));
        }
        if let Err(err) = outcome {
            let err = SchedulerError::runtime(&actor.name, &err);
            crate::error!("{}", err);
            self.fail(err);
        }
    }

    fn finish(&self) {
        let mut state = lock(&self.state);
        state.in_flight -= 1;
        if state.in_flight == 0 {
            lock(&self.running).take();
            self.idle.notify_all();
        }
    }

    /// Record an error; only the first one is kept.
    pub fn fail(&self, err: SchedulerError) {
        let mut slot = lock(&self.error);
        if slot.is_none() {
            crate::warning!("run {} failed: {}", self.run_id, err);
            *slot = Some(err);
        }
    }

    pub fn failed(&self) -> bool {
        lock(&self.error).is_some()
    }

    fn first_error(&self) -> Option<SchedulerError> {
        lock(&self.error).clone()
    }

    pub fn complete(&self) {
        lock(&self.state).completed = true;
    }

    pub fn note_prepare(&self) {
        self.prepared.fetch_add(1, Ordering::SeqCst);
    }

    pub fn publish(&self, snapshot: OutputSnapshot) {
        lock(&self.snapshots).push(snapshot);
    }

    pub fn record_branch(&self, iteration: usize, call: &str, branch: usize) {
        lock(&self.branches).push(BranchRecord {
            iteration,
            call: call.to_string(),
            branch,
        });
    }

    /// Block until no actor is in flight, then classify the outcome.
    pub fn wait(self: &Arc<Self>, timeout: Option<Duration>) -> Result<(), SchedulerError> {
        if let Dispatcher::Inline(queue) = &self.dispatcher {
            loop {
                if self.timed_out(timeout) {
                    return Err(self.timeout_error(timeout));
                }
                let next = lock(queue).pop_front();
                match next {
                    Some((actor, fired)) => self.execute(actor, fired),
                    None => break,
                }
            }
        }
        let mut state = lock(&self.state);
        while state.in_flight > 0 {
            match timeout {
                Some(limit) => {
                    let elapsed = self.started.elapsed();
                    if elapsed >= limit {
                        drop(state);
                        return Err(self.timeout_error(timeout));
                    }
                    let (guard, _) = self
                        .idle
                        .wait_timeout(state, limit - elapsed)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    state = guard;
                }
                None => {
                    state = self
                        .idle
                        .wait(state)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
            }
        }
        let completed = state.completed;
        drop(state);
        if let Some(err) = self.first_error() {
            return Err(err);
        }
        if completed {
            Ok(())
        } else {
            Err(SchedulerError::Stall {
                pending: self.set.pending(self.seq),
            })
        }
    }

    fn timed_out(&self, timeout: Option<Duration>) -> bool {
        timeout.map_or(false, |limit| self.started.elapsed() >= limit)
    }

    fn timeout_error(&self, timeout: Option<Duration>) -> SchedulerError {
        let err = SchedulerError::Timeout {
            millis: timeout.unwrap_or_default().as_millis(),
        };
        self.fail(err.clone());
        err
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn iterations(&self) -> usize {
        self.prepared.load(Ordering::SeqCst)
    }

    pub fn report(&self) -> RunReport {
        let mut snapshots = std::mem::take(&mut *lock(&self.snapshots));
        snapshots.sort_by_key(|snapshot| snapshot.iteration);
        let mut branches = std::mem::take(&mut *lock(&self.branches));
        branches.sort();
        let trace = self
            .trace
            .as_ref()
            .map(|trace| std::mem::take(&mut *lock(trace)))
            .unwrap_or_default();
        RunReport {
            run_id: self.run_id,
            actor_set: self.set.name().to_string(),
            iterations: self.iterations(),
            outputs: snapshots
                .last()
                .map(|snapshot| snapshot.values.clone())
                .unwrap_or_default(),
            snapshots,
            branches,
            trace,
            elapsed_micros: self.elapsed().as_micros(),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
