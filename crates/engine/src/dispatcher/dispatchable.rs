use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

use tokio::task::JoinHandle;

use calcnode_core::{
    join_node_ids, CalculationJob, CalculationJobResult, CalculationJobResultItem,
    CalculationJobSpecification,
};

use crate::invoker::{JobFailure, JobInvocationReceiver, JobInvoker};
use crate::job::{JobGraph, WatchedJob};

use super::job_dispatcher::DispatcherInner;
use super::ring::InvokerId;
use super::JobResultReceiver;

/// One submitted job and everything spawned from it.
pub(crate) struct JobRun {
    pub graph: JobGraph,
    pub receiver: Arc<dyn JobResultReceiver>,
    pub started: Instant,
    pub units: Mutex<Vec<Arc<DispatchableJob>>>,
}

impl JobRun {
    pub fn new(graph: JobGraph, receiver: Arc<dyn JobResultReceiver>) -> Arc<Self> {
        Arc::new(Self {
            graph,
            receiver,
            started: Instant::now(),
            units: Mutex::new(Vec::new()),
        })
    }

    /// Drop the run's references to its units once it is delivered or
    /// cancelled. Units point back at the run.
    pub fn release_units(&self) -> Vec<Arc<DispatchableJob>> {
        std::mem::take(&mut *self.units.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[derive(Clone)]
pub(crate) struct Invocation {
    pub invoker_id: InvokerId,
    pub invoker: Arc<dyn JobInvoker>,
}

pub(crate) struct UnitState {
    pub watched: WatchedJob,
    /// Results of items already completed, in item order.
    pub done_items: Vec<CalculationJobResultItem>,
    pub node_ids: Vec<String>,
    pub duration_nanos: u64,
    /// Failed attempts of the current job.
    pub attempts: u32,
    pub excluded: HashSet<InvokerId>,
    /// Bumped on every invocation so late callbacks can be told apart.
    pub generation: u64,
    pub invocation: Option<Invocation>,
    pub timeout: Option<JoinHandle<()>>,
    pub finished: bool,
}

impl UnitState {
    /// Forget the outstanding invocation and its timeout.
    pub fn clear_invocation(&mut self) -> Option<Invocation> {
        if let Some(timeout) = self.timeout.take() {
            timeout.abort();
        }
        self.invocation.take()
    }

    /// Accept results for the leading items of the current job.
    pub fn record_items(&mut self, items: Vec<CalculationJobResultItem>, node_id: String, duration_nanos: u64) {
        self.done_items.extend(items);
        self.node_ids.push(node_id);
        self.duration_nanos += duration_nanos;
    }

    /// Start over on a new current job with a fresh attempt budget.
    pub fn reset_attempts(&mut self) {
        self.attempts = 0;
        self.excluded.clear();
    }
}

/// The dispatch state of one node of a job graph.
pub(crate) struct DispatchableJob {
    pub run: Arc<JobRun>,
    pub node: usize,
    pub specification: CalculationJobSpecification,
    state: Mutex<UnitState>,
}

impl DispatchableJob {
    pub fn new(run: Arc<JobRun>, node: usize, job: CalculationJob) -> Arc<Self> {
        let unit = Arc::new(Self {
            run: Arc::clone(&run),
            node,
            specification: job.specification.clone(),
            state: Mutex::new(UnitState {
                watched: WatchedJob::new(job),
                done_items: Vec::new(),
                node_ids: Vec::new(),
                duration_nanos: 0,
                attempts: 0,
                excluded: HashSet::new(),
                generation: 0,
                invocation: None,
                timeout: None,
                finished: false,
            }),
        });
        if !run.graph.is_done() {
            run.units
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(Arc::clone(&unit));
        }
        unit
    }

    pub fn lock(&self) -> MutexGuard<'_, UnitState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_live(&self) -> bool {
        !self.lock().finished && !self.run.graph.is_cancelled()
    }

    /// The invocation of `generation`, if it is still outstanding.
    pub fn current_invocation(&self, generation: u64) -> Option<(Invocation, CalculationJobSpecification)> {
        let state = self.lock();
        if state.finished || state.generation != generation {
            return None;
        }
        let invocation = state.invocation.clone()?;
        Some((invocation, state.watched.current().specification.clone()))
    }

    /// Stop for good. Returns the outstanding invocation, if any.
    pub fn stop(&self) -> Option<Invocation> {
        let mut state = self.lock();
        state.finished = true;
        state.clear_invocation()
    }

    /// Result for this graph node built from everything recorded so far.
    pub fn result(&self, state: &UnitState) -> CalculationJobResult {
        CalculationJobResult::new(
            self.specification.clone(),
            state.duration_nanos,
            state.done_items.clone(),
            join_node_ids(state.node_ids.iter().map(String::as_str)),
        )
    }
}

/// Receiver handed to an invoker for one invocation of a unit.
pub(crate) struct InvocationCallback {
    pub dispatcher: Weak<DispatcherInner>,
    pub unit: Arc<DispatchableJob>,
    pub invoker_id: InvokerId,
    pub generation: u64,
}

impl JobInvocationReceiver for InvocationCallback {
    fn job_completed(&self, result: CalculationJobResult) {
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.job_completed(&self.unit, self.generation, self.invoker_id, result);
        }
    }

    fn job_failed(&self, failure: JobFailure) {
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.job_failed(&self.unit, self.generation, self.invoker_id, failure);
        }
    }
}
