use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use calcnode_core::{
    CalculationJob, CalculationJobResult, CalculationJobResultItem, CalculationJobSpecification,
    FunctionBlacklistMaintainer, NoopFunctionBlacklist,
};

use crate::config::DispatcherConfig;
use crate::error::EngineError;
use crate::invoker::{AvailabilityNotifier, JobFailure, JobInvoker};
use crate::job::{JobGraph, ReadyJob, StandardJob};
use crate::metrics::DispatcherMetrics;

use super::cancel::Cancelable;
use super::dispatchable::{DispatchableJob, Invocation, InvocationCallback, JobRun, UnitState};
use super::ring::{InvokerId, InvokerRing};
use super::JobResultReceiver;

/// Refusals tolerated from an invoker that keeps reporting free capacity
/// before it is left alone for [`REFUSAL_BACKOFF`].
const REFUSAL_LIMIT: u32 = 3;
const REFUSAL_BACKOFF: Duration = Duration::from_millis(100);

/// Hands jobs to a pool of invokers and turns whatever happens to them into
/// exactly one result per submitted job.
///
/// Cloning is cheap; clones share the same pool and queue.
#[derive(Clone)]
pub struct JobDispatcher {
    inner: Arc<DispatcherInner>,
}

pub(crate) struct DispatcherInner {
    config: DispatcherConfig,
    runtime: Handle,
    ring: Mutex<InvokerRing>,
    pending: Mutex<VecDeque<Arc<DispatchableJob>>>,
    blacklist: RwLock<Arc<dyn FunctionBlacklistMaintainer>>,
    metrics: Mutex<DispatcherMetrics>,
    weak_self: Weak<DispatcherInner>,
}

impl JobDispatcher {
    /// Create a dispatcher on the current tokio runtime.
    pub fn new(config: DispatcherConfig) -> Result<Self, EngineError> {
        Ok(Self::with_runtime(config, Handle::try_current()?))
    }

    /// Create a dispatcher whose timeouts run on `runtime`.
    pub fn with_runtime(config: DispatcherConfig, runtime: Handle) -> Self {
        info!(
            max_job_attempts = config.max_job_attempts,
            max_job_execution_time_ms = config.max_job_execution_time_ms,
            "job dispatcher created"
        );
        let inner = Arc::new_cyclic(|weak_self| DispatcherInner {
            config,
            runtime,
            ring: Mutex::new(InvokerRing::default()),
            pending: Mutex::new(VecDeque::new()),
            blacklist: RwLock::new(Arc::new(NoopFunctionBlacklist)),
            metrics: Mutex::new(DispatcherMetrics::default()),
            weak_self: weak_self.clone(),
        });
        Self { inner }
    }

    pub fn with_invokers(
        config: DispatcherConfig,
        invokers: impl IntoIterator<Item = Arc<dyn JobInvoker>>,
    ) -> Result<Self, EngineError> {
        let dispatcher = Self::new(config)?;
        for invoker in invokers {
            dispatcher.register_job_invoker(invoker);
        }
        Ok(dispatcher)
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    /// Receives the items of single-item jobs that exhausted their attempts.
    pub fn set_blacklist_maintainer(&self, maintainer: Arc<dyn FunctionBlacklistMaintainer>) {
        *self
            .inner
            .blacklist
            .write()
            .unwrap_or_else(PoisonError::into_inner) = maintainer;
    }

    /// Add an invoker to the ring and offer it queued work.
    pub fn register_job_invoker(&self, invoker: Arc<dyn JobInvoker>) -> InvokerId {
        let name = invoker.invoker_id().to_string();
        let id = self.inner.ring().register(invoker);
        info!(invoker = %id, name = %name, "job invoker registered");
        self.inner.retry_pending();
        id
    }

    /// Take an invoker out of the ring. Jobs it is running are not touched.
    pub fn remove_job_invoker(&self, id: InvokerId) -> bool {
        let removed = self.inner.ring().remove(id);
        if let Some(invoker) = &removed {
            info!(invoker = %id, name = invoker.invoker_id(), "job invoker removed");
        }
        removed.is_some()
    }

    /// Submit a job with its tail graph. Never blocks on execution.
    pub fn dispatch_job(&self, job: CalculationJob, receiver: Arc<dyn JobResultReceiver>) -> Cancelable {
        let run = self.inner.dispatch(job, receiver);
        Cancelable::new(run, Arc::downgrade(&self.inner))
    }

    pub fn invoker_count(&self) -> usize {
        self.inner.ring().len()
    }

    /// Jobs waiting for a free invoker.
    pub fn pending_count(&self) -> usize {
        self.inner.pending().len()
    }

    /// Snapshot of the dispatcher counters.
    pub fn metrics(&self) -> DispatcherMetrics {
        self.inner
            .metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl DispatcherInner {
    fn ring(&self) -> MutexGuard<'_, InvokerRing> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending(&self) -> MutexGuard<'_, VecDeque<Arc<DispatchableJob>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn blacklist(&self) -> Arc<dyn FunctionBlacklistMaintainer> {
        Arc::clone(&self.blacklist.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn record(&self, f: impl FnOnce(&mut DispatcherMetrics)) {
        f(&mut self.metrics.lock().unwrap_or_else(PoisonError::into_inner));
    }

    fn dispatch(&self, mut job: CalculationJob, receiver: Arc<dyn JobResultReceiver>) -> Arc<JobRun> {
        job.mark_dispatched();
        let root = job.specification.clone();
        let standard = StandardJob::new(job);
        let graph = JobGraph::new(root.clone(), standard.flatten());
        let run = JobRun::new(graph, receiver);
        self.record(|m| m.jobs_submitted += 1);
        info!(
            job_id = %root,
            jobs = run.graph.len(),
            items = standard.job().items().len(),
            fails_outright = standard.fails_outright(),
            "job submitted"
        );

        if !run.graph.cyclic_jobs().is_empty() {
            warn!(job_id = %root, cyclic = ?run.graph.cyclic_jobs(), "tail jobs depend on each other, failing job");
            let result = run
                .graph
                .failure_result(&self.config.job_failure_node_id, "cyclic tail job dependency");
            self.record(|m| m.synthetic_failures += result.items.len() as u64);
            self.deliver(&run, result);
            return run;
        }

        for ready in run.graph.take_initial() {
            self.start_unit(&run, ready);
        }
        run
    }

    fn start_unit(&self, run: &Arc<JobRun>, ready: ReadyJob) {
        let unit = DispatchableJob::new(Arc::clone(run), ready.node, ready.job);
        self.submit(unit);
    }

    /// Dispatch now, or queue behind jobs already waiting.
    fn submit(&self, unit: Arc<DispatchableJob>) {
        let queued_ahead = !self.pending().is_empty();
        if queued_ahead || !self.try_dispatch(&unit) {
            debug!(job_id = %unit.specification, "job queued");
            self.pending().push_back(unit);
            self.retry_pending();
        }
    }

    /// Offer the unit's current job around the ring. `false` when every
    /// invoker refused.
    fn try_dispatch(&self, unit: &Arc<DispatchableJob>) -> bool {
        let (job, excluded) = {
            let state = unit.lock();
            if state.finished || unit.run.graph.is_cancelled() {
                return true;
            }
            (state.watched.current().clone(), state.excluded.clone())
        };

        let candidates = self.ring().candidates(&excluded);
        for (invoker_id, invoker) in candidates {
            // Registered before invoke so a callback from inside invoke finds it.
            let generation = {
                let mut state = unit.lock();
                if state.finished {
                    return true;
                }
                state.generation += 1;
                state.invocation = Some(Invocation {
                    invoker_id,
                    invoker: Arc::clone(&invoker),
                });
                state.generation
            };
            let callback = Arc::new(InvocationCallback {
                dispatcher: self.weak_self.clone(),
                unit: Arc::clone(unit),
                invoker_id,
                generation,
            });

            if invoker.invoke(&job, callback) {
                self.ring().accepted(invoker_id);
                self.record(|m| m.jobs_dispatched += 1);
                info!(
                    job_id = %job.specification,
                    invoker = %invoker_id,
                    name = invoker.invoker_id(),
                    items = job.items().len(),
                    "job dispatched"
                );
                self.arm_timeout(unit, generation);
                return true;
            }

            debug!(job_id = %job.specification, invoker = %invoker_id, "invoker refused job");
            {
                let mut state = unit.lock();
                if state.generation == generation {
                    state.invocation = None;
                }
            }
            self.park(invoker_id, invoker);
        }
        false
    }

    /// Take a saturated invoker out of rotation until it calls back.
    fn park(&self, invoker_id: InvokerId, invoker: Arc<dyn JobInvoker>) {
        self.ring().mark_busy(invoker_id);
        let weak = self.weak_self.clone();
        let notifier = AvailabilityNotifier::new(move || {
            if let Some(dispatcher) = weak.upgrade() {
                dispatcher.invoker_available(invoker_id);
            }
        });
        if !invoker.notify_when_available(notifier) {
            return;
        }

        let refusals = self.ring().note_refusal(invoker_id);
        if refusals < REFUSAL_LIMIT {
            self.ring().mark_available(invoker_id);
            return;
        }
        warn!(invoker = %invoker_id, refusals, "invoker refuses jobs while reporting capacity, backing off");
        let weak = self.weak_self.clone();
        self.runtime.spawn(async move {
            tokio::time::sleep(REFUSAL_BACKOFF).await;
            if let Some(dispatcher) = weak.upgrade() {
                dispatcher.invoker_available(invoker_id);
            }
        });
    }

    fn invoker_available(&self, invoker_id: InvokerId) {
        if !self.ring().mark_available(invoker_id) {
            return;
        }
        debug!(invoker = %invoker_id, "invoker available");
        self.retry_pending();
    }

    /// Hand queued jobs to free invokers, oldest first.
    fn retry_pending(&self) {
        loop {
            let Some(unit) = self.pending().pop_front() else {
                return;
            };
            if !unit.is_live() {
                continue;
            }
            if self.try_dispatch(&unit) {
                continue;
            }
            self.pending().push_front(unit);
            // An invoker may have freed up while the job was out of the queue.
            if !self.ring().any_available() {
                return;
            }
        }
    }

    fn arm_timeout(&self, unit: &Arc<DispatchableJob>, generation: u64) {
        let Some(max) = self.config.max_job_execution_time() else {
            return;
        };
        let query = self.config.max_job_execution_time_query();
        let weak = self.weak_self.clone();
        let task_unit = Arc::clone(unit);

        let handle = self.runtime.spawn(async move {
            tokio::time::sleep(max).await;
            let Some((invocation, spec)) = task_unit.current_invocation(generation) else {
                return;
            };
            if let Some(dispatcher) = weak.upgrade() {
                dispatcher.record(|m| m.liveness_queries += 1);
            }
            let jobs = [spec];
            let alive = tokio::time::timeout(query, invocation.invoker.is_alive(&jobs))
                .await
                .unwrap_or(false);
            if alive {
                info!(job_id = %jobs[0], invoker = %invocation.invoker_id, "job overran but is alive, extending deadline");
                tokio::time::sleep(max).await;
                if task_unit.current_invocation(generation).is_none() {
                    return;
                }
            }
            if let Some(dispatcher) = weak.upgrade() {
                dispatcher.job_timed_out(&task_unit, generation, invocation, &jobs);
            }
        });

        let mut state = unit.lock();
        if state.generation == generation && state.invocation.is_some() && !state.finished {
            state.timeout = Some(handle);
        } else {
            handle.abort();
        }
    }

    fn job_timed_out(
        &self,
        unit: &Arc<DispatchableJob>,
        generation: u64,
        invocation: Invocation,
        jobs: &[CalculationJobSpecification],
    ) {
        {
            let mut state = unit.lock();
            if state.finished || state.generation != generation || state.invocation.is_none() {
                return;
            }
            // This is the running timeout task; it must not abort itself.
            state.timeout = None;
        }
        self.record(|m| m.timeouts += 1);
        warn!(
            job_id = %unit.specification,
            invoker = %invocation.invoker_id,
            timeout_ms = self.config.max_job_execution_time_ms,
            "job timed out, cancelling"
        );
        invocation.invoker.cancel(jobs);
        let failure = JobFailure::new(invocation.invoker.invoker_id(), "timeout");
        self.job_failed(unit, generation, invocation.invoker_id, failure);
    }

    pub(crate) fn job_completed(
        &self,
        unit: &Arc<DispatchableJob>,
        generation: u64,
        invoker_id: InvokerId,
        result: CalculationJobResult,
    ) {
        let mut state = unit.lock();
        if state.finished || state.generation != generation || state.invocation.is_none() {
            debug!(job_id = %result.specification, invoker = %invoker_id, "ignoring stale result");
            return;
        }
        let expected = state.watched.item_count();
        if result.items.len() != expected {
            drop(state);
            warn!(
                job_id = %result.specification,
                expected,
                actual = result.items.len(),
                "result item count mismatch"
            );
            let message = format!("expected {expected} result items, got {}", result.items.len());
            self.job_failed(unit, generation, invoker_id, JobFailure::new(result.compute_node_id, message));
            return;
        }
        state.clear_invocation();
        debug!(
            job_id = %result.specification,
            invoker = %invoker_id,
            node = %result.compute_node_id,
            "job completed"
        );
        state.record_items(result.items, result.compute_node_id, result.duration_nanos);
        self.advance(unit, state);
    }

    pub(crate) fn job_failed(
        &self,
        unit: &Arc<DispatchableJob>,
        generation: u64,
        invoker_id: InvokerId,
        failure: JobFailure,
    ) {
        let mut state = unit.lock();
        if state.finished || state.generation != generation || state.invocation.is_none() {
            debug!(job_id = %unit.specification, invoker = %invoker_id, "ignoring stale failure");
            return;
        }
        state.clear_invocation();
        state.attempts += 1;
        state.excluded.insert(invoker_id);
        self.record(|m| m.failed_attempts += 1);

        let expected = state.watched.item_count();
        let completed = failure.completed.len();
        warn!(
            job_id = %unit.specification,
            invoker = %invoker_id,
            node = %failure.compute_node_id,
            attempt = state.attempts,
            completed,
            expected,
            message = %failure.message,
            "job failed"
        );

        if expected > 0 && completed >= expected {
            let mut items = failure.completed;
            items.truncate(expected);
            state.record_items(items, failure.compute_node_id, 0);
            self.advance(unit, state);
            return;
        }

        if completed > 0 {
            state.record_items(failure.completed, failure.compute_node_id, 0);
            state.watched = state.watched.clone().prepare_retry_job(completed);
            state.attempts = 0;
            self.record(|m| m.splits += 1);
            info!(
                job_id = %unit.specification,
                remaining = state.watched.item_count(),
                "job partially completed, retrying remaining items"
            );
            drop(state);
            self.submit(Arc::clone(unit));
            return;
        }

        if state.attempts < self.config.max_job_attempts {
            self.record(|m| m.retries += 1);
            info!(job_id = %unit.specification, attempt = state.attempts + 1, "retrying job");
            drop(state);
            self.submit(Arc::clone(unit));
            return;
        }

        if state.watched.fails_outright() {
            let items = state.watched.current().items().to_vec();
            self.blacklist().failed_job_items(&items);
            let failures: Vec<CalculationJobResultItem> = items
                .iter()
                .map(|_| CalculationJobResultItem::job_failure(failure.message.as_str()))
                .collect();
            self.record(|m| m.synthetic_failures += failures.len() as u64);
            warn!(
                job_id = %unit.specification,
                attempts = state.attempts,
                "retries exhausted, reporting item failure"
            );
            let failure_node_id = self.config.job_failure_node_id.clone();
            state.record_items(failures, failure_node_id, 0);
            self.advance(unit, state);
            return;
        }

        info!(
            job_id = %unit.specification,
            items = state.watched.item_count(),
            "retries exhausted, running first item on its own"
        );
        state.watched = state.watched.clone().isolate();
        state.reset_attempts();
        drop(state);
        self.submit(Arc::clone(unit));
    }

    /// The current job of the unit is done; move on to the next part or
    /// finish the unit.
    fn advance(&self, unit: &Arc<DispatchableJob>, mut state: MutexGuard<'_, UnitState>) {
        match state.watched.clone().advance() {
            Some(next) => {
                state.watched = next;
                state.reset_attempts();
                drop(state);
                self.submit(Arc::clone(unit));
            }
            None => {
                state.finished = true;
                let result = unit.result(&state);
                drop(state);
                self.unit_finished(unit, result);
            }
        }
    }

    fn unit_finished(&self, unit: &Arc<DispatchableJob>, result: CalculationJobResult) {
        debug!(job_id = %unit.specification, items = result.items.len(), node = %result.compute_node_id, "graph job finished");
        let (ready, merged) = unit.run.graph.complete(unit.node, result);
        for job in ready {
            self.start_unit(&unit.run, job);
        }
        if let Some(merged) = merged {
            self.deliver(&unit.run, merged);
        }
    }

    fn deliver(&self, run: &JobRun, result: CalculationJobResult) {
        if !run.graph.begin_delivery() {
            debug!(job_id = %result.specification, "dropping result of cancelled job");
            return;
        }
        run.release_units();
        let elapsed = run.started.elapsed();
        self.record(|m| m.record_completion(elapsed));
        info!(
            job_id = %result.specification,
            node = %result.compute_node_id,
            items = result.items.len(),
            duration_ms = elapsed.as_millis() as u64,
            "job result delivered"
        );
        run.receiver.result_received(result);
    }

    pub(crate) fn cancelled(&self, run: &Arc<JobRun>) {
        self.pending().retain(|unit| !Arc::ptr_eq(&unit.run, run));
        self.record(|m| m.cancellations += 1);
    }
}
