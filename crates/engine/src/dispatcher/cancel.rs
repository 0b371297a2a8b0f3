use std::sync::{Arc, Weak};

use tracing::info;

use calcnode_core::CalculationJobSpecification;

use super::job_dispatcher::DispatcherInner;
use super::dispatchable::JobRun;

/// Handle returned by [`JobDispatcher::dispatch_job`](super::JobDispatcher::dispatch_job).
///
/// Dropping it does not cancel the job.
pub struct Cancelable {
    run: Arc<JobRun>,
    dispatcher: Weak<DispatcherInner>,
}

impl Cancelable {
    pub(crate) fn new(run: Arc<JobRun>, dispatcher: Weak<DispatcherInner>) -> Self {
        Self { run, dispatcher }
    }

    /// Stop the job and every job of its tail graph. No result is delivered
    /// afterwards, and every invoker still running one of its jobs is told to
    /// cancel it. Interruption on the invoker side is best effort either way;
    /// `may_interrupt_if_running` is only recorded in the log.
    ///
    /// Returns `false` if the result was already delivered or the job was
    /// cancelled before.
    pub fn cancel(&self, may_interrupt_if_running: bool) -> bool {
        if !self.run.graph.cancel() {
            return false;
        }
        let mut interrupted = 0;
        for unit in self.run.release_units() {
            let Some(invocation) = unit.stop() else {
                continue;
            };
            invocation.invoker.cancel(std::slice::from_ref(&unit.specification));
            interrupted += 1;
        }
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.cancelled(&self.run);
        }
        info!(job_id = %self.run.graph.root(), interrupted, may_interrupt_if_running, "job cancelled");
        true
    }

    /// The result was delivered or the job was cancelled.
    pub fn is_done(&self) -> bool {
        self.run.graph.is_done()
    }

    pub fn is_cancelled(&self) -> bool {
        self.run.graph.is_cancelled()
    }

    pub fn specification(&self) -> &CalculationJobSpecification {
        self.run.graph.root()
    }
}

impl std::fmt::Debug for Cancelable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cancelable")
            .field("job", self.run.graph.root())
            .field("done", &self.is_done())
            .finish()
    }
}
