//! Execution targets the dispatcher hands jobs to.
//!
//! A [`JobInvoker`] runs jobs either on in-process calculation nodes
//! ([`LocalNodeJobInvoker`]) or on a node across a connection
//! ([`crate::remote::RemoteNodeJobInvoker`]). Retry, timeout and capacity
//! bookkeeping live in the dispatcher, not here.

pub mod local;

use std::sync::Arc;

use async_trait::async_trait;

use calcnode_core::{CalculationJob, CalculationJobResult, CalculationJobResultItem, CalculationJobSpecification};
use calcnode_wire::Capabilities;

pub use local::LocalNodeJobInvoker;

/// Why an accepted job did not produce a result.
#[derive(Debug, Clone, PartialEq)]
pub struct JobFailure {
    pub compute_node_id: String,
    pub message: String,
    /// Results of the leading items that did complete, in item order.
    pub completed: Vec<CalculationJobResultItem>,
}

impl JobFailure {
    pub fn new(compute_node_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            compute_node_id: compute_node_id.into(),
            message: message.into(),
            completed: Vec::new(),
        }
    }

    pub fn with_completed(mut self, completed: Vec<CalculationJobResultItem>) -> Self {
        self.completed = completed;
        self
    }
}

/// Receives the outcome of one accepted invocation. Exactly one method is
/// called, exactly once.
pub trait JobInvocationReceiver: Send + Sync {
    fn job_completed(&self, result: CalculationJobResult);

    fn job_failed(&self, failure: JobFailure);
}

/// One-shot callback fired when a saturated invoker frees capacity.
pub struct AvailabilityNotifier(Box<dyn FnOnce() + Send>);

impl AvailabilityNotifier {
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    pub fn notify(self) {
        (self.0)()
    }
}

impl std::fmt::Debug for AvailabilityNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AvailabilityNotifier")
    }
}

#[async_trait]
pub trait JobInvoker: Send + Sync {
    /// Stable identifier used in logs.
    fn invoker_id(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// Offer a job. `true` means accepted: the receiver will be called exactly
    /// once. `false` means saturated, with no side effects.
    ///
    /// Must return quickly; execution happens elsewhere.
    fn invoke(&self, job: &CalculationJob, receiver: Arc<dyn JobInvocationReceiver>) -> bool;

    /// Register interest in the next free slot.
    ///
    /// Returns `true` when capacity is already free; the notifier is dropped
    /// and the caller should retry straight away. Otherwise the notifier fires
    /// exactly once, possibly from inside a completion callback. Notifiers
    /// accumulate: every one registered while saturated fires when a slot
    /// frees, so several dispatchers can share an invoker.
    fn notify_when_available(&self, notifier: AvailabilityNotifier) -> bool;

    /// Whether any of the given jobs is still executing.
    async fn is_alive(&self, jobs: &[CalculationJobSpecification]) -> bool;

    /// Best-effort interruption of the given jobs.
    fn cancel(&self, jobs: &[CalculationJobSpecification]);
}
