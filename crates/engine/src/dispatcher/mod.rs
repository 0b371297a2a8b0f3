//! Job dispatch across registered invokers.
//!
//! A submitted job is flattened into its tail graph and each graph node is
//! dispatched on its own as soon as its parents have completed. Each node is
//! retried on failure, split at the first failed item when a prefix
//! completed, and timed out when the dispatcher is configured with a
//! maximum execution time. The merged result of the whole graph is handed
//! to the caller's [`JobResultReceiver`] exactly once, unless the job is
//! cancelled through its [`Cancelable`].
//!
//! - `job_dispatcher`: the dispatcher, its queue and the failure handling
//! - `ring`: round-robin bookkeeping of registered invokers
//! - `dispatchable`: per graph node dispatch state
//! - `cancel`: the handle returned from `dispatch_job`

mod cancel;
mod job_dispatcher;
mod dispatchable;
mod ring;

use calcnode_core::CalculationJobResult;

pub use cancel::Cancelable;
pub use job_dispatcher::JobDispatcher;
pub use ring::InvokerId;

/// Receives the final result of a dispatched job.
pub trait JobResultReceiver: Send + Sync {
    fn result_received(&self, result: CalculationJobResult);
}

impl<F> JobResultReceiver for F
where
    F: Fn(CalculationJobResult) + Send + Sync,
{
    fn result_received(&self, result: CalculationJobResult) {
        self(result)
    }
}
