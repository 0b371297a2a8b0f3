use calcnode_core::CalculationJob;
use tracing::debug;

use super::hints::adjust_cache_hints;

/// The retry unit of one graph node.
///
/// `Whole` dispatches every remaining item as one job. `Split` dispatches
/// `head` first and continues with `rest` once it completes; it is produced
/// when a job that kept failing is broken up to find the failing item.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchedJob {
    Whole(CalculationJob),
    Split {
        head: CalculationJob,
        rest: CalculationJob,
    },
}

impl WatchedJob {
    pub fn new(job: CalculationJob) -> Self {
        WatchedJob::Whole(job.without_tail())
    }

    /// The job to hand to an invoker next.
    pub fn current(&self) -> &CalculationJob {
        match self {
            WatchedJob::Whole(job) => job,
            WatchedJob::Split { head, .. } => head,
        }
    }

    /// Items in [`current`](Self::current).
    pub fn item_count(&self) -> usize {
        self.current().items().len()
    }

    /// Items not yet completed across the whole unit.
    pub fn remaining_items(&self) -> usize {
        match self {
            WatchedJob::Whole(job) => job.items().len(),
            WatchedJob::Split { head, rest } => head.items().len() + rest.items().len(),
        }
    }

    /// A failure of the current job cannot be narrowed down any further.
    pub fn fails_outright(&self) -> bool {
        self.item_count() <= 1
    }

    /// Drop the first `failure_point` items of the current job, which already
    /// completed, and continue from the first item that did not.
    pub fn prepare_retry_job(self, failure_point: usize) -> WatchedJob {
        match self {
            WatchedJob::Whole(job) => {
                let (_, suffix) = split_job(job, failure_point);
                WatchedJob::Whole(suffix)
            }
            WatchedJob::Split { head, rest } => {
                let (_, suffix) = split_job(head, failure_point);
                WatchedJob::Split { head: suffix, rest }
            }
        }
    }

    /// Run the first item of the current job on its own, then the rest.
    ///
    /// A `Split` unit already runs a single item first and is returned as is.
    pub fn isolate(self) -> WatchedJob {
        match self {
            WatchedJob::Whole(job) if job.items().len() > 1 => {
                let (head, rest) = split_job(job, 1);
                WatchedJob::Split { head, rest }
            }
            other => other,
        }
    }

    /// Move past a completed current job. `None` once nothing is left.
    pub fn advance(self) -> Option<WatchedJob> {
        match self {
            WatchedJob::Whole(_) => None,
            WatchedJob::Split { rest, .. } => Some(WatchedJob::Whole(rest)),
        }
    }
}

/// Split `job` before item `at` into two jobs with the same specification.
///
/// Cache hints of both halves are rewritten so values passing from the first
/// half to the second are shared.
pub fn split_job(job: CalculationJob, at: usize) -> (CalculationJob, CalculationJob) {
    let at = at.min(job.items().len());
    let mut prefix = job.without_tail();
    let mut suffix = prefix.clone();
    suffix.items = prefix.items.split_off(at);
    debug!(
        job_id = %job.specification,
        prefix = prefix.items.len(),
        suffix = suffix.items.len(),
        "splitting job"
    );
    let mut halves = [prefix, suffix];
    adjust_cache_hints(&mut halves);
    let [prefix, suffix] = halves;
    (prefix, suffix)
}
