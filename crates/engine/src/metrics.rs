use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Dispatcher operational counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatcherMetrics {
    /// Root jobs passed to `dispatch_job`.
    pub jobs_submitted: u64,
    /// Invocations accepted by an invoker, retries included.
    pub jobs_dispatched: u64,
    /// Root jobs whose result was delivered.
    pub jobs_completed: u64,
    pub failed_attempts: u64,
    pub retries: u64,
    /// Partially completed jobs resubmitted as their remaining items.
    pub splits: u64,
    pub timeouts: u64,
    pub liveness_queries: u64,
    /// Items reported as failed without running.
    pub synthetic_failures: u64,
    pub cancellations: u64,
    /// Mean time from dispatch to delivered result.
    pub avg_job_duration: Duration,
    pub last_completed: Option<DateTime<Utc>>,
}

impl DispatcherMetrics {
    /// Record a delivered root job result.
    pub fn record_completion(&mut self, duration: Duration) {
        self.jobs_completed += 1;
        self.last_completed = Some(Utc::now());

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        let count = self.jobs_completed;
        self.avg_job_duration = if count == 1 {
            duration
        } else {
            let prev_nanos = self.avg_job_duration.as_nanos() as f64;
            let cur_nanos = duration.as_nanos() as f64;
            let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / count as f64;
            Duration::from_nanos(avg_nanos as u64)
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_single_completion() {
        let mut m = DispatcherMetrics::default();
        m.record_completion(Duration::from_millis(100));
        assert_eq!(m.jobs_completed, 1);
        assert_eq!(m.avg_job_duration, Duration::from_millis(100));
        assert!(m.last_completed.is_some());
    }

    #[test]
    fn completion_average_is_incremental_mean() {
        let mut m = DispatcherMetrics::default();
        m.record_completion(Duration::from_millis(100));
        m.record_completion(Duration::from_millis(200));
        m.record_completion(Duration::from_millis(300));
        let avg_ms = m.avg_job_duration.as_millis();
        assert!((199..=201).contains(&avg_ms), "got {avg_ms}ms");
    }
}
