//! Per-item stuck execution detection.
//!
//! Calculation node threads register the item they are running. A periodic
//! check cancels the item's token once it has run longer than the configured
//! limit. Functions observe the token through
//! [`FunctionExecutionContext::is_interrupted`](crate::node::FunctionExecutionContext::is_interrupted)
//! and the node stops the job after the item returns.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use calcnode_core::CalculationJobItem;

thread_local! {
    // Dropped when the thread exits, which is how the watchdog notices dead threads.
    static LIVENESS: Arc<()> = Arc::new(());
}

struct Running {
    description: String,
    started: Instant,
    token: CancellationToken,
    interrupted: bool,
}

struct ThreadRecord {
    current: Option<Running>,
    liveness: Weak<()>,
}

pub struct ExecutionWatchdog {
    max_item_time: Option<Duration>,
    threads: Mutex<HashMap<ThreadId, ThreadRecord>>,
}

impl ExecutionWatchdog {
    /// `None` disables interruption; threads are still tracked.
    pub fn new(max_item_time: Option<Duration>) -> Self {
        Self {
            max_item_time,
            threads: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_item_time(&self) -> Option<Duration> {
        self.max_item_time
    }

    /// Record that the calling thread started executing `item`.
    pub fn job_execution_started(&self, item: &CalculationJobItem, token: CancellationToken) {
        let liveness = LIVENESS.with(Arc::downgrade);
        let running = Running {
            description: format!("{} on {}", item.function_id, item.target),
            started: Instant::now(),
            token,
            interrupted: false,
        };
        let mut threads = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
        threads.insert(
            std::thread::current().id(),
            ThreadRecord {
                current: Some(running),
                liveness,
            },
        );
    }

    /// Clear the calling thread's current item. The thread stays registered
    /// until it exits.
    pub fn job_execution_stopped(&self) {
        let mut threads = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(record) = threads.get_mut(&std::thread::current().id()) {
            record.current = None;
        }
    }

    /// Interrupt overdue items and forget exited threads. Returns how many
    /// items were interrupted by this call.
    pub fn check(&self) -> usize {
        let now = Instant::now();
        let mut interrupted = 0;
        let mut threads = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
        threads.retain(|thread, record| {
            if record.liveness.strong_count() == 0 {
                debug!(thread = ?thread, "forgetting exited thread");
                return false;
            }
            let (Some(limit), Some(running)) = (self.max_item_time, record.current.as_mut()) else {
                return true;
            };
            let elapsed = now.duration_since(running.started);
            if !running.interrupted && elapsed > limit {
                warn!(
                    thread = ?thread,
                    item = %running.description,
                    elapsed_ms = elapsed.as_millis() as u64,
                    limit_ms = limit.as_millis() as u64,
                    "job item exceeded maximum execution time, interrupting"
                );
                running.token.cancel();
                running.interrupted = true;
                interrupted += 1;
            }
            true
        });
        interrupted
    }

    /// Whether any thread that ever registered an item is still running.
    pub fn are_threads_alive(&self) -> bool {
        self.threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .any(|r| r.liveness.strong_count() > 0)
    }

    /// Run [`check`](Self::check) every `interval` until `shutdown` fires.
    pub fn spawn_checker(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let watchdog = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let interrupted = watchdog.check();
                        if interrupted > 0 {
                            debug!(interrupted, "watchdog check interrupted items");
                        }
                    }
                }
            }
        })
    }
}
