use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use calcnode_core::{CalculationJob, CalculationJobSpecification};
use calcnode_wire::Capabilities;

use crate::config::LocalConfig;
use crate::error::EngineError;
use crate::node::CalculationNode;

use super::{AvailabilityNotifier, JobFailure, JobInvocationReceiver, JobInvoker};

struct LocalState {
    idle: Vec<Arc<dyn CalculationNode>>,
    notifiers: Vec<AvailabilityNotifier>,
    /// Every execution of a specification keeps its own token. A retry can
    /// start while an interrupted earlier run of the same job is finishing.
    running: HashMap<CalculationJobSpecification, Vec<(u64, CancellationToken)>>,
    next_run: u64,
}

/// Runs jobs on in-process calculation nodes, one job per node at a time.
///
/// Capacity is the number of idle nodes. Each node's work runs on a
/// dedicated `rayon` pool with one thread per node.
pub struct LocalNodeJobInvoker {
    invoker_id: String,
    node_count: usize,
    pool: rayon::ThreadPool,
    state: Arc<Mutex<LocalState>>,
}

impl LocalNodeJobInvoker {
    pub fn new(
        invoker_id: impl Into<String>,
        nodes: Vec<Arc<dyn CalculationNode>>,
    ) -> Result<Self, EngineError> {
        let invoker_id = invoker_id.into();
        let node_count = nodes.len();
        if node_count == 0 {
            return Err(EngineError::Config(format!(
                "local invoker '{invoker_id}' needs at least one calculation node"
            )));
        }
        let thread_prefix = invoker_id.clone();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(node_count)
            .thread_name(move |i| format!("{thread_prefix}-{i}"))
            .build()?;
        info!(invoker = %invoker_id, nodes = node_count, "local invoker started");
        Ok(Self {
            invoker_id,
            node_count,
            pool,
            state: Arc::new(Mutex::new(LocalState {
                idle: nodes,
                notifiers: Vec::new(),
                running: HashMap::new(),
                next_run: 0,
            })),
        })
    }

    /// Build `config.node_count` nodes named `<prefix>-<n>`.
    pub fn from_config(
        config: &LocalConfig,
        mut make_node: impl FnMut(String) -> Arc<dyn CalculationNode>,
    ) -> Result<Self, EngineError> {
        let nodes = (0..config.resolved_node_count())
            .map(|n| make_node(format!("{}-{n}", config.node_id_prefix)))
            .collect();
        Self::new(config.node_id_prefix.clone(), nodes)
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }

    pub fn idle_count(&self) -> usize {
        self.lock().idle.len()
    }

    pub fn is_running(&self, job: &CalculationJobSpecification) -> bool {
        self.lock().running.contains_key(job)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl JobInvoker for LocalNodeJobInvoker {
    fn invoker_id(&self) -> &str {
        &self.invoker_id
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::from([("node_count".to_string(), self.node_count.to_string())])
    }

    fn invoke(&self, job: &CalculationJob, receiver: Arc<dyn JobInvocationReceiver>) -> bool {
        let token = CancellationToken::new();
        let (node, run) = {
            let mut state = self.lock();
            let Some(node) = state.idle.pop() else {
                return false;
            };
            let run = state.next_run;
            state.next_run += 1;
            state
                .running
                .entry(job.specification.clone())
                .or_default()
                .push((run, token.clone()));
            (node, run)
        };
        debug!(invoker = %self.invoker_id, node = node.node_id(), job_id = %job.specification, "executing job");

        let job = job.clone();
        let state = Arc::clone(&self.state);
        self.pool.spawn(move || {
            let outcome = node.execute_job(&job, &token);
            let node_id = node.node_id().to_string();
            let notifiers = {
                let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(runs) = state.running.get_mut(&job.specification) {
                    runs.retain(|(id, _)| *id != run);
                    if runs.is_empty() {
                        state.running.remove(&job.specification);
                    }
                }
                state.idle.push(node);
                std::mem::take(&mut state.notifiers)
            };
            match outcome {
                Ok(result) => receiver.job_completed(result),
                Err(interrupted) => receiver.job_failed(
                    JobFailure::new(node_id, interrupted.reason).with_completed(interrupted.completed),
                ),
            }
            for notifier in notifiers {
                notifier.notify();
            }
        });
        true
    }

    fn notify_when_available(&self, notifier: AvailabilityNotifier) -> bool {
        let mut state = self.lock();
        if !state.idle.is_empty() {
            return true;
        }
        state.notifiers.push(notifier);
        false
    }

    async fn is_alive(&self, jobs: &[CalculationJobSpecification]) -> bool {
        let state = self.lock();
        jobs.iter().any(|job| state.running.contains_key(job))
    }

    fn cancel(&self, jobs: &[CalculationJobSpecification]) {
        let state = self.lock();
        for job in jobs {
            if let Some(runs) = state.running.get(job) {
                info!(invoker = %self.invoker_id, job_id = %job, runs = runs.len(), "cancelling job");
                for (_, token) in runs {
                    token.cancel();
                }
            }
        }
    }
}
