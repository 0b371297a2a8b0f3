use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use calcnode_core::{CalculationJobResult, CalculationJobSpecification};
use calcnode_wire::{Connection, MessageSender, RemoteMessage};

use crate::error::EngineError;
use crate::invoker::{JobFailure, JobInvocationReceiver, JobInvoker, LocalNodeJobInvoker};

/// Node side of a remote connection: runs jobs sent by the dispatcher on
/// local calculation nodes and sends the outcomes back.
pub struct RemoteNodeClient {
    invoker: Arc<LocalNodeJobInvoker>,
    function_init_id: AtomicI64,
    /// Forwarders of runs still executing, so a cancel can silence them.
    forwarders: Mutex<HashMap<CalculationJobSpecification, Vec<Weak<ResultForwarder>>>>,
}

impl RemoteNodeClient {
    pub fn new(invoker: Arc<LocalNodeJobInvoker>) -> Self {
        Self {
            invoker,
            function_init_id: AtomicI64::new(0),
            forwarders: Mutex::new(HashMap::new()),
        }
    }

    /// The last function initialization id announced by the dispatcher.
    pub fn function_init_id(&self) -> i64 {
        self.function_init_id.load(Ordering::SeqCst)
    }

    /// Announce this node and serve requests until the connection closes or
    /// `shutdown` fires.
    #[instrument(skip_all, fields(node = %self.invoker.invoker_id()))]
    pub async fn run(&self, connection: Connection, shutdown: CancellationToken) -> Result<(), EngineError> {
        let (sender, mut receiver) = connection.split();
        let sender: Arc<dyn MessageSender> = sender;
        sender.send(&RemoteMessage::Ready {
            capacity: u32::try_from(self.invoker.node_count()).unwrap_or(u32::MAX),
            node_id: self.invoker.invoker_id().to_string(),
            capabilities: self.invoker.capabilities(),
        })?;
        info!(capacity = self.invoker.node_count(), "announced to dispatcher");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("remote node client shutting down");
                    break;
                }
                message = receiver.recv() => match message {
                    Some(message) => self.handle(message, &sender)?,
                    None => {
                        info!("dispatcher closed the connection");
                        break;
                    }
                },
            }
        }
        Ok(())
    }

    fn handle(&self, message: RemoteMessage, sender: &Arc<dyn MessageSender>) -> Result<(), EngineError> {
        match message {
            RemoteMessage::Init { function_init_id } => {
                debug!(function_init_id, "function initialization received");
                self.function_init_id.store(function_init_id, Ordering::SeqCst);
            }
            RemoteMessage::Execute { job } => {
                let forwarder = Arc::new(ResultForwarder {
                    job: job.specification.clone(),
                    sender: Arc::clone(sender),
                    silenced: AtomicBool::new(false),
                });
                self.track(&forwarder);
                if !self.invoker.invoke(&job, forwarder) {
                    warn!(job_id = %job.specification, "no idle node for job");
                    sender.send(&RemoteMessage::Failure {
                        job: job.specification,
                        message: "node saturated".into(),
                        completed: Vec::new(),
                    })?;
                }
            }
            RemoteMessage::IsAlive { jobs } => {
                for job in jobs {
                    if !self.invoker.is_running(&job) {
                        debug!(job_id = %job, "queried job is not running");
                        sender.send(&RemoteMessage::Failure {
                            job,
                            message: "job not running".into(),
                            completed: Vec::new(),
                        })?;
                    }
                }
            }
            RemoteMessage::Cancel { jobs } => {
                // The dispatcher has already given up on these runs.
                self.silence(&jobs);
                self.invoker.cancel(&jobs);
            }
            other => {
                warn!(topic = other.topic(), "unexpected message from dispatcher");
            }
        }
        Ok(())
    }

    fn forwarders(&self) -> std::sync::MutexGuard<'_, HashMap<CalculationJobSpecification, Vec<Weak<ResultForwarder>>>> {
        self.forwarders.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn track(&self, forwarder: &Arc<ResultForwarder>) {
        let mut forwarders = self.forwarders();
        forwarders.retain(|_, runs| {
            runs.retain(|run| run.strong_count() > 0);
            !runs.is_empty()
        });
        forwarders
            .entry(forwarder.job.clone())
            .or_default()
            .push(Arc::downgrade(forwarder));
    }

    /// Runs of `jobs` executing now never answer. Runs started later
    /// answer as usual.
    fn silence(&self, jobs: &[CalculationJobSpecification]) {
        let mut forwarders = self.forwarders();
        for job in jobs {
            for run in forwarders.remove(job).into_iter().flatten() {
                if let Some(run) = run.upgrade() {
                    run.silenced.store(true, Ordering::SeqCst);
                }
            }
        }
    }
}

/// Sends the outcome of one job back over the connection.
struct ResultForwarder {
    job: CalculationJobSpecification,
    sender: Arc<dyn MessageSender>,
    silenced: AtomicBool,
}

impl ResultForwarder {
    fn is_silenced(&self) -> bool {
        let silenced = self.silenced.load(Ordering::SeqCst);
        if silenced {
            debug!(job_id = %self.job, "dropping answer for cancelled run");
        }
        silenced
    }
}

impl JobInvocationReceiver for ResultForwarder {
    fn job_completed(&self, result: CalculationJobResult) {
        if self.is_silenced() {
            return;
        }
        if let Err(e) = self.sender.send(&RemoteMessage::Result { result }) {
            warn!(job_id = %self.job, error = %e, "failed to send result");
        }
    }

    fn job_failed(&self, failure: JobFailure) {
        if self.is_silenced() {
            return;
        }
        let message = RemoteMessage::Failure {
            job: self.job.clone(),
            message: failure.message,
            completed: failure.completed,
        };
        if let Err(e) = self.sender.send(&message) {
            warn!(job_id = %self.job, error = %e, "failed to send failure");
        }
    }
}
