use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use calcnode_core::{CalculationJob, CalculationJobSpecification};
use calcnode_wire::{Capabilities, MessageSender, RemoteMessage, WireError};

use crate::invoker::{AvailabilityNotifier, JobFailure, JobInvocationReceiver, JobInvoker};

struct RemoteState {
    capacity: usize,
    launched: usize,
    in_flight: HashMap<CalculationJobSpecification, Arc<dyn JobInvocationReceiver>>,
    notifiers: Vec<AvailabilityNotifier>,
    closed: bool,
}

/// Invoker standing in for a calculation node on the other end of a
/// connection.
///
/// The node advertises its capacity in its `Ready` message; at most that many
/// jobs are sent to it before results come back.
pub struct RemoteNodeJobInvoker {
    node_id: String,
    capabilities: Capabilities,
    sender: Arc<dyn MessageSender>,
    state: Mutex<RemoteState>,
}

impl RemoteNodeJobInvoker {
    pub fn new(
        node_id: impl Into<String>,
        capacity: u32,
        capabilities: Capabilities,
        sender: Arc<dyn MessageSender>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            capabilities,
            sender,
            state: Mutex::new(RemoteState {
                capacity: capacity as usize,
                launched: 0,
                in_flight: HashMap::new(),
                notifiers: Vec::new(),
                closed: false,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    /// Jobs sent to the node and not yet answered.
    pub fn launched(&self) -> usize {
        self.lock().launched
    }

    /// Tell the node which function initialization to use.
    pub fn send_init(&self, function_init_id: i64) -> Result<(), WireError> {
        self.sender.send(&RemoteMessage::Init { function_init_id })
    }

    /// Route a message received from the node.
    pub fn handle_message(&self, message: RemoteMessage) {
        match message {
            RemoteMessage::Result { result } => {
                let (receiver, notifiers) = self.answered(&result.specification);
                match receiver {
                    Some(receiver) => receiver.job_completed(result),
                    None => debug!(node = %self.node_id, job_id = %result.specification, "result for unknown job"),
                }
                notify(notifiers);
            }
            RemoteMessage::Failure { job, message, completed } => {
                let (receiver, notifiers) = self.answered(&job);
                match receiver {
                    Some(receiver) => {
                        let failure = JobFailure::new(self.node_id.clone(), message).with_completed(completed);
                        receiver.job_failed(failure);
                    }
                    None => debug!(node = %self.node_id, job_id = %job, "failure for unknown job"),
                }
                notify(notifiers);
            }
            RemoteMessage::Ready { capacity, .. } => {
                let notifiers = {
                    let mut state = self.lock();
                    info!(node = %self.node_id, from = state.capacity, to = capacity, "node capacity changed");
                    state.capacity = capacity as usize;
                    if state.launched < state.capacity {
                        std::mem::take(&mut state.notifiers)
                    } else {
                        Vec::new()
                    }
                };
                notify(notifiers);
            }
            other => {
                warn!(node = %self.node_id, topic = other.topic(), "unexpected message from node");
            }
        }
    }

    /// Fail everything still in flight. The invoker refuses work afterwards.
    pub fn connection_lost(&self) {
        let in_flight: Vec<_> = {
            let mut state = self.lock();
            state.closed = true;
            state.launched = 0;
            state.notifiers.clear();
            state.in_flight.drain().collect()
        };
        if !in_flight.is_empty() {
            warn!(node = %self.node_id, jobs = in_flight.len(), "connection lost with jobs in flight");
        }
        for (_, receiver) in in_flight {
            receiver.job_failed(JobFailure::new(self.node_id.clone(), "connection lost"));
        }
    }

    fn answered(
        &self,
        job: &CalculationJobSpecification,
    ) -> (Option<Arc<dyn JobInvocationReceiver>>, Vec<AvailabilityNotifier>) {
        let mut state = self.lock();
        let receiver = state.in_flight.remove(job);
        if receiver.is_none() {
            return (None, Vec::new());
        }
        state.launched = state.launched.saturating_sub(1);
        (receiver, std::mem::take(&mut state.notifiers))
    }

    fn lock(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn notify(notifiers: Vec<AvailabilityNotifier>) {
    for notifier in notifiers {
        notifier.notify();
    }
}

#[async_trait]
impl JobInvoker for RemoteNodeJobInvoker {
    fn invoker_id(&self) -> &str {
        &self.node_id
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities.clone()
    }

    fn invoke(&self, job: &CalculationJob, receiver: Arc<dyn JobInvocationReceiver>) -> bool {
        let spec = job.specification.clone();
        {
            let mut state = self.lock();
            if state.closed || state.launched >= state.capacity {
                return false;
            }
            // An earlier run of the same job has not answered yet.
            if state.in_flight.contains_key(&spec) {
                return false;
            }
            state.launched += 1;
            state.in_flight.insert(spec.clone(), receiver);
        }

        if let Err(e) = self.sender.send(&RemoteMessage::Execute { job: job.clone() }) {
            warn!(node = %self.node_id, job_id = %spec, error = %e, "failed to send job");
            let mut state = self.lock();
            if state.in_flight.remove(&spec).is_some() {
                state.launched = state.launched.saturating_sub(1);
            }
            return false;
        }
        debug!(node = %self.node_id, job_id = %spec, "job sent");
        true
    }

    fn notify_when_available(&self, notifier: AvailabilityNotifier) -> bool {
        let mut state = self.lock();
        if !state.closed && state.launched < state.capacity {
            return true;
        }
        state.notifiers.push(notifier);
        false
    }

    /// Asks the node about the jobs and reports the connection state. The
    /// node answers with a failure for any job it no longer runs, which is
    /// routed like any other failure.
    async fn is_alive(&self, jobs: &[CalculationJobSpecification]) -> bool {
        if self.lock().closed || self.sender.is_closed() {
            return false;
        }
        if let Err(e) = self.sender.send(&RemoteMessage::IsAlive { jobs: jobs.to_vec() }) {
            warn!(node = %self.node_id, error = %e, "liveness query failed");
            return false;
        }
        true
    }

    /// Asks the node to interrupt the jobs and forgets them straight away.
    /// Their receivers are not called, and the slots are free for a retry of
    /// the same job. A late answer for a forgotten job is dropped.
    fn cancel(&self, jobs: &[CalculationJobSpecification]) {
        let notifiers = {
            let mut state = self.lock();
            let before = state.in_flight.len();
            for job in jobs {
                state.in_flight.remove(job);
            }
            let forgotten = before - state.in_flight.len();
            state.launched = state.launched.saturating_sub(forgotten);
            if forgotten > 0 && state.launched < state.capacity {
                std::mem::take(&mut state.notifiers)
            } else {
                Vec::new()
            }
        };
        if let Err(e) = self.sender.send(&RemoteMessage::Cancel { jobs: jobs.to_vec() }) {
            warn!(node = %self.node_id, error = %e, "failed to send cancel");
        }
        notify(notifiers);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use calcnode_core::{
        CacheSelectHint, CalculationJobItem, CalculationJobResult, CalculationJobResultItem,
        ComputationTargetSpecification, CycleId,
    };

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<RemoteMessage>>,
        closed: std::sync::atomic::AtomicBool,
    }

    impl MessageSender for RecordingSender {
        fn send(&self, message: &RemoteMessage) -> Result<(), WireError> {
            if self.is_closed() {
                return Err(WireError::Closed);
            }
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct Recorder {
        completed: AtomicUsize,
        failed: Mutex<Vec<JobFailure>>,
    }

    impl JobInvocationReceiver for Recorder {
        fn job_completed(&self, _result: CalculationJobResult) {
            self.completed.fetch_add(1, Ordering::SeqCst);
        }

        fn job_failed(&self, failure: JobFailure) {
            self.failed.lock().unwrap().push(failure);
        }
    }

    fn job(job_id: i64) -> CalculationJob {
        CalculationJob::new(
            CalculationJobSpecification::new(CycleId::new(), "Default", chrono::Utc::now(), job_id),
            1,
            None,
            vec![CalculationJobItem::new(
                "F",
                ComputationTargetSpecification::new("TRADE", "T1"),
                Vec::new(),
                Vec::new(),
            )],
            CacheSelectHint::AllShared,
        )
    }

    fn invoker(capacity: u32) -> (RemoteNodeJobInvoker, Arc<RecordingSender>) {
        let sender = Arc::new(RecordingSender::default());
        let invoker = RemoteNodeJobInvoker::new("remote-1", capacity, Capabilities::new(), sender.clone());
        (invoker, sender)
    }

    #[test]
    fn capacity_limits_launched_jobs() {
        let (invoker, sender) = invoker(1);
        let receiver = Arc::new(Recorder::default());
        let first = job(1);
        assert!(invoker.invoke(&first, receiver.clone()));
        assert!(!invoker.invoke(&job(2), receiver.clone()));
        assert_eq!(sender.sent.lock().unwrap().len(), 1);

        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        assert!(!invoker.notify_when_available(AvailabilityNotifier::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        })));

        let result = CalculationJobResult::new(
            first.specification.clone(),
            5,
            vec![CalculationJobResultItem::success()],
            "remote-1",
        );
        invoker.handle_message(RemoteMessage::Result { result });
        assert_eq!(receiver.completed.load(Ordering::SeqCst), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(invoker.launched(), 0);
    }

    #[test]
    fn failure_carries_completed_items() {
        let (invoker, _sender) = invoker(2);
        let receiver = Arc::new(Recorder::default());
        let job = job(1);
        assert!(invoker.invoke(&job, receiver.clone()));

        invoker.handle_message(RemoteMessage::Failure {
            job: job.specification.clone(),
            message: "interrupted".into(),
            completed: vec![CalculationJobResultItem::success()],
        });
        let failed = receiver.failed.lock().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].compute_node_id, "remote-1");
        assert_eq!(failed[0].completed.len(), 1);
    }

    #[test]
    fn connection_loss_fails_in_flight_jobs() {
        let (invoker, _sender) = invoker(2);
        let receiver = Arc::new(Recorder::default());
        assert!(invoker.invoke(&job(1), receiver.clone()));
        assert!(invoker.invoke(&job(2), receiver.clone()));

        invoker.connection_lost();
        assert_eq!(receiver.failed.lock().unwrap().len(), 2);
        assert!(!invoker.invoke(&job(3), receiver.clone()));
        assert!(!invoker.notify_when_available(AvailabilityNotifier::new(|| {})));
    }

    #[test]
    fn send_error_rolls_back() {
        let (invoker, sender) = invoker(1);
        sender.closed.store(true, Ordering::SeqCst);
        assert!(!invoker.invoke(&job(1), Arc::new(Recorder::default())));
        assert_eq!(invoker.launched(), 0);
    }

    #[test]
    fn ready_raises_capacity() {
        let (invoker, _sender) = invoker(0);
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        assert!(!invoker.notify_when_available(AvailabilityNotifier::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        })));
        invoker.handle_message(RemoteMessage::Ready {
            capacity: 3,
            node_id: "remote-1".into(),
            capabilities: Capabilities::new(),
        });
        assert_eq!(invoker.capacity(), 3);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancelled_job_can_be_sent_again() {
        let (invoker, sender) = invoker(1);
        let job = job(1);
        let spec = std::slice::from_ref(&job.specification);
        let first = Arc::new(Recorder::default());
        assert!(invoker.invoke(&job, first.clone()));

        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        assert!(!invoker.notify_when_available(AvailabilityNotifier::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        })));

        invoker.cancel(spec);
        assert_eq!(invoker.launched(), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(matches!(
            sender.sent.lock().unwrap().last(),
            Some(RemoteMessage::Cancel { .. })
        ));

        let retry = Arc::new(Recorder::default());
        assert!(invoker.invoke(&job, retry.clone()));
        assert_eq!(invoker.launched(), 1);

        let result = CalculationJobResult::new(
            job.specification.clone(),
            5,
            vec![CalculationJobResultItem::success()],
            "remote-1",
        );
        invoker.handle_message(RemoteMessage::Result { result });
        assert_eq!(retry.completed.load(Ordering::SeqCst), 1);
        assert_eq!(first.completed.load(Ordering::SeqCst), 0);
        assert!(first.failed.lock().unwrap().is_empty());
        assert_eq!(invoker.launched(), 0);
    }

    #[test]
    fn answer_after_cancel_is_dropped() {
        let (invoker, _sender) = invoker(2);
        let receiver = Arc::new(Recorder::default());
        let job = job(1);
        assert!(invoker.invoke(&job, receiver.clone()));
        invoker.cancel(std::slice::from_ref(&job.specification));

        invoker.handle_message(RemoteMessage::Failure {
            job: job.specification.clone(),
            message: "interrupted".into(),
            completed: Vec::new(),
        });
        assert!(receiver.failed.lock().unwrap().is_empty());
        assert_eq!(invoker.launched(), 0);
    }

    #[test]
    fn every_waiting_notifier_fires() {
        let (invoker, _sender) = invoker(1);
        let receiver = Arc::new(Recorder::default());
        let job = job(1);
        assert!(invoker.invoke(&job, receiver.clone()));

        let fired = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let f = fired.clone();
            assert!(!invoker.notify_when_available(AvailabilityNotifier::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            })));
        }
        invoker.handle_message(RemoteMessage::Failure {
            job: job.specification.clone(),
            message: "interrupted".into(),
            completed: Vec::new(),
        });
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn liveness_follows_connection() {
        let (invoker, sender) = invoker(1);
        let job = job(1);
        let spec = std::slice::from_ref(&job.specification);
        assert!(invoker.invoke(&job, Arc::new(Recorder::default())));
        assert!(invoker.is_alive(spec).await);
        assert!(matches!(
            sender.sent.lock().unwrap().last(),
            Some(RemoteMessage::IsAlive { .. })
        ));

        sender.closed.store(true, Ordering::SeqCst);
        assert!(!invoker.is_alive(spec).await);
    }
}
