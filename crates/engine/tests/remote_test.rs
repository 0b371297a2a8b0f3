//! Remote calculation nodes over in-process and ZeroMQ connections.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use calcnode_core::{
    CacheSelectHint, CalculationJob, CalculationJobItem, CalculationJobResult,
    CalculationJobSpecification, ComputationTargetSpecification, ComputedValue, CycleId,
    InMemoryIdentifierMap, InMemoryViewComputationCacheSource, ValueSpecification,
};
use calcnode_engine::node::from_fn;
use calcnode_engine::{
    CalculationNode, DispatcherConfig, InMemoryFunctionRepository, JobDispatcher, JobInvoker,
    LocalNodeJobInvoker, RemoteNodeClient, RemoteNodeServer, SimpleCalculationNode,
};
use calcnode_wire::zmq::{connect, ZmqNodeListener};
use calcnode_wire::{channel_pair, MessageSender, RemoteMessage, Transport};

const TIMEOUT: Duration = Duration::from_secs(10);
const SETTLE: Duration = Duration::from_millis(200);

fn vs(name: &str) -> ValueSpecification {
    ValueSpecification::new(name, ComputationTargetSpecification::new("TRADE", "T1"))
}

fn curve_job(job_id: i64) -> CalculationJob {
    CalculationJob::new(
        CalculationJobSpecification::new(CycleId::new(), "Default", chrono::Utc::now(), job_id),
        1,
        None,
        vec![CalculationJobItem::new(
            "Curve",
            ComputationTargetSpecification::new("TRADE", "T1"),
            Vec::new(),
            [vs("Curve")],
        )],
        CacheSelectHint::AllShared,
    )
}

fn worker(prefix: &str, nodes: usize) -> Arc<LocalNodeJobInvoker> {
    let cache = Arc::new(InMemoryViewComputationCacheSource::new());
    let functions = Arc::new(InMemoryFunctionRepository::new().with_function(
        "Curve",
        from_fn(|ctx, _| {
            Ok(ctx
                .desired_outputs
                .iter()
                .map(|spec| ComputedValue::new(spec.clone(), serde_json::json!(1.0)))
                .collect())
        }),
    ));
    let nodes = (0..nodes)
        .map(|n| {
            Arc::new(SimpleCalculationNode::new(format!("{prefix}-{n}"), cache.clone(), functions.clone()))
                as Arc<dyn CalculationNode>
        })
        .collect();
    Arc::new(LocalNodeJobInvoker::new(prefix, nodes).unwrap())
}

fn ids() -> Arc<InMemoryIdentifierMap> {
    Arc::new(InMemoryIdentifierMap::new())
}

async fn dispatch(dispatcher: &JobDispatcher, job: CalculationJob) -> CalculationJobResult {
    let (tx, mut rx) = mpsc::unbounded_channel();
    dispatcher.dispatch_job(
        job,
        Arc::new(move |result: CalculationJobResult| {
            let _ = tx.send(result);
        }),
    );
    tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap()
}

async fn wait_until(cond: impl Fn() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test(flavor = "multi_thread")]
async fn job_runs_on_channel_connected_node() {
    let dispatcher = JobDispatcher::new(DispatcherConfig::default()).unwrap();
    let server = RemoteNodeServer::new(dispatcher.clone(), 7);
    let (dispatcher_end, node_end) = channel_pair(ids(), ids());
    server.accept_connection(dispatcher_end);

    let client = Arc::new(RemoteNodeClient::new(worker("remote", 2)));
    let shutdown = CancellationToken::new();
    let running = {
        let client = client.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { client.run(node_end, shutdown).await })
    };

    wait_until(|| server.connected_nodes() == 1).await;
    wait_until(|| client.function_init_id() == 7).await;
    assert_eq!(dispatcher.invoker_count(), 1);

    let result = dispatch(&dispatcher, curve_job(1)).await;
    assert_eq!(result.successful_count(), 1);
    assert!(result.compute_node_id.starts_with("remote-"));

    server.set_function_init_id(8);
    wait_until(|| client.function_init_id() == 8).await;

    shutdown.cancel();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn unknown_job_is_reported_not_alive() {
    let (dispatcher_end, node_end) = channel_pair(ids(), ids());
    let client = Arc::new(RemoteNodeClient::new(worker("remote", 1)));
    let shutdown = CancellationToken::new();
    let running = {
        let client = client.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { client.run(node_end, shutdown).await })
    };

    let (tx, mut rx) = dispatcher_end.split();
    let ready = tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert!(matches!(ready, RemoteMessage::Ready { capacity: 1, .. }));

    let unknown = curve_job(42).specification;
    tx.send(&RemoteMessage::IsAlive { jobs: vec![unknown.clone()] }).unwrap();
    match tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap() {
        RemoteMessage::Failure { job, completed, .. } => {
            assert_eq!(job, unknown);
            assert!(completed.is_empty());
        }
        other => panic!("expected failure, got {other:?}"),
    }

    shutdown.cancel();
    running.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_run_stays_silent_while_its_retry_answers() {
    let cache = Arc::new(InMemoryViewComputationCacheSource::new());
    let functions = Arc::new(InMemoryFunctionRepository::new().with_function(
        "Curve",
        from_fn(|ctx, _| {
            std::thread::sleep(Duration::from_millis(200));
            Ok(ctx
                .desired_outputs
                .iter()
                .map(|spec| ComputedValue::new(spec.clone(), serde_json::json!(1.0)))
                .collect())
        }),
    ));
    let nodes = (0..2)
        .map(|n| {
            Arc::new(SimpleCalculationNode::new(format!("slow-{n}"), cache.clone(), functions.clone()))
                as Arc<dyn CalculationNode>
        })
        .collect();
    let client = Arc::new(RemoteNodeClient::new(Arc::new(LocalNodeJobInvoker::new("slow", nodes).unwrap())));

    let (dispatcher_end, node_end) = channel_pair(ids(), ids());
    let shutdown = CancellationToken::new();
    let running = {
        let client = client.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { client.run(node_end, shutdown).await })
    };
    let (tx, mut rx) = dispatcher_end.split();
    let ready = tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert!(matches!(ready, RemoteMessage::Ready { capacity: 2, .. }));

    let job = curve_job(5);
    tx.send(&RemoteMessage::Execute { job: job.clone() }).unwrap();
    tx.send(&RemoteMessage::Cancel { jobs: vec![job.specification.clone()] }).unwrap();
    tx.send(&RemoteMessage::Execute { job: job.clone() }).unwrap();

    match tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap() {
        RemoteMessage::Result { result } => {
            assert_eq!(result.specification, job.specification);
            assert_eq!(result.compute_node_id, "slow-0");
        }
        other => panic!("expected result, got {other:?}"),
    }
    let extra = tokio::time::timeout(Duration::from_millis(400), rx.recv()).await;
    assert!(extra.is_err(), "cancelled run answered");

    shutdown.cancel();
    running.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn lost_node_jobs_move_to_another_invoker() {
    let dispatcher = JobDispatcher::new(DispatcherConfig::default()).unwrap();
    let server = RemoteNodeServer::new(dispatcher.clone(), 1);
    let (dispatcher_end, node_end) = channel_pair(ids(), ids());
    server.accept_connection(dispatcher_end);

    // Act as a node that takes a job and then disappears.
    let (node_tx, mut node_rx) = node_end.split();
    node_tx
        .send(&RemoteMessage::Ready {
            capacity: 1,
            node_id: "flaky".into(),
            capabilities: Default::default(),
        })
        .unwrap();
    let init = tokio::time::timeout(TIMEOUT, node_rx.recv()).await.unwrap().unwrap();
    assert_eq!(init, RemoteMessage::Init { function_init_id: 1 });
    wait_until(|| dispatcher.invoker_count() == 1).await;

    let (tx, mut results) = mpsc::unbounded_channel();
    dispatcher.dispatch_job(
        curve_job(1),
        Arc::new(move |result: CalculationJobResult| {
            let _ = tx.send(result);
        }),
    );
    let execute = tokio::time::timeout(TIMEOUT, node_rx.recv()).await.unwrap().unwrap();
    assert!(matches!(execute, RemoteMessage::Execute { .. }));

    dispatcher.register_job_invoker(worker("local", 1) as Arc<dyn JobInvoker>);
    drop(node_tx);
    drop(node_rx);

    let result = tokio::time::timeout(TIMEOUT, results.recv()).await.unwrap().unwrap();
    assert_eq!(result.successful_count(), 1);
    assert_eq!(result.compute_node_id, "local-0");
    wait_until(|| server.connected_nodes() == 0).await;
    assert_eq!(dispatcher.invoker_count(), 1);
    assert_eq!(dispatcher.metrics().failed_attempts, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn job_runs_on_zmq_connected_node() {
    let transport = Transport::tcp("127.0.0.1", 16620);
    let dispatcher = JobDispatcher::new(DispatcherConfig::default()).unwrap();
    let server = RemoteNodeServer::new(dispatcher.clone(), 3);
    let shutdown = CancellationToken::new();

    let listener = ZmqNodeListener::bind(&transport, ids()).await.unwrap();
    let serving = {
        let server = server.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { server.serve_zmq(listener, shutdown).await })
    };
    tokio::time::sleep(SETTLE).await;

    let connection = connect(&transport, ids()).await.unwrap();
    tokio::time::sleep(SETTLE).await;
    let client = Arc::new(RemoteNodeClient::new(worker("zmq", 1)));
    let running = {
        let client = client.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { client.run(connection, shutdown).await })
    };

    wait_until(|| dispatcher.invoker_count() == 1).await;
    for job_id in 1..=3 {
        let result = dispatch(&dispatcher, curve_job(job_id)).await;
        assert_eq!(result.successful_count(), 1);
        assert_eq!(result.compute_node_id, "zmq-0");
    }
    assert_eq!(client.function_init_id(), 3);

    shutdown.cancel();
    serving.await.unwrap();
    running.await.unwrap().unwrap();
}
