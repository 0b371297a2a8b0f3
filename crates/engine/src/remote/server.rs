use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use calcnode_wire::{Connection, ConnectionReceiver, MessageSender, RemoteMessage, ZmqNodeListener};

use crate::dispatcher::{InvokerId, JobDispatcher};
use crate::error::EngineError;
use crate::invoker::JobInvoker;

use super::invoker::RemoteNodeJobInvoker;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

type Nodes = Arc<Mutex<HashMap<InvokerId, Arc<RemoteNodeJobInvoker>>>>;

/// Accepts connections from remote calculation nodes and registers each one
/// with the dispatcher for as long as it stays connected.
#[derive(Clone)]
pub struct RemoteNodeServer {
    dispatcher: JobDispatcher,
    function_init_id: Arc<AtomicI64>,
    nodes: Nodes,
}

impl RemoteNodeServer {
    pub fn new(dispatcher: JobDispatcher, function_init_id: i64) -> Self {
        Self {
            dispatcher,
            function_init_id: Arc::new(AtomicI64::new(function_init_id)),
            nodes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Nodes that completed the handshake and are still connected.
    pub fn connected_nodes(&self) -> usize {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Switch every connected node, and nodes connecting later, to a new
    /// function initialization.
    pub fn set_function_init_id(&self, function_init_id: i64) {
        self.function_init_id.store(function_init_id, Ordering::SeqCst);
        let nodes: Vec<_> = self
            .nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for node in nodes {
            if let Err(e) = node.send_init(function_init_id) {
                warn!(node = node.invoker_id(), error = %e, "failed to send function initialization");
            }
        }
    }

    /// Serve one connection until it closes.
    pub fn accept_connection(&self, connection: Connection) -> JoinHandle<()> {
        let server = self.clone();
        tokio::spawn(async move {
            let (sender, receiver) = connection.split();
            if let Err(e) = server.serve_connection(sender, receiver).await {
                warn!(error = %e, "remote node connection ended with error");
            }
        })
    }

    /// Accept nodes from a ZeroMQ listener until `shutdown` fires.
    #[instrument(skip_all)]
    pub async fn serve_zmq(&self, mut listener: ZmqNodeListener, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("remote node server shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Some((peer, connection)) => {
                        info!(peer = %peer, "remote node connected");
                        self.accept_connection(connection);
                    }
                    None => {
                        warn!("listener closed");
                        break;
                    }
                },
            }
        }
    }

    async fn serve_connection(
        &self,
        sender: Arc<dyn MessageSender>,
        mut receiver: ConnectionReceiver,
    ) -> Result<(), EngineError> {
        let invoker = Arc::new(handshake(sender, &mut receiver).await?);
        invoker.send_init(self.function_init_id.load(Ordering::SeqCst))?;

        let id = self.dispatcher.register_job_invoker(invoker.clone());
        self.nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, invoker.clone());
        info!(
            node = invoker.invoker_id(),
            invoker = %id,
            capacity = invoker.capacity(),
            "remote node registered"
        );

        while let Some(message) = receiver.recv().await {
            invoker.handle_message(message);
        }

        info!(node = invoker.invoker_id(), invoker = %id, "remote node disconnected");
        self.nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        self.dispatcher.remove_job_invoker(id);
        invoker.connection_lost();
        Ok(())
    }
}

/// Wait for the node's `Ready` message.
async fn handshake(
    sender: Arc<dyn MessageSender>,
    receiver: &mut ConnectionReceiver,
) -> Result<RemoteNodeJobInvoker, EngineError> {
    let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, receiver.recv())
        .await
        .map_err(|_| EngineError::Handshake("no ready message from node".into()))?
        .ok_or_else(|| EngineError::Handshake("connection closed before ready".into()))?;
    match first {
        RemoteMessage::Ready {
            capacity,
            node_id,
            capabilities,
        } => {
            debug!(node = %node_id, capacity, ?capabilities, "node ready");
            Ok(RemoteNodeJobInvoker::new(node_id, capacity, capabilities, sender))
        }
        other => Err(EngineError::Handshake(format!(
            "expected ready, got {}",
            other.topic()
        ))),
    }
}
