//! ZeroMQ connections to remote calculation nodes.
//!
//! The dispatcher binds a ROUTER socket ([`ZmqNodeListener`]); every node
//! connects a DEALER socket ([`connect`]). Each distinct peer identity seen by
//! the ROUTER becomes its own [`Connection`].
//!
//! ## Framing (zeromq-rs 0.4)
//!
//! - DEALER sends / receives: `[topic, envelope]`
//! - ROUTER receives / sends: `[identity, topic, envelope]`

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use zeromq::prelude::*;
use zeromq::{DealerSocket, RouterSocket, ZmqMessage};

use calcnode_core::IdentifierMap;

use crate::connection::{Connection, ConnectionReceiver, ConnectionSender};
use crate::error::WireError;
use crate::message::Message;
use crate::transport::Transport;

/// ZeroMQ routing identity of a connected node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerId(Vec<u8>);

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Turn `[topic, envelope]` frames (after any identity) into a message.
fn decode_frames<'a>(frames: impl Iterator<Item = &'a [u8]>) -> Result<Message, WireError> {
    let data: Vec<&[u8]> = frames.skip_while(|f| f.is_empty()).collect();
    if data.len() < 2 {
        return Err(WireError::Transport(format!(
            "expected [topic, envelope], got {} data frames",
            data.len()
        )));
    }
    Ok(Message::from_bytes(data[1])?)
}

fn encode_frames(msg: &Message) -> Result<ZmqMessage, WireError> {
    let mut zmq_msg = ZmqMessage::from(msg.topic.as_str());
    zmq_msg.push_back(msg.to_bytes()?.into());
    Ok(zmq_msg)
}

/// ROUTER socket accepting node connections.
pub struct ZmqNodeListener {
    incoming: mpsc::UnboundedReceiver<(PeerId, Connection)>,
    _loop_handle: tokio::task::JoinHandle<()>,
}

impl ZmqNodeListener {
    #[instrument(skip_all, fields(endpoint = %transport))]
    pub async fn bind(
        transport: &Transport,
        identifiers: Arc<dyn IdentifierMap>,
    ) -> Result<Self, WireError> {
        transport
            .ensure_ipc_dir()
            .map_err(|e| WireError::Transport(e.to_string()))?;
        transport
            .remove_stale_socket()
            .map_err(|e| WireError::Transport(e.to_string()))?;
        let mut socket = RouterSocket::new();
        let endpoint = transport.endpoint();
        info!(endpoint = %endpoint, "binding ROUTER socket");
        socket.bind(&endpoint).await?;

        let (incoming_tx, incoming) = mpsc::unbounded_channel();
        let loop_handle = tokio::spawn(Self::event_loop(socket, identifiers, incoming_tx));
        Ok(Self {
            incoming,
            _loop_handle: loop_handle,
        })
    }

    /// Wait for the next node to send its first message.
    pub async fn accept(&mut self) -> Option<(PeerId, Connection)> {
        self.incoming.recv().await
    }

    async fn event_loop(
        mut socket: RouterSocket,
        identifiers: Arc<dyn IdentifierMap>,
        incoming_tx: mpsc::UnboundedSender<(PeerId, Connection)>,
    ) {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<(PeerId, Message)>();
        let mut peers: HashMap<PeerId, mpsc::UnboundedSender<Message>> = HashMap::new();

        loop {
            tokio::select! {
                Some((peer, msg)) = out_rx.recv() => {
                    let mut zmq_msg = match encode_frames(&msg) {
                        Ok(frames) => frames,
                        Err(e) => {
                            warn!(peer = %peer, error = %e, "failed to encode frames");
                            continue;
                        }
                    };
                    zmq_msg.push_front(peer.0.clone().into());
                    if let Err(e) = socket.send(zmq_msg).await {
                        warn!(peer = %peer, error = %e, "ROUTER send failed");
                    }
                }
                result = socket.recv() => {
                    let zmq_msg = match result {
                        Ok(m) => m,
                        Err(e) => {
                            debug!(error = %e, "ROUTER recv loop ending");
                            break;
                        }
                    };
                    let mut frames = zmq_msg.iter().map(|f| f.as_ref());
                    let Some(identity) = frames.next() else {
                        continue;
                    };
                    let peer = PeerId(identity.to_vec());
                    let msg = match decode_frames(frames) {
                        Ok(m) => m,
                        Err(e) => {
                            warn!(peer = %peer, error = %e, "dropping malformed frames");
                            continue;
                        }
                    };

                    if !peers.contains_key(&peer) {
                        let connection = Self::open_peer(&peer, &identifiers, &out_tx, &mut peers);
                        info!(peer = %peer, "node connected");
                        if incoming_tx.send((peer.clone(), connection)).is_err() {
                            debug!("listener dropped, stopping ROUTER loop");
                            break;
                        }
                    }
                    if let Some(tx) = peers.get(&peer) {
                        if tx.send(msg).is_err() {
                            debug!(peer = %peer, "peer connection dropped");
                            peers.remove(&peer);
                        }
                    }
                }
            }
        }
    }

    fn open_peer(
        peer: &PeerId,
        identifiers: &Arc<dyn IdentifierMap>,
        out_tx: &mpsc::UnboundedSender<(PeerId, Message)>,
        peers: &mut HashMap<PeerId, mpsc::UnboundedSender<Message>>,
    ) -> Connection {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (peer_out_tx, mut peer_out_rx) = mpsc::unbounded_channel::<Message>();
        peers.insert(peer.clone(), in_tx);

        let out_tx = out_tx.clone();
        let tagged = peer.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = peer_out_rx.recv() => match msg {
                        Some(msg) => {
                            if out_tx.send((tagged.clone(), msg)).is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = out_tx.closed() => break,
                }
            }
        });

        Connection {
            sender: Arc::new(ConnectionSender::new(identifiers.clone(), peer_out_tx)),
            receiver: ConnectionReceiver::new(identifiers.clone(), in_rx),
        }
    }
}

/// Connect a DEALER socket to the dispatcher's ROUTER.
#[instrument(skip_all, fields(endpoint = %transport))]
pub async fn connect(
    transport: &Transport,
    identifiers: Arc<dyn IdentifierMap>,
) -> Result<Connection, WireError> {
    let mut socket = DealerSocket::new();
    let endpoint = transport.endpoint();
    info!(endpoint = %endpoint, "connecting DEALER socket");
    socket.connect(&endpoint).await?;

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<Message>();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(msg) = out_rx.recv() => {
                    match encode_frames(&msg) {
                        Ok(frames) => {
                            if let Err(e) = socket.send(frames).await {
                                warn!(error = %e, "DEALER send failed");
                            }
                        }
                        Err(e) => warn!(error = %e, "failed to encode frames"),
                    }
                }
                result = socket.recv() => {
                    match result {
                        Ok(zmq_msg) => match decode_frames(zmq_msg.iter().map(|f| f.as_ref())) {
                            Ok(msg) => {
                                if in_tx.send(msg).is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!(error = %e, "dropping malformed frames"),
                        },
                        Err(e) => {
                            debug!(error = %e, "DEALER recv loop ending");
                            break;
                        }
                    }
                }
                else => break,
            }
        }
    });

    Ok(Connection {
        sender: Arc::new(ConnectionSender::new(identifiers.clone(), out_tx)),
        receiver: ConnectionReceiver::new(identifiers, in_rx),
    })
}
