use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use calcnode_core::IdentifierMap;

use crate::codec::{IdentifierDecoder, IdentifierEncoder};
use crate::error::WireError;
use crate::message::Message;
use crate::protocol::RemoteMessage;

/// Outbound side of a connection to a peer.
///
/// `send` never blocks, so it can be called from inside invoker callbacks.
pub trait MessageSender: Send + Sync {
    fn send(&self, message: &RemoteMessage) -> Result<(), WireError>;

    fn is_closed(&self) -> bool;
}

/// Encodes messages with the connection's identifier state and queues them
/// for the socket loop (or the peer, for an in-process connection).
pub struct ConnectionSender {
    encoder: Mutex<IdentifierEncoder>,
    frames: mpsc::UnboundedSender<Message>,
}

impl ConnectionSender {
    pub fn new(identifiers: Arc<dyn IdentifierMap>, frames: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            encoder: Mutex::new(IdentifierEncoder::new(identifiers)),
            frames,
        }
    }
}

impl MessageSender for ConnectionSender {
    fn send(&self, message: &RemoteMessage) -> Result<(), WireError> {
        // Encode and enqueue under one lock so definitions reach the peer
        // before any message that relies on them.
        let mut encoder = self.encoder.lock().unwrap_or_else(PoisonError::into_inner);
        let msg = encoder.encode(message)?;
        self.frames.send(msg).map_err(|_| WireError::Closed)
    }

    fn is_closed(&self) -> bool {
        self.frames.is_closed()
    }
}

/// Inbound side of a connection.
pub struct ConnectionReceiver {
    decoder: IdentifierDecoder,
    frames: mpsc::UnboundedReceiver<Message>,
}

impl ConnectionReceiver {
    pub fn new(identifiers: Arc<dyn IdentifierMap>, frames: mpsc::UnboundedReceiver<Message>) -> Self {
        Self {
            decoder: IdentifierDecoder::new(identifiers),
            frames,
        }
    }

    /// Next decoded message, or `None` once the peer is gone.
    ///
    /// Messages that fail to decode are logged and skipped.
    pub async fn recv(&mut self) -> Option<RemoteMessage> {
        loop {
            let msg = self.frames.recv().await?;
            match self.decoder.decode(&msg) {
                Ok(decoded) => {
                    debug!(topic = %msg.topic, sent_at = %msg.sent_at, "received message");
                    return Some(decoded);
                }
                Err(e) => {
                    warn!(topic = %msg.topic, error = %e, "dropping undecodable message");
                }
            }
        }
    }
}

/// Both halves of a connection.
pub struct Connection {
    pub sender: Arc<ConnectionSender>,
    pub receiver: ConnectionReceiver,
}

impl Connection {
    pub fn split(self) -> (Arc<ConnectionSender>, ConnectionReceiver) {
        (self.sender, self.receiver)
    }
}

/// Two in-process connection ends wired to each other.
///
/// Messages still pass through the codec on both ends.
pub fn channel_pair(
    left_identifiers: Arc<dyn IdentifierMap>,
    right_identifiers: Arc<dyn IdentifierMap>,
) -> (Connection, Connection) {
    let (left_tx, right_rx) = mpsc::unbounded_channel();
    let (right_tx, left_rx) = mpsc::unbounded_channel();
    let left = Connection {
        sender: Arc::new(ConnectionSender::new(left_identifiers.clone(), left_tx)),
        receiver: ConnectionReceiver::new(left_identifiers, left_rx),
    };
    let right = Connection {
        sender: Arc::new(ConnectionSender::new(right_identifiers.clone(), right_tx)),
        receiver: ConnectionReceiver::new(right_identifiers, right_rx),
    };
    (left, right)
}
