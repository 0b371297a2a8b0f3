//! Wire protocol between the job dispatcher and remote calculation nodes.

pub mod codec;
pub mod connection;
pub mod error;
pub mod message;
pub mod protocol;
pub mod transport;
pub mod zmq;

pub use codec::{IdentifierDecoder, IdentifierEncoder};
pub use connection::{channel_pair, Connection, ConnectionReceiver, ConnectionSender, MessageSender};
pub use error::WireError;
pub use message::Message;
pub use protocol::{topics, Capabilities, RemoteMessage};
pub use transport::Transport;
pub use zmq::{PeerId, ZmqNodeListener};
