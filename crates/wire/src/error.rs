use thiserror::Error;

use calcnode_core::CoreError;

/// Errors raised while encoding, decoding or moving remote node messages.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("zeromq error: {0}")]
    Zmq(#[from] zeromq::ZmqError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("unknown message topic: {0}")]
    UnknownTopic(String),

    #[error("unsupported message version {0}")]
    UnsupportedVersion(u16),

    #[error("identifier error: {0}")]
    Identifier(#[from] CoreError),

    #[error("connection closed")]
    Closed,
}
