use thiserror::Error;

use calcnode_core::CoreError;
use calcnode_wire::WireError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("no tokio runtime available: {0}")]
    Runtime(#[from] tokio::runtime::TryCurrentError),

    #[error("thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("remote node handshake failed: {0}")]
    Handshake(String),
}
