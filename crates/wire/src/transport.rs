use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::WireError;

/// Where the dispatcher listens for remote calculation nodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "address")]
pub enum Transport {
    /// Unix domain socket path, for nodes on the same host.
    Ipc(String),

    Tcp { host: String, port: u16 },
}

impl Transport {
    /// IPC transport under `/tmp/calcnode/<name>.sock`.
    pub fn ipc(name: &str) -> Self {
        Self::Ipc(format!("/tmp/calcnode/{name}.sock"))
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Parse a `tcp://host:port` or `ipc://path` endpoint string.
    pub fn parse(endpoint: &str) -> Result<Self, WireError> {
        if let Some(path) = endpoint.strip_prefix("ipc://") {
            if path.is_empty() {
                return Err(WireError::InvalidEndpoint(endpoint.to_string()));
            }
            return Ok(Self::Ipc(path.to_string()));
        }
        if let Some(addr) = endpoint.strip_prefix("tcp://") {
            let (host, port) = addr
                .rsplit_once(':')
                .ok_or_else(|| WireError::InvalidEndpoint(endpoint.to_string()))?;
            let port = port
                .parse::<u16>()
                .map_err(|_| WireError::InvalidEndpoint(endpoint.to_string()))?;
            if host.is_empty() {
                return Err(WireError::InvalidEndpoint(endpoint.to_string()));
            }
            return Ok(Self::tcp(host, port));
        }
        Err(WireError::InvalidEndpoint(endpoint.to_string()))
    }

    pub fn endpoint(&self) -> String {
        match self {
            Self::Ipc(path) => format!("ipc://{path}"),
            Self::Tcp { host, port } => format!("tcp://{host}:{port}"),
        }
    }

    /// Create the socket directory of an IPC transport. No-op for TCP.
    pub fn ensure_ipc_dir(&self) -> std::io::Result<()> {
        if let Self::Ipc(path) = self {
            if let Some(parent) = Path::new(path).parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    /// Remove a socket file left behind by a previous process. No-op for TCP.
    pub fn remove_stale_socket(&self) -> std::io::Result<()> {
        if let Self::Ipc(path) = self {
            match std::fs::remove_file(path) {
                Ok(()) => tracing::debug!(path, "removed stale IPC socket"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.endpoint())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipc_endpoint() {
        assert_eq!(
            Transport::ipc("dispatcher").endpoint(),
            "ipc:///tmp/calcnode/dispatcher.sock"
        );
    }

    #[test]
    fn parse_tcp_and_ipc() {
        assert_eq!(
            Transport::parse("tcp://127.0.0.1:5590").unwrap(),
            Transport::tcp("127.0.0.1", 5590)
        );
        assert_eq!(
            Transport::parse("ipc:///tmp/x.sock").unwrap(),
            Transport::Ipc("/tmp/x.sock".into())
        );
    }

    #[test]
    fn parse_rejects_other_schemes() {
        assert!(Transport::parse("http://localhost:80").is_err());
        assert!(Transport::parse("tcp://localhost").is_err());
        assert!(Transport::parse("tcp://:80").is_err());
        assert!(Transport::parse("ipc://").is_err());
    }

    #[test]
    fn display_matches_endpoint() {
        let t = Transport::tcp("localhost", 9090);
        assert_eq!(t.to_string(), t.endpoint());
    }
}
