//! Server error types.

use crate::config::ConfigError;
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] sfn_protocol::ProtocolError),

    #[error("workflow error: {0}")]
    Core(#[from] sfn_core::CoreError),

    #[error("downstream error: {0}")]
    Client(#[from] sfn_client::ClientError),

    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("write failed: {0}")]
    Write(#[from] quinn::WriteError),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("peer '{0}' disconnected")]
    PeerClosed(String),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("server shutting down")]
    ShuttingDown,

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl ServerError {
    /// Returns whether the failed operation may succeed if attempted again.
    pub fn is_retryable(&self) -> bool {
        match self {
            ServerError::Io(_)
            | ServerError::Connection(_)
            | ServerError::Write(_)
            | ServerError::HandshakeTimeout => true,
            ServerError::Client(e) => e.is_retryable(),
            _ => false,
        }
    }
}
