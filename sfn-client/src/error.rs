//! Client error types.

use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] sfn_protocol::ProtocolError),

    #[error("connect failed: {0}")]
    Connect(#[from] quinn::ConnectError),

    #[error("connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("write failed: {0}")]
    Write(#[from] quinn::WriteError),

    #[error("cannot resolve address '{0}'")]
    Resolve(String),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("timed out")]
    Timeout,

    #[error("handshake rejected by server")]
    Rejected,

    #[error("unexpected {0} frame during handshake")]
    UnexpectedFrame(&'static str),

    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),
}

impl ClientError {
    /// Returns whether a new connect attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_)
                | ClientError::Connection(_)
                | ClientError::Write(_)
                | ClientError::Timeout
                | ClientError::ConnectionClosed
        )
    }
}
