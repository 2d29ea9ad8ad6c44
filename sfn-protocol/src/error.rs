//! Protocol error types.

use sfn_codec::CodecError;
use thiserror::Error;

/// Errors raised while building, parsing or reading frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("unknown frame type: {0:#04x}")]
    UnknownFrameType(u8),

    #[error("unexpected frame: expected {expected}, got {actual}")]
    UnexpectedFrame {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid data tag {0:#04x}: data tags must be below 0x80")]
    InvalidDataTag(u8),

    #[error("invalid client type: {0:#04x}")]
    InvalidClientType(u8),

    #[error("invalid auth type: {0}")]
    InvalidAuthType(u8),

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("corrupt stream: {0}")]
    CorruptStream(CodecError),

    #[error("stream ended inside a frame")]
    UnexpectedEof,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Returns whether the byte stream can no longer be trusted.
    ///
    /// Non-fatal errors concern a single frame whose bytes have already been
    /// consumed; the next read starts cleanly at a frame boundary.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::FrameTooLarge { .. }
                | ProtocolError::CorruptStream(_)
                | ProtocolError::UnexpectedEof
                | ProtocolError::Io(_)
        )
    }
}
