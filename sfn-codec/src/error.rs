//! Codec error types.

use thiserror::Error;

/// Errors raised while encoding or decoding TLV data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("buffer insufficient: input ended inside a value")]
    BufferInsufficient,

    #[error("buffer too small: need at least {needed} bytes, got {available}")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("declared length {declared} exceeds remaining {remaining} bytes")]
    LengthExceedsBuffer { declared: usize, remaining: usize },

    #[error("invalid length: {0}")]
    InvalidLength(i64),

    #[error("value overflows target type")]
    Overflow,

    #[error("expected a primitive packet, found tag {0:#04x}")]
    NotAPrimitive(u8),

    #[error("expected a node packet, found tag {0:#04x}")]
    NotANode(u8),

    #[error("not a sequence: tag {0:#04x}")]
    NotASequence(u8),

    #[error("invalid UTF-8 in string value")]
    InvalidUtf8,

    #[error("invalid bool encoding: {0:?}")]
    InvalidBool(Vec<u8>),

    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),

    #[error("nesting deeper than {0} levels")]
    TooDeep(usize),

    #[error("invalid signal id {0}: signals use ids 2-15")]
    InvalidSignalId(u8),
}
