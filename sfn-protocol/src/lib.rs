//! # sfn-protocol
//!
//! Frame protocol for sfn, layered on the TLV codec.
//!
//! This crate provides:
//! - Handshake, Data, Accepted and Rejected frames as TLV node layouts
//! - Leading-byte frame dispatch
//! - An async frame reader that re-assembles frames from a byte stream
//! - Peer roles, authentication kinds and connection states

pub mod error;
pub mod frame;
pub mod reader;
pub mod types;

pub use error::ProtocolError;
pub use frame::{
    decode_to_accepted_frame, decode_to_data_frame, decode_to_handshake_frame,
    decode_to_meta_frame, decode_to_payload_frame, decode_to_rejected_frame, parse_frame,
    AcceptedFrame, DataFrame, Frame, FrameType, HandshakeFrame, MetaFrame, PayloadFrame,
    RejectedFrame,
};
pub use reader::FrameReader;
pub use types::{AuthType, ClientType, ConnectionState};

/// ALPN identifier negotiated on every sfn QUIC connection.
pub const ALPN: &[u8] = b"sfn";

/// Default processor port.
pub const DEFAULT_PORT: u16 = 9000;

/// Maximum encoded frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
