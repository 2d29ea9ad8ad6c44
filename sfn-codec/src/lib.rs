//! # sfn-codec
//!
//! Self-describing tag/length/value encoding used for every sfn message.
//!
//! This crate provides:
//! - Variable-length integer and float encodings (P- and N-flavors)
//! - Primitive and node packets with recursive decoding
//! - Typed values, homogeneous sequences and field-tagged records
//! - Signal annotations and a pull-based observe decoder

pub mod error;
pub mod observe;
pub mod packet;
pub mod record;
pub mod tag;
pub mod value;
pub mod varint;

pub use error::CodecError;
pub use observe::ObserveDecoder;
pub use packet::{peek_packet_len, NodeEncoder, NodePacket, Packet, PrimitivePacket};
pub use record::{marshal_with_signals, signals, Record, RecordSchema, RecordSchemaBuilder, Signal};
pub use tag::Tag;
pub use value::{marshal, unmarshal, TlvValue};

/// Maximum nesting depth accepted when decoding node packets.
pub const MAX_NESTING_DEPTH: usize = 64;
