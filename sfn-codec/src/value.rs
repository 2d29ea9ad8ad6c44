//! Typed values over TLV packets.
//!
//! Scalars map to primitive packets:
//!
//! | Type                     | Value bytes                    |
//! |--------------------------|--------------------------------|
//! | `i32` `i64` `u32` `u64`  | P-encoded varint               |
//! | `f32` `f64`              | N-encoded float                |
//! | `bool`                   | one byte, `0x00` or `0x01`     |
//! | `String`                 | UTF-8                          |
//! | `Bytes`                  | raw                            |
//!
//! `Vec<T>` maps to a slice node whose children all carry sequence id 0.
//! Records map to plain nodes (see [`crate::record`]).

use crate::error::CodecError;
use crate::packet::{NodePacket, Packet, PrimitivePacket};
use crate::varint::{
    decode_nvarfloat_f32, decode_nvarfloat_f64, decode_pvarint_i32, decode_pvarint_i64,
    decode_pvarint_u32, decode_pvarint_u64, encode_nvarfloat_f32, encode_nvarfloat_f64,
    encode_pvarint_i32, encode_pvarint_i64, encode_pvarint_u32, encode_pvarint_u64,
};
use bytes::{Bytes, BytesMut};

/// A value that converts to and from a TLV packet.
pub trait TlvValue: Sized {
    /// Builds the packet for this value under `tag`.
    fn to_packet(&self, tag: u8) -> Packet;

    /// Reads a value back from a decoded packet.
    fn from_packet(packet: &Packet) -> Result<Self, CodecError>;
}

fn primitive_value(packet: &Packet) -> Result<&Bytes, CodecError> {
    match packet {
        Packet::Primitive(p) => Ok(p.value()),
        Packet::Node(n) => Err(CodecError::NotAPrimitive(n.tag().raw())),
    }
}

macro_rules! impl_pvarint_value {
    ($ty:ty, $encode:ident, $decode:ident) => {
        impl TlvValue for $ty {
            fn to_packet(&self, tag: u8) -> Packet {
                let mut buf = BytesMut::new();
                $encode(&mut buf, *self);
                PrimitivePacket::new(tag, buf.freeze()).into()
            }

            fn from_packet(packet: &Packet) -> Result<Self, CodecError> {
                let value = primitive_value(packet)?;
                let (v, used) = $decode(value)?;
                if used != value.len() {
                    return Err(CodecError::TrailingBytes(value.len() - used));
                }
                Ok(v)
            }
        }
    };
}

impl_pvarint_value!(i32, encode_pvarint_i32, decode_pvarint_i32);
impl_pvarint_value!(i64, encode_pvarint_i64, decode_pvarint_i64);
impl_pvarint_value!(u32, encode_pvarint_u32, decode_pvarint_u32);
impl_pvarint_value!(u64, encode_pvarint_u64, decode_pvarint_u64);

impl TlvValue for f32 {
    fn to_packet(&self, tag: u8) -> Packet {
        let mut buf = BytesMut::new();
        encode_nvarfloat_f32(&mut buf, *self);
        PrimitivePacket::new(tag, buf.freeze()).into()
    }

    fn from_packet(packet: &Packet) -> Result<Self, CodecError> {
        decode_nvarfloat_f32(primitive_value(packet)?)
    }
}

impl TlvValue for f64 {
    fn to_packet(&self, tag: u8) -> Packet {
        let mut buf = BytesMut::new();
        encode_nvarfloat_f64(&mut buf, *self);
        PrimitivePacket::new(tag, buf.freeze()).into()
    }

    fn from_packet(packet: &Packet) -> Result<Self, CodecError> {
        decode_nvarfloat_f64(primitive_value(packet)?)
    }
}

impl TlvValue for bool {
    fn to_packet(&self, tag: u8) -> Packet {
        PrimitivePacket::new(tag, vec![u8::from(*self)]).into()
    }

    fn from_packet(packet: &Packet) -> Result<Self, CodecError> {
        match primitive_value(packet)?.as_ref() {
            [0x00] => Ok(false),
            [0x01] => Ok(true),
            other => Err(CodecError::InvalidBool(other.to_vec())),
        }
    }
}

impl TlvValue for String {
    fn to_packet(&self, tag: u8) -> Packet {
        PrimitivePacket::new(tag, Bytes::copy_from_slice(self.as_bytes())).into()
    }

    fn from_packet(packet: &Packet) -> Result<Self, CodecError> {
        let value = primitive_value(packet)?;
        String::from_utf8(value.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }
}

impl TlvValue for Bytes {
    fn to_packet(&self, tag: u8) -> Packet {
        PrimitivePacket::new(tag, self.clone()).into()
    }

    fn from_packet(packet: &Packet) -> Result<Self, CodecError> {
        primitive_value(packet).cloned()
    }
}

impl<T: TlvValue> TlvValue for Vec<T> {
    fn to_packet(&self, tag: u8) -> Packet {
        let mut node = NodePacket::new_slice(tag);
        for item in self {
            node.push(item.to_packet(0));
        }
        node.into()
    }

    fn from_packet(packet: &Packet) -> Result<Self, CodecError> {
        let node = match packet {
            Packet::Node(n) if n.is_slice() => n,
            other => return Err(CodecError::NotASequence(other.tag().raw())),
        };
        node.children().iter().map(T::from_packet).collect()
    }
}

/// Encodes `value` as a complete packet under `tag`.
pub fn marshal<T: TlvValue>(tag: u8, value: &T) -> Bytes {
    value.to_packet(tag).encode()
}

/// Decodes a value from a buffer holding exactly one packet.
pub fn unmarshal<T: TlvValue>(buf: &[u8]) -> Result<T, CodecError> {
    let (packet, used) = Packet::decode(buf)?;
    if used != buf.len() {
        return Err(CodecError::TrailingBytes(buf.len() - used));
    }
    T::from_packet(&packet)
}

pub fn to_i32(buf: &[u8]) -> Result<i32, CodecError> {
    unmarshal(buf)
}

pub fn to_i64(buf: &[u8]) -> Result<i64, CodecError> {
    unmarshal(buf)
}

pub fn to_u32(buf: &[u8]) -> Result<u32, CodecError> {
    unmarshal(buf)
}

pub fn to_u64(buf: &[u8]) -> Result<u64, CodecError> {
    unmarshal(buf)
}

pub fn to_f32(buf: &[u8]) -> Result<f32, CodecError> {
    unmarshal(buf)
}

pub fn to_f64(buf: &[u8]) -> Result<f64, CodecError> {
    unmarshal(buf)
}

pub fn to_bool(buf: &[u8]) -> Result<bool, CodecError> {
    unmarshal(buf)
}

pub fn to_utf8_string(buf: &[u8]) -> Result<String, CodecError> {
    unmarshal(buf)
}

pub fn to_bytes(buf: &[u8]) -> Result<Bytes, CodecError> {
    unmarshal(buf)
}

pub fn to_i32_slice(buf: &[u8]) -> Result<Vec<i32>, CodecError> {
    unmarshal(buf)
}

pub fn to_i64_slice(buf: &[u8]) -> Result<Vec<i64>, CodecError> {
    unmarshal(buf)
}

pub fn to_u32_slice(buf: &[u8]) -> Result<Vec<u32>, CodecError> {
    unmarshal(buf)
}

pub fn to_u64_slice(buf: &[u8]) -> Result<Vec<u64>, CodecError> {
    unmarshal(buf)
}

pub fn to_f32_slice(buf: &[u8]) -> Result<Vec<f32>, CodecError> {
    unmarshal(buf)
}

pub fn to_f64_slice(buf: &[u8]) -> Result<Vec<f64>, CodecError> {
    unmarshal(buf)
}

pub fn to_bool_slice(buf: &[u8]) -> Result<Vec<bool>, CodecError> {
    unmarshal(buf)
}

pub fn to_utf8_string_slice(buf: &[u8]) -> Result<Vec<String>, CodecError> {
    unmarshal(buf)
}

pub fn to_bytes_slice(buf: &[u8]) -> Result<Vec<Bytes>, CodecError> {
    unmarshal(buf)
}
