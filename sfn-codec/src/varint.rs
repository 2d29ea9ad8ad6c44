//! Variable-length integer and float encodings.
//!
//! Both integer flavors write the shortest most-significant-first run of
//! groups whose sign extension reproduces the value:
//!
//! - **P-encoding**: 7 payload bits per byte, bit 7 set on every byte except
//!   the last. Self-delimiting; used for TLV lengths and integer values.
//! - **N-encoding**: 8 payload bits per byte. Not self-delimiting; the byte
//!   count comes from the enclosing TLV length.
//!
//! Floats are N-encoded from their IEEE-754 bit pattern with trailing zero
//! bytes dropped, so `1.0f32` (`0x3F800000`) encodes as `[0x3F, 0x80]`.
//!
//! ```text
//! value  P-encoding     N-encoding
//! -1     7F             FF
//! 64     80 40          40
//! 255    81 7F          00 FF
//! ```

use crate::error::CodecError;
use bytes::BufMut;

/// Largest P-encoded integer (u64 plus sign in 7-bit groups).
pub const MAX_PVARINT_SIZE: usize = 10;

/// Largest N-encoded integer (u64 plus sign byte).
pub const MAX_NVARINT_SIZE: usize = 9;

const P_UNIT: u32 = 7;
const N_UNIT: u32 = 8;

fn size_of_var(value: i128, unit: u32, max: usize) -> usize {
    let lead = value >> 127;
    for size in 1..max {
        if value >> (size as u32 * unit - 1) == lead {
            return size;
        }
    }
    max
}

fn put_pvar(buf: &mut impl BufMut, value: i128) {
    let size = size_of_var(value, P_UNIT, MAX_PVARINT_SIZE);
    for i in (0..size as u32).rev() {
        let part = (value >> (i * P_UNIT)) as u8;
        if i > 0 {
            buf.put_u8(part | 0x80);
        } else {
            buf.put_u8(part & 0x7F);
        }
    }
}

fn take_pvar(buf: &[u8]) -> Result<(i128, usize), CodecError> {
    let first = *buf.first().ok_or(CodecError::BufferInsufficient)?;
    // Bit 6 of the leading group carries the sign.
    let mut value: i128 = if first & 0x40 != 0 { -1 } else { 0 };
    for (i, &byte) in buf.iter().enumerate() {
        if i == MAX_PVARINT_SIZE {
            return Err(CodecError::Overflow);
        }
        value = (value << P_UNIT) | i128::from(byte & 0x7F);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(CodecError::BufferInsufficient)
}

fn put_nvar(buf: &mut impl BufMut, value: i128) {
    let size = size_of_var(value, N_UNIT, MAX_NVARINT_SIZE);
    for i in (0..size as u32).rev() {
        buf.put_u8((value >> (i * N_UNIT)) as u8);
    }
}

fn take_nvar(buf: &[u8]) -> Result<i128, CodecError> {
    let first = *buf.first().ok_or(CodecError::BufferInsufficient)?;
    if buf.len() > MAX_NVARINT_SIZE {
        return Err(CodecError::Overflow);
    }
    let mut value: i128 = if first & 0x80 != 0 { -1 } else { 0 };
    for &byte in buf {
        value = (value << N_UNIT) | i128::from(byte);
    }
    Ok(value)
}

macro_rules! pvarint {
    ($ty:ty, $encode:ident, $decode:ident, $size:ident) => {
        #[doc = concat!("P-encodes a `", stringify!($ty), "` into `buf`.")]
        pub fn $encode(buf: &mut impl BufMut, value: $ty) {
            put_pvar(buf, value as i128);
        }

        #[doc = concat!("Decodes a P-encoded `", stringify!($ty), "`, returning the value and bytes consumed.")]
        pub fn $decode(buf: &[u8]) -> Result<($ty, usize), CodecError> {
            let (value, used) = take_pvar(buf)?;
            let value = <$ty>::try_from(value).map_err(|_| CodecError::Overflow)?;
            Ok((value, used))
        }

        #[doc = concat!("Returns the P-encoded size of a `", stringify!($ty), "`.")]
        pub fn $size(value: $ty) -> usize {
            size_of_var(value as i128, P_UNIT, MAX_PVARINT_SIZE)
        }
    };
}

macro_rules! nvarint {
    ($ty:ty, $encode:ident, $decode:ident, $size:ident) => {
        #[doc = concat!("N-encodes a `", stringify!($ty), "` into `buf`.")]
        pub fn $encode(buf: &mut impl BufMut, value: $ty) {
            put_nvar(buf, value as i128);
        }

        #[doc = concat!("Decodes an N-encoded `", stringify!($ty), "` spanning all of `buf`.")]
        pub fn $decode(buf: &[u8]) -> Result<$ty, CodecError> {
            <$ty>::try_from(take_nvar(buf)?).map_err(|_| CodecError::Overflow)
        }

        #[doc = concat!("Returns the N-encoded size of a `", stringify!($ty), "`.")]
        pub fn $size(value: $ty) -> usize {
            size_of_var(value as i128, N_UNIT, MAX_NVARINT_SIZE)
        }
    };
}

pvarint!(i32, encode_pvarint_i32, decode_pvarint_i32, size_of_pvarint_i32);
pvarint!(i64, encode_pvarint_i64, decode_pvarint_i64, size_of_pvarint_i64);
pvarint!(u32, encode_pvarint_u32, decode_pvarint_u32, size_of_pvarint_u32);
pvarint!(u64, encode_pvarint_u64, decode_pvarint_u64, size_of_pvarint_u64);

nvarint!(i32, encode_nvarint_i32, decode_nvarint_i32, size_of_nvarint_i32);
nvarint!(i64, encode_nvarint_i64, decode_nvarint_i64, size_of_nvarint_i64);
nvarint!(u32, encode_nvarint_u32, decode_nvarint_u32, size_of_nvarint_u32);
nvarint!(u64, encode_nvarint_u64, decode_nvarint_u64, size_of_nvarint_u64);

fn trimmed_float_len(bytes: &[u8]) -> usize {
    let mut size = bytes.len();
    while size > 1 && bytes[size - 1] == 0 {
        size -= 1;
    }
    size
}

fn take_float_bits(buf: &[u8], width: usize) -> Result<u64, CodecError> {
    if buf.is_empty() {
        return Err(CodecError::BufferInsufficient);
    }
    if buf.len() > width {
        return Err(CodecError::Overflow);
    }
    let mut bits = 0u64;
    for &byte in buf {
        bits = (bits << 8) | u64::from(byte);
    }
    Ok(bits << (8 * (width - buf.len())))
}

/// N-encodes an `f32` as its leading non-zero bit-pattern bytes.
pub fn encode_nvarfloat_f32(buf: &mut impl BufMut, value: f32) {
    let bytes = value.to_bits().to_be_bytes();
    buf.put_slice(&bytes[..trimmed_float_len(&bytes)]);
}

/// Decodes an N-encoded `f32` spanning all of `buf`.
pub fn decode_nvarfloat_f32(buf: &[u8]) -> Result<f32, CodecError> {
    let bits = take_float_bits(buf, 4)?;
    Ok(f32::from_bits(bits as u32))
}

/// Returns the N-encoded size of an `f32`.
pub fn size_of_nvarfloat_f32(value: f32) -> usize {
    trimmed_float_len(&value.to_bits().to_be_bytes())
}

/// N-encodes an `f64` as its leading non-zero bit-pattern bytes.
pub fn encode_nvarfloat_f64(buf: &mut impl BufMut, value: f64) {
    let bytes = value.to_bits().to_be_bytes();
    buf.put_slice(&bytes[..trimmed_float_len(&bytes)]);
}

/// Decodes an N-encoded `f64` spanning all of `buf`.
pub fn decode_nvarfloat_f64(buf: &[u8]) -> Result<f64, CodecError> {
    Ok(f64::from_bits(take_float_bits(buf, 8)?))
}

/// Returns the N-encoded size of an `f64`.
pub fn size_of_nvarfloat_f64(value: f64) -> usize {
    trimmed_float_len(&value.to_bits().to_be_bytes())
}
