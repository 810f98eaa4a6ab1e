//! Binary wire primitives.
//!
//! All multi-byte values are big-endian. Strings and collections carry an
//! `i32` length prefix. Buffers are single-owner: encoders write into a
//! `BytesMut` the caller owns and freezes into `Bytes` before handing it to
//! the transport; decoders consume a `Buf` cursor.

use crate::error::WireError;
use crate::types::{MessageType, Oid};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Types with a custom compact binary encoding.
pub trait Marshal: Sized {
    /// Appends the encoding of `self` to `buf`.
    fn marshal(&self, buf: &mut BytesMut);

    /// Reads one value from the front of `buf`.
    fn unmarshal(buf: &mut impl Buf) -> Result<Self, WireError>;

    /// Encodes `self` into a fresh, frozen buffer.
    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.marshal(&mut buf);
        buf.freeze()
    }

    /// Decodes a value from a complete byte slice.
    fn from_slice(mut data: &[u8]) -> Result<Self, WireError> {
        Self::unmarshal(&mut data)
    }
}

#[inline]
fn ensure(buf: &impl Buf, needed: usize) -> Result<(), WireError> {
    let remaining = buf.remaining();
    if remaining < needed {
        return Err(WireError::Truncated { needed, remaining });
    }
    Ok(())
}

pub fn get_u8(buf: &mut impl Buf) -> Result<u8, WireError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn get_bool(buf: &mut impl Buf) -> Result<bool, WireError> {
    Ok(get_u8(buf)? != 0)
}

pub fn get_i8(buf: &mut impl Buf) -> Result<i8, WireError> {
    ensure(buf, 1)?;
    Ok(buf.get_i8())
}

pub fn get_i16(buf: &mut impl Buf) -> Result<i16, WireError> {
    ensure(buf, 2)?;
    Ok(buf.get_i16())
}

pub fn get_i32(buf: &mut impl Buf) -> Result<i32, WireError> {
    ensure(buf, 4)?;
    Ok(buf.get_i32())
}

pub fn get_i64(buf: &mut impl Buf) -> Result<i64, WireError> {
    ensure(buf, 8)?;
    Ok(buf.get_i64())
}

pub fn get_f32(buf: &mut impl Buf) -> Result<f32, WireError> {
    ensure(buf, 4)?;
    Ok(buf.get_f32())
}

pub fn get_f64(buf: &mut impl Buf) -> Result<f64, WireError> {
    ensure(buf, 8)?;
    Ok(buf.get_f64())
}

/// Reads an `i32` length prefix, rejecting negative values.
pub fn get_len(buf: &mut impl Buf) -> Result<usize, WireError> {
    let len = get_i32(buf)?;
    if len < 0 {
        return Err(WireError::NegativeLength(len));
    }
    Ok(len as usize)
}

pub fn get_string(buf: &mut impl Buf) -> Result<String, WireError> {
    let len = get_len(buf)?;
    ensure(buf, len)?;
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    String::from_utf8(raw).map_err(|_| WireError::InvalidUtf8)
}

pub fn get_oid(buf: &mut impl Buf) -> Result<Oid, WireError> {
    Ok(Oid(get_i64(buf)? as u64))
}

pub fn get_message_type(buf: &mut impl Buf) -> Result<MessageType, WireError> {
    Ok(MessageType::intern(&get_string(buf)?))
}

pub fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(u8::from(value));
}

pub fn put_len(buf: &mut BytesMut, len: usize) {
    buf.put_i32(len as i32);
}

pub fn put_string(buf: &mut BytesMut, value: &str) {
    put_len(buf, value.len());
    buf.put_slice(value.as_bytes());
}

pub fn put_oid(buf: &mut BytesMut, oid: Oid) {
    buf.put_i64(oid.0 as i64);
}

pub fn put_message_type(buf: &mut BytesMut, message_type: &MessageType) {
    put_string(buf, message_type.as_str());
}

/// Writes `[int count][long oid...]`.
pub fn put_oids<'a>(buf: &mut BytesMut, oids: impl ExactSizeIterator<Item = &'a Oid>) {
    put_len(buf, oids.len());
    for oid in oids {
        put_oid(buf, *oid);
    }
}

/// Reads `[int count][long oid...]`.
pub fn get_oids(buf: &mut impl Buf) -> Result<Vec<Oid>, WireError> {
    let count = get_len(buf)?;
    ensure(buf, count.saturating_mul(8))?;
    (0..count).map(|_| get_oid(buf)).collect()
}
