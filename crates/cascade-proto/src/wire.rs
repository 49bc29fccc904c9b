//! Encode/decode primitives for the tag-prefixed binary wire format.
//!
//! Everything on the wire is built from four shapes: big-endian integers,
//! `u32` length-prefixed byte strings, `u32` count-prefixed lists and
//! `u8`-flagged optionals. Decoding validates lengths before allocating,
//! so a malformed frame is rejected without copying its payload.

use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;

/// Maximum length accepted for a single byte string or list.
///
/// Frames are bounded by the transport at 16 MB; any length field claiming
/// more than this is a malformed or malicious frame.
pub const MAX_FIELD_LEN: usize = 16 * 1024 * 1024;

/// Errors produced while decoding wire data.
///
/// All variants are recoverable: the caller drops the offending frame and
/// keeps the connection open.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// The buffer ended before the announced content.
    #[error("unexpected end of input: needed {needed} more bytes")]
    UnexpectedEof {
        /// How many further bytes the decoder required.
        needed: usize,
    },

    /// A sum type carried a tag this version does not know.
    #[error("unknown tag {tag} for {context}")]
    UnknownTag {
        /// Wire type being decoded.
        context: &'static str,
        /// Offending tag value.
        tag: u8,
    },

    /// A length or count field exceeded [`MAX_FIELD_LEN`].
    #[error("field length {len} exceeds limit {max}", max = MAX_FIELD_LEN)]
    FieldTooLarge {
        /// Claimed length.
        len: usize,
    },

    /// A fixed-size field had the wrong length.
    #[error("invalid length for {context}: expected {expected}, got {actual}")]
    InvalidLength {
        /// Wire type being decoded.
        context: &'static str,
        /// Required length.
        expected: usize,
        /// Length found on the wire.
        actual: usize,
    },

    /// Trailing bytes after a complete message.
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}

/// Result alias for decoding operations.
pub type Result<T> = std::result::Result<T, WireError>;

/// Types that can be written to a wire buffer.
pub trait WireEncode {
    /// Append the wire representation of `self` to `buf`.
    fn encode(&self, buf: &mut impl BufMut);

    /// Encode into a fresh [`Bytes`] value.
    fn encode_to_bytes(&self) -> Bytes {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        Bytes::from(buf)
    }
}

/// Types that can be read back from a wire buffer.
pub trait WireDecode: Sized {
    /// Decode one value, advancing `buf` past it.
    fn decode(buf: &mut impl Buf) -> Result<Self>;

    /// Decode a value that must consume the entire input.
    fn decode_exact(mut buf: &[u8]) -> Result<Self> {
        let value = Self::decode(&mut buf)?;
        if buf.has_remaining() {
            return Err(WireError::TrailingBytes(buf.remaining()));
        }
        Ok(value)
    }
}

/// Ensure at least `n` readable bytes remain.
pub fn need(buf: &impl Buf, n: usize) -> Result<()> {
    if buf.remaining() < n {
        return Err(WireError::UnexpectedEof { needed: n - buf.remaining() });
    }
    Ok(())
}

/// Read a `u8`.
pub fn get_u8(buf: &mut impl Buf) -> Result<u8> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

/// Read a big-endian `u16`.
pub fn get_u16(buf: &mut impl Buf) -> Result<u16> {
    need(buf, 2)?;
    Ok(buf.get_u16())
}

/// Read a big-endian `u32`.
pub fn get_u32(buf: &mut impl Buf) -> Result<u32> {
    need(buf, 4)?;
    Ok(buf.get_u32())
}

/// Read a big-endian `u64`.
pub fn get_u64(buf: &mut impl Buf) -> Result<u64> {
    need(buf, 8)?;
    Ok(buf.get_u64())
}

/// Read a length field and validate it against [`MAX_FIELD_LEN`] and the
/// remaining input.
fn get_len(buf: &mut impl Buf) -> Result<usize> {
    let len = get_u32(buf)? as usize;
    if len > MAX_FIELD_LEN {
        return Err(WireError::FieldTooLarge { len });
    }
    need(buf, len)?;
    Ok(len)
}

/// Write a `u32` length-prefixed byte string.
pub fn put_bytes(buf: &mut impl BufMut, data: &[u8]) {
    debug_assert!(data.len() <= MAX_FIELD_LEN);
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

/// Read a `u32` length-prefixed byte string.
pub fn get_bytes(buf: &mut impl Buf) -> Result<Bytes> {
    let len = get_len(buf)?;
    Ok(buf.copy_to_bytes(len))
}

/// Write a `u32` count-prefixed list.
pub fn put_list<T: WireEncode>(buf: &mut impl BufMut, items: &[T]) {
    debug_assert!(items.len() <= MAX_FIELD_LEN);
    buf.put_u32(items.len() as u32);
    for item in items {
        item.encode(buf);
    }
}

/// Read a `u32` count-prefixed list.
pub fn get_list<T: WireDecode>(buf: &mut impl Buf) -> Result<Vec<T>> {
    let count = get_u32(buf)? as usize;
    if count > MAX_FIELD_LEN {
        return Err(WireError::FieldTooLarge { len: count });
    }
    // Elements are at least one byte each, so the count is bounded by the
    // remaining input; this rejects absurd counts before allocating.
    need(buf, count)?;
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        items.push(T::decode(buf)?);
    }
    Ok(items)
}

/// Write a `u8`-flagged optional.
pub fn put_opt<T: WireEncode>(buf: &mut impl BufMut, value: &Option<T>) {
    match value {
        Some(inner) => {
            buf.put_u8(1);
            inner.encode(buf);
        },
        None => buf.put_u8(0),
    }
}

/// Read a `u8`-flagged optional. Any non-zero flag means present.
pub fn get_opt<T: WireDecode>(buf: &mut impl Buf) -> Result<Option<T>> {
    if get_u8(buf)? == 0 { Ok(None) } else { Ok(Some(T::decode(buf)?)) }
}

impl WireEncode for Bytes {
    fn encode(&self, buf: &mut impl BufMut) {
        put_bytes(buf, self);
    }
}

impl WireDecode for Bytes {
    fn decode(buf: &mut impl Buf) -> Result<Self> {
        get_bytes(buf)
    }
}

impl<T: WireEncode> WireEncode for Vec<T> {
    fn encode(&self, buf: &mut impl BufMut) {
        put_list(buf, self);
    }
}

impl<T: WireDecode> WireDecode for Vec<T> {
    fn decode(buf: &mut impl Buf) -> Result<Self> {
        get_list(buf)
    }
}

impl<A: WireEncode, B: WireEncode> WireEncode for (A, B) {
    fn encode(&self, buf: &mut impl BufMut) {
        self.0.encode(buf);
        self.1.encode(buf);
    }
}

impl<A: WireDecode, B: WireDecode> WireDecode for (A, B) {
    fn decode(buf: &mut impl Buf) -> Result<Self> {
        Ok((A::decode(buf)?, B::decode(buf)?))
    }
}
