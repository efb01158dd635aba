//! Deterministic binary encoding of ledger objects.
//!
//! All integers are little-endian. Variable-length collections carry a
//! count prefix whose width depends on the collection (see each type). The
//! encoding of a value is unique: decoders reject unsorted or duplicated
//! set members and trailing bytes.

use bytes::{Buf, BufMut};
use ethereum_types::U256;
use thiserror::Error;

/// Alias for the result of decoding operations.
pub type CodecResult<T> = Result<T, CodecError>;

#[derive(Clone, Debug, Eq, Error, PartialEq)]
/// Errors that may occur while decoding ledger objects.
pub enum CodecError {
    #[error("unexpected end of input: needed {needed} bytes, {remaining} remaining")]
    /// The input ended before the object was complete.
    UnexpectedEof {
        /// Number of bytes the decoder tried to read.
        needed: usize,
        /// Number of bytes that were left.
        remaining: usize,
    },

    #[error("{0} trailing bytes after decoded object")]
    /// The input holds more bytes than the decoded object.
    TrailingBytes(usize),

    #[error("unknown {what} kind {kind}")]
    /// A type discriminator did not match any known variant.
    UnknownKind {
        /// The family of objects being decoded.
        what: &'static str,
        /// The discriminator that was read.
        kind: u8,
    },

    #[error("{what} must be sorted and unique")]
    /// A set-like collection was not in canonical order.
    NotCanonical {
        /// The family of objects being decoded.
        what: &'static str,
    },

    #[error("{what} count {count} exceeds the limit of {max}")]
    /// A collection held more elements than allowed.
    TooMany {
        /// The family of objects being decoded.
        what: &'static str,
        /// The element count that was read.
        count: usize,
        /// The maximum allowed count.
        max: usize,
    },

    #[error("invalid value: {0}")]
    /// A field held a value that is not allowed.
    Invalid(String),
}

/// A type with a canonical binary form.
pub trait Packable: Sized {
    /// Appends the binary form of `self` to `buf`.
    fn pack<B: BufMut>(&self, buf: &mut B);

    /// Reads a value from the front of `buf`, advancing it.
    fn unpack<B: Buf>(buf: &mut B) -> CodecResult<Self>;

    /// Returns the binary form of `self`.
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.pack(&mut out);
        out
    }

    /// Decodes a value that must span all of `bytes`.
    fn from_bytes(bytes: &[u8]) -> CodecResult<Self> {
        let mut buf = bytes;
        let v = Self::unpack(&mut buf)?;
        match buf.remaining() {
            0 => Ok(v),
            n => Err(CodecError::TrailingBytes(n)),
        }
    }

    /// The number of bytes [`Packable::pack`] produces.
    fn packed_len(&self) -> usize {
        self.to_bytes().len()
    }
}

pub(crate) fn ensure_remaining<B: Buf>(buf: &B, needed: usize) -> CodecResult<()> {
    match buf.remaining() >= needed {
        true => Ok(()),
        false => Err(CodecError::UnexpectedEof {
            needed,
            remaining: buf.remaining(),
        }),
    }
}

/// Reads a single byte.
pub fn read_u8<B: Buf>(buf: &mut B) -> CodecResult<u8> {
    ensure_remaining(buf, 1)?;
    Ok(buf.get_u8())
}

/// Reads a little-endian `u16`.
pub fn read_u16<B: Buf>(buf: &mut B) -> CodecResult<u16> {
    ensure_remaining(buf, 2)?;
    Ok(buf.get_u16_le())
}

/// Reads a little-endian `u32`.
pub fn read_u32<B: Buf>(buf: &mut B) -> CodecResult<u32> {
    ensure_remaining(buf, 4)?;
    Ok(buf.get_u32_le())
}

/// Reads a little-endian `u64`.
pub fn read_u64<B: Buf>(buf: &mut B) -> CodecResult<u64> {
    ensure_remaining(buf, 8)?;
    Ok(buf.get_u64_le())
}

/// Reads a fixed-size byte array.
pub fn read_array<B: Buf, const N: usize>(buf: &mut B) -> CodecResult<[u8; N]> {
    ensure_remaining(buf, N)?;
    let mut out = [0; N];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

/// Reads a 256-bit little-endian integer.
pub fn read_u256<B: Buf>(buf: &mut B) -> CodecResult<U256> {
    let raw: [u8; 32] = read_array(buf)?;
    Ok(U256::from_little_endian(&raw))
}

/// Writes a 256-bit integer as 32 little-endian bytes.
pub fn write_u256<B: BufMut>(buf: &mut B, v: &U256) {
    let mut raw = [0; 32];
    v.to_little_endian(&mut raw);
    buf.put_slice(&raw);
}

/// Reads a byte string prefixed by its `u16` length.
pub fn read_bytes_u16<B: Buf>(buf: &mut B) -> CodecResult<Vec<u8>> {
    let len = read_u16(buf)? as usize;
    read_vec(buf, len)
}

/// Reads a byte string prefixed by its `u32` length.
pub fn read_bytes_u32<B: Buf>(buf: &mut B) -> CodecResult<Vec<u8>> {
    let len = read_u32(buf)? as usize;
    read_vec(buf, len)
}

/// Reads a byte string prefixed by its `u8` length.
pub fn read_bytes_u8<B: Buf>(buf: &mut B) -> CodecResult<Vec<u8>> {
    let len = read_u8(buf)? as usize;
    read_vec(buf, len)
}

fn read_vec<B: Buf>(buf: &mut B, len: usize) -> CodecResult<Vec<u8>> {
    ensure_remaining(buf, len)?;
    let mut out = vec![0; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

/// Writes a byte string prefixed by its `u16` length.
///
/// # Panics
/// If `data` is longer than `u16::MAX`; callers validate lengths first.
pub fn write_bytes_u16<B: BufMut>(buf: &mut B, data: &[u8]) {
    let len = u16::try_from(data.len()).expect("byte string longer than u16::MAX");
    buf.put_u16_le(len);
    buf.put_slice(data);
}

/// Writes a byte string prefixed by its `u32` length.
pub fn write_bytes_u32<B: BufMut>(buf: &mut B, data: &[u8]) {
    buf.put_u32_le(data.len() as u32);
    buf.put_slice(data);
}

/// Writes a byte string prefixed by its `u8` length.
///
/// # Panics
/// If `data` is longer than `u8::MAX`.
pub fn write_bytes_u8<B: BufMut>(buf: &mut B, data: &[u8]) {
    let len = u8::try_from(data.len()).expect("byte string longer than u8::MAX");
    buf.put_u8(len);
    buf.put_slice(data);
}

impl Packable for u64 {
    fn pack<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64_le(*self);
    }

    fn unpack<B: Buf>(buf: &mut B) -> CodecResult<Self> {
        read_u64(buf)
    }
}

impl Packable for u32 {
    fn pack<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(*self);
    }

    fn unpack<B: Buf>(buf: &mut B) -> CodecResult<Self> {
        read_u32(buf)
    }
}
