//! Encoding of primitive values stored in the state.
//!
//! Fixed-width integers are little-endian. Big integers (EVM balances,
//! native token amounts held in accounts) use the shortest big-endian form,
//! with zero encoded as the empty string.

use ethereum_types::U256;
use thiserror::Error;

/// Result of decoding a stored value.
pub type KvResult<T> = Result<T, KvDecodeError>;

#[derive(Clone, Debug, Eq, Error, PartialEq)]
/// A stored value could not be decoded.
pub enum KvDecodeError {
    #[error("{what}: expected {expected} bytes, got {got}")]
    /// The value has the wrong width.
    WrongLength {
        /// Type being decoded.
        what: &'static str,
        /// Width of the type.
        expected: usize,
        /// Width found.
        got: usize,
    },

    #[error("{0}: truncated input")]
    /// A composite value ended early.
    Truncated(&'static str),

    #[error("{0}: trailing bytes")]
    /// A composite value has leftover bytes.
    Trailing(&'static str),

    #[error("{0}: invalid value")]
    /// The bytes do not form a valid value.
    Invalid(&'static str),
}

fn fixed<const N: usize>(what: &'static str, b: &[u8]) -> KvResult<[u8; N]> {
    b.try_into().map_err(|_| KvDecodeError::WrongLength {
        what,
        expected: N,
        got: b.len(),
    })
}

/// Encodes a `u16`.
pub fn encode_u16(v: u16) -> Vec<u8> {
    v.to_le_bytes().to_vec()
}

/// Decodes a `u16`.
pub fn decode_u16(b: &[u8]) -> KvResult<u16> {
    fixed("u16", b).map(u16::from_le_bytes)
}

/// Encodes a `u32`.
pub fn encode_u32(v: u32) -> Vec<u8> {
    v.to_le_bytes().to_vec()
}

/// Decodes a `u32`.
pub fn decode_u32(b: &[u8]) -> KvResult<u32> {
    fixed("u32", b).map(u32::from_le_bytes)
}

/// Encodes a `u64`.
pub fn encode_u64(v: u64) -> Vec<u8> {
    v.to_le_bytes().to_vec()
}

/// Decodes a `u64`.
pub fn decode_u64(b: &[u8]) -> KvResult<u64> {
    fixed("u64", b).map(u64::from_le_bytes)
}

/// Encodes an `i64`.
pub fn encode_i64(v: i64) -> Vec<u8> {
    v.to_le_bytes().to_vec()
}

/// Decodes an `i64`.
pub fn decode_i64(b: &[u8]) -> KvResult<i64> {
    fixed("i64", b).map(i64::from_le_bytes)
}

/// Encodes a boolean as a single byte.
pub fn encode_bool(v: bool) -> Vec<u8> {
    vec![v as u8]
}

/// Decodes a boolean.
pub fn decode_bool(b: &[u8]) -> KvResult<bool> {
    match b {
        [0] => Ok(false),
        [1] => Ok(true),
        _ => Err(KvDecodeError::Invalid("bool")),
    }
}

/// Decodes a UTF-8 string.
pub fn decode_string(b: &[u8]) -> KvResult<String> {
    String::from_utf8(b.to_vec()).map_err(|_| KvDecodeError::Invalid("string"))
}

/// Encodes a big integer as minimal big-endian bytes.
pub fn encode_u256(v: &U256) -> Vec<u8> {
    let mut raw = [0; 32];
    v.to_big_endian(&mut raw);
    let skip = v.leading_zeros() as usize / 8;
    raw[skip..].to_vec()
}

/// Decodes a big-endian big integer of at most 32 bytes.
pub fn decode_u256(b: &[u8]) -> KvResult<U256> {
    match b.len() <= 32 {
        true => Ok(U256::from_big_endian(b)),
        false => Err(KvDecodeError::Invalid("u256")),
    }
}

/// Decodes an optional value, falling back to `default` when absent.
pub fn decode_or<T>(
    b: Option<Vec<u8>>,
    default: T,
    f: impl FnOnce(&[u8]) -> KvResult<T>,
) -> KvResult<T> {
    b.map_or(Ok(default), |b| f(&b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn big_integers_are_minimal() {
        assert!(encode_u256(&U256::zero()).is_empty());
        assert_eq!(encode_u256(&U256::from(0x0100)), vec![1, 0]);
        assert_eq!(decode_u256(&[1, 0]).unwrap(), U256::from(0x0100));
        assert_eq!(decode_u256(&[]).unwrap(), U256::zero());
    }

    #[test]
    fn wrong_width_is_reported() {
        assert_eq!(
            decode_u64(&[1, 2]),
            Err(KvDecodeError::WrongLength {
                what: "u64",
                expected: 8,
                got: 2
            })
        );
    }

    #[test]
    fn absent_values_use_the_default() {
        assert_eq!(decode_or(None, 7, decode_u32).unwrap(), 7);
        assert_eq!(decode_or(Some(encode_u32(3)), 7, decode_u32).unwrap(), 3);
    }
}
