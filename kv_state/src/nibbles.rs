//! Define [`Nibbles`], the path type of the state trie.

use std::fmt;

/// A Nibble has 4 bits and is stored as `u8`.
pub type Nibble = u8;

/// A sequence of nibbles. Trie paths in this crate are always derived from
/// 32-byte key hashes, so sequences are at most 64 nibbles long.
#[derive(Clone, Default, Eq, Hash, PartialEq)]
pub struct Nibbles(Vec<Nibble>);

impl Nibbles {
    /// Splits each byte of `bytes` into its high and low nibble.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(bytes.iter().flat_map(|b| [b >> 4, b & 0x0f]).collect())
    }

    /// A sequence holding a single nibble.
    pub fn from_nibble(n: Nibble) -> Self {
        debug_assert!(n < 16, "nibble out of range");
        Self(vec![n])
    }

    /// Number of nibbles.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the sequence is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The nibble at `idx`.
    pub fn get_nibble(&self, idx: usize) -> Nibble {
        self.0[idx]
    }

    /// Everything after the first `n` nibbles.
    pub fn truncate_n_nibbles_front(&self, n: usize) -> Self {
        Self(self.0[n..].to_vec())
    }

    /// The first `n` nibbles.
    pub fn prefix(&self, n: usize) -> Self {
        Self(self.0[..n].to_vec())
    }

    /// Length of the common prefix of `self` and `other`.
    pub fn common_prefix_len(&self, other: &Nibbles) -> usize {
        self.0
            .iter()
            .zip(other.0.iter())
            .take_while(|(a, b)| a == b)
            .count()
    }

    /// Whether `self` starts with all of `prefix`.
    pub fn starts_with(&self, prefix: &Nibbles) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// `self` followed by `other`.
    pub fn merge_nibbles(&self, other: &Nibbles) -> Self {
        Self([self.0.as_slice(), other.0.as_slice()].concat())
    }

    /// Hex-prefix encoding as used in Ethereum tries: the first nibble holds
    /// the leaf flag and the parity of the length.
    pub fn to_hex_prefix_encoding(&self, is_leaf: bool) -> Vec<u8> {
        let odd = self.0.len() % 2 == 1;
        let flag = (is_leaf as u8) * 2 + odd as u8;
        let mut out = Vec::with_capacity(self.0.len() / 2 + 1);
        let rest = match odd {
            true => {
                out.push((flag << 4) | self.0[0]);
                &self.0[1..]
            }
            false => {
                out.push(flag << 4);
                &self.0[..]
            }
        };
        out.extend(rest.chunks(2).map(|p| (p[0] << 4) | p[1]));
        out
    }
}

impl fmt::Debug for Nibbles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x")?;
        for n in &self.0 {
            write!(f, "{n:x}")?;
        }
        Ok(())
    }
}
