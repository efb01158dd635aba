//! In-memory ordered key-value map.

use std::collections::BTreeMap;
use std::fmt;

use bytes::{Buf, BufMut};

use crate::codec::{KvDecodeError, KvResult};
use crate::kv::{KvReader, KvWriter};

/// An ordered map from byte keys to byte values. Used as the in-memory
/// backing of chain state and as the carrier of call parameters and results.
#[derive(Clone, Default, Eq, PartialEq)]
pub struct Dict(BTreeMap<Vec<u8>, Vec<u8>>);

impl Dict {
    /// An empty dictionary.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style set.
    pub fn with(mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Self {
        self.0.insert(key.as_ref().to_vec(), value.as_ref().to_vec());
        self
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the dictionary is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Borrowing lookup.
    pub fn get_ref(&self, key: &[u8]) -> Option<&[u8]> {
        self.0.get(key).map(Vec::as_slice)
    }

    /// Iterates entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&Vec<u8>, &Vec<u8>)> {
        self.0.iter()
    }

    /// Canonical binary form: `u32` entry count, then for each entry a
    /// `u16`-prefixed key and a `u32`-prefixed value, in key order.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.put_u32_le(self.0.len() as u32);
        for (k, v) in &self.0 {
            out.put_u16_le(k.len() as u16);
            out.put_slice(k);
            out.put_u32_le(v.len() as u32);
            out.put_slice(v);
        }
        out
    }

    /// Parses the form produced by [`Dict::to_bytes`].
    pub fn from_bytes(mut data: &[u8]) -> KvResult<Self> {
        fn take(data: &mut &[u8], n: usize) -> KvResult<Vec<u8>> {
            if data.remaining() < n {
                return Err(KvDecodeError::Truncated("dict"));
            }
            let (head, tail) = data.split_at(n);
            *data = tail;
            Ok(head.to_vec())
        }
        if data.remaining() < 4 {
            return Err(KvDecodeError::Truncated("dict"));
        }
        let count = data.get_u32_le();
        let mut ret = BTreeMap::new();
        for _ in 0..count {
            if data.remaining() < 2 {
                return Err(KvDecodeError::Truncated("dict"));
            }
            let klen = data.get_u16_le() as usize;
            let k = take(&mut data, klen)?;
            if data.remaining() < 4 {
                return Err(KvDecodeError::Truncated("dict"));
            }
            let vlen = data.get_u32_le() as usize;
            let v = take(&mut data, vlen)?;
            ret.insert(k, v);
        }
        if data.has_remaining() {
            return Err(KvDecodeError::Trailing("dict"));
        }
        Ok(Self(ret))
    }
}

impl KvReader for Dict {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.0.get(key).cloned()
    }

    fn has(&self, key: &[u8]) -> bool {
        self.0.contains_key(key)
    }

    fn iterate(&self, prefix: &[u8], f: &mut dyn FnMut(&[u8], &[u8]) -> bool) {
        for (k, v) in self.0.range(prefix.to_vec()..) {
            if !k.starts_with(prefix) || !f(k, v) {
                break;
            }
        }
    }
}

impl KvWriter for Dict {
    fn set(&mut self, key: &[u8], value: &[u8]) {
        self.0.insert(key.to_vec(), value.to_vec());
    }

    fn del(&mut self, key: &[u8]) {
        self.0.remove(key);
    }
}

impl FromIterator<(Vec<u8>, Vec<u8>)> for Dict {
    fn from_iter<T: IntoIterator<Item = (Vec<u8>, Vec<u8>)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Debug for Dict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                self.0
                    .iter()
                    .map(|(k, v)| (String::from_utf8_lossy(k), hex::encode(v))),
            )
            .finish()
    }
}
