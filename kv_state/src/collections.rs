//! Named arrays and maps laid out over flat keys.
//!
//! An array `name` stores its length under `name` and element `i` under
//! `name#<i as u32 big-endian>`, so that elements iterate in index order.
//! A map `name` stores its size under `name` and the value of `k` under
//! `name.<k>`.

use crate::codec::{decode_u32, encode_u32, KvResult};
use crate::kv::{KvReader, KvWriter};

/// An append-only array of byte values.
#[derive(Debug)]
pub struct KvArray<S> {
    store: S,
    name: Vec<u8>,
}

impl<S> KvArray<S> {
    /// The array called `name` in `store`.
    pub fn new(store: S, name: impl Into<Vec<u8>>) -> Self {
        Self {
            store,
            name: name.into(),
        }
    }

    fn elem_key(&self, index: u32) -> Vec<u8> {
        let mut k = self.name.clone();
        k.push(b'#');
        k.extend_from_slice(&index.to_be_bytes());
        k
    }
}

impl<S: KvReader> KvArray<S> {
    /// Number of elements.
    pub fn len(&self) -> KvResult<u32> {
        self.store
            .get(&self.name)
            .map_or(Ok(0), |b| decode_u32(&b))
    }

    /// Whether the array is empty.
    pub fn is_empty(&self) -> KvResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Element at `index`, if within bounds.
    pub fn get_at(&self, index: u32) -> KvResult<Option<Vec<u8>>> {
        if index >= self.len()? {
            return Ok(None);
        }
        Ok(self.store.get(&self.elem_key(index)))
    }
}

impl<S: KvReader + KvWriter> KvArray<S> {
    /// Appends `value`, returning its index.
    pub fn push(&mut self, value: &[u8]) -> KvResult<u32> {
        let index = self.len()?;
        let k = self.elem_key(index);
        self.store.set(&k, value);
        self.store.set(&self.name.clone(), &encode_u32(index + 1));
        Ok(index)
    }

    /// Overwrites the element at `index`. Returns `false` when out of bounds.
    pub fn set_at(&mut self, index: u32, value: &[u8]) -> KvResult<bool> {
        if index >= self.len()? {
            return Ok(false);
        }
        let k = self.elem_key(index);
        self.store.set(&k, value);
        Ok(true)
    }
}

/// A map from byte keys to byte values.
#[derive(Debug)]
pub struct KvMap<S> {
    store: S,
    name: Vec<u8>,
}

impl<S> KvMap<S> {
    /// The map called `name` in `store`.
    pub fn new(store: S, name: impl Into<Vec<u8>>) -> Self {
        Self {
            store,
            name: name.into(),
        }
    }

    fn elem_prefix(&self) -> Vec<u8> {
        let mut k = self.name.clone();
        k.push(b'.');
        k
    }

    fn elem_key(&self, key: &[u8]) -> Vec<u8> {
        let mut k = self.elem_prefix();
        k.extend_from_slice(key);
        k
    }
}

impl<S: KvReader> KvMap<S> {
    /// Number of entries.
    pub fn len(&self) -> KvResult<u32> {
        self.store
            .get(&self.name)
            .map_or(Ok(0), |b| decode_u32(&b))
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> KvResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Value of `key`.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.store.get(&self.elem_key(key))
    }

    /// Whether `key` is present.
    pub fn has(&self, key: &[u8]) -> bool {
        self.store.has(&self.elem_key(key))
    }

    /// Visits entries in key order until `f` returns `false`.
    pub fn iterate(&self, f: &mut dyn FnMut(&[u8], &[u8]) -> bool) {
        let prefix = self.elem_prefix();
        let strip = prefix.len();
        self.store.iterate(&prefix, &mut |k, v| f(&k[strip..], v));
    }

    /// All keys in order.
    pub fn keys(&self) -> Vec<Vec<u8>> {
        let mut ret = Vec::new();
        self.iterate(&mut |k, _| {
            ret.push(k.to_vec());
            true
        });
        ret
    }
}

impl<S: KvReader + KvWriter> KvMap<S> {
    /// Sets `key` to `value`, maintaining the size.
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> KvResult<()> {
        let k = self.elem_key(key);
        if !self.store.has(&k) {
            let size = self.len()?;
            self.store.set(&self.name.clone(), &encode_u32(size + 1));
        }
        self.store.set(&k, value);
        Ok(())
    }

    /// Removes `key`, maintaining the size.
    pub fn del(&mut self, key: &[u8]) -> KvResult<()> {
        let k = self.elem_key(key);
        if self.store.has(&k) {
            let size = self.len()?;
            let name = self.name.clone();
            match size {
                0 | 1 => self.store.del(&name),
                _ => self.store.set(&name, &encode_u32(size - 1)),
            }
            self.store.del(&k);
        }
        Ok(())
    }

    /// Removes every entry.
    pub fn erase(&mut self) -> KvResult<()> {
        for k in self.keys() {
            self.del(&k)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dict::Dict;

    #[test]
    fn array_push_and_bounds() {
        let mut d = Dict::new();
        let mut arr = KvArray::new(&mut d, "r");
        assert_eq!(arr.push(b"one").unwrap(), 0);
        assert_eq!(arr.push(b"two").unwrap(), 1);
        assert_eq!(arr.len().unwrap(), 2);
        assert_eq!(arr.get_at(1).unwrap(), Some(b"two".to_vec()));
        assert_eq!(arr.get_at(2).unwrap(), None);
        assert!(!arr.set_at(5, b"x").unwrap());
    }

    #[test]
    fn map_tracks_size() {
        let mut d = Dict::new();
        let mut m = KvMap::new(&mut d, "m");
        m.set(b"a", b"1").unwrap();
        m.set(b"a", b"2").unwrap();
        m.set(b"b", b"3").unwrap();
        assert_eq!(m.len().unwrap(), 2);
        assert_eq!(m.keys(), vec![b"a".to_vec(), b"b".to_vec()]);
        m.del(b"a").unwrap();
        m.del(b"missing").unwrap();
        assert_eq!(m.len().unwrap(), 1);
        m.erase().unwrap();
        assert!(m.is_empty().unwrap());
        assert!(d.is_empty());
    }
}
