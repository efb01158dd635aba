//! Write buffers on top of a read-only store.

use std::collections::{BTreeMap, BTreeSet};

use crate::kv::{KvReader, KvWriter};

/// A set of pending writes. A key is either set or deleted, never both.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Mutations {
    sets: BTreeMap<Vec<u8>, Vec<u8>>,
    dels: BTreeSet<Vec<u8>>,
}

impl Mutations {
    /// An empty set of writes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a write.
    pub fn set(&mut self, key: &[u8], value: &[u8]) {
        self.dels.remove(key);
        self.sets.insert(key.to_vec(), value.to_vec());
    }

    /// Records a deletion.
    pub fn del(&mut self, key: &[u8]) {
        self.sets.remove(key);
        self.dels.insert(key.to_vec());
    }

    /// Whether no write is recorded.
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty() && self.dels.is_empty()
    }

    /// Number of touched keys.
    pub fn len(&self) -> usize {
        self.sets.len() + self.dels.len()
    }

    /// The recorded value of `key`: `Some(Some(v))` if set, `Some(None)` if
    /// deleted, `None` if untouched.
    pub fn lookup(&self, key: &[u8]) -> Option<Option<&[u8]>> {
        if let Some(v) = self.sets.get(key) {
            return Some(Some(v));
        }
        self.dels.contains(key).then_some(None)
    }

    /// Iterates recorded sets in key order.
    pub fn sets(&self) -> impl Iterator<Item = (&Vec<u8>, &Vec<u8>)> {
        self.sets.iter()
    }

    /// Iterates recorded deletions in key order.
    pub fn dels(&self) -> impl Iterator<Item = &Vec<u8>> {
        self.dels.iter()
    }

    /// Applies later writes on top of these ones.
    pub fn merge(&mut self, later: Mutations) {
        for k in later.dels {
            self.sets.remove(&k);
            self.dels.insert(k);
        }
        for (k, v) in later.sets {
            self.dels.remove(&k);
            self.sets.insert(k, v);
        }
    }

    /// Writes everything to `target`.
    pub fn apply_to<W: KvWriter + ?Sized>(&self, target: &mut W) {
        for k in &self.dels {
            target.del(k);
        }
        for (k, v) in &self.sets {
            target.set(k, v);
        }
    }
}

/// A store that reads through to `base` and keeps its own writes in memory.
///
/// Nothing reaches `base` until the buffer's [`Mutations`] are applied by the
/// owner of the base store; dropping the buffer discards them.
#[derive(Debug)]
pub struct BufferedKvStore<R> {
    base: R,
    muts: Mutations,
}

impl<R: KvReader> BufferedKvStore<R> {
    /// An empty buffer over `base`.
    pub fn new(base: R) -> Self {
        Self {
            base,
            muts: Mutations::new(),
        }
    }

    /// The pending writes.
    pub fn mutations(&self) -> &Mutations {
        &self.muts
    }

    /// Consumes the buffer, returning the pending writes.
    pub fn into_mutations(self) -> Mutations {
        self.muts
    }

    /// Drops the pending writes.
    pub fn discard(&mut self) {
        self.muts = Mutations::new();
    }

    /// Takes the pending writes, leaving the buffer empty.
    pub fn take_mutations(&mut self) -> Mutations {
        std::mem::take(&mut self.muts)
    }

    /// Adds already-recorded writes, e.g. those of a nested buffer that
    /// succeeded.
    pub fn absorb(&mut self, muts: Mutations) {
        self.muts.merge(muts);
    }

    /// The store the buffer reads through to.
    pub fn base(&self) -> &R {
        &self.base
    }
}

impl<R: KvReader> KvReader for BufferedKvStore<R> {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        match self.muts.lookup(key) {
            Some(v) => v.map(<[u8]>::to_vec),
            None => self.base.get(key),
        }
    }

    fn has(&self, key: &[u8]) -> bool {
        match self.muts.lookup(key) {
            Some(v) => v.is_some(),
            None => self.base.has(key),
        }
    }

    fn iterate(&self, prefix: &[u8], f: &mut dyn FnMut(&[u8], &[u8]) -> bool) {
        let mut merged = BTreeMap::new();
        self.base.iterate(prefix, &mut |k, v| {
            if !self.muts.dels.contains(k) {
                merged.insert(k.to_vec(), v.to_vec());
            }
            true
        });
        for (k, v) in self.muts.sets.range(prefix.to_vec()..) {
            if !k.starts_with(prefix) {
                break;
            }
            merged.insert(k.clone(), v.clone());
        }
        for (k, v) in &merged {
            if !f(k, v) {
                break;
            }
        }
    }
}

impl<R: KvReader> KvWriter for BufferedKvStore<R> {
    fn set(&mut self, key: &[u8], value: &[u8]) {
        self.muts.set(key, value);
    }

    fn del(&mut self, key: &[u8]) {
        self.muts.del(key);
    }
}
