//! Prefixed views over a store.

use crate::kv::{KvReader, KvWriter};

/// A view of `store` restricted to the keys under `prefix`, with the prefix
/// stripped. Writes through the view land under the prefix of the
/// underlying store.
#[derive(Debug)]
pub struct SubRealm<S> {
    store: S,
    prefix: Vec<u8>,
}

impl<S> SubRealm<S> {
    /// Creates the view.
    pub fn new(store: S, prefix: impl Into<Vec<u8>>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    /// The prefix of this view.
    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    fn full_key(&self, key: &[u8]) -> Vec<u8> {
        [self.prefix.as_slice(), key].concat()
    }
}

impl<S: KvReader> KvReader for SubRealm<S> {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.store.get(&self.full_key(key))
    }

    fn has(&self, key: &[u8]) -> bool {
        self.store.has(&self.full_key(key))
    }

    fn iterate(&self, prefix: &[u8], f: &mut dyn FnMut(&[u8], &[u8]) -> bool) {
        let strip = self.prefix.len();
        self.store
            .iterate(&self.full_key(prefix), &mut |k, v| f(&k[strip..], v));
    }
}

impl<S: KvWriter> KvWriter for SubRealm<S> {
    fn set(&mut self, key: &[u8], value: &[u8]) {
        let k = self.full_key(key);
        self.store.set(&k, value);
    }

    fn del(&mut self, key: &[u8]) {
        let k = self.full_key(key);
        self.store.del(&k);
    }
}
