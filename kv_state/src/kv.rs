//! Access traits over byte-keyed stores.

/// Read access to an ordered key-value store.
pub trait KvReader {
    /// Value stored under `key`.
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    /// Whether `key` is present.
    fn has(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    /// Visits, in key order, every entry whose key starts with `prefix`,
    /// stopping early when `f` returns `false`.
    fn iterate(&self, prefix: &[u8], f: &mut dyn FnMut(&[u8], &[u8]) -> bool);

    /// Like [`KvReader::iterate`] but only yields keys.
    fn iterate_keys(&self, prefix: &[u8], f: &mut dyn FnMut(&[u8]) -> bool) {
        self.iterate(prefix, &mut |k, _| f(k));
    }

    /// Collects all entries under `prefix`.
    fn entries(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut ret = Vec::new();
        self.iterate(prefix, &mut |k, v| {
            ret.push((k.to_vec(), v.to_vec()));
            true
        });
        ret
    }
}

/// Write access to a key-value store.
pub trait KvWriter {
    /// Stores `value` under `key`.
    fn set(&mut self, key: &[u8], value: &[u8]);

    /// Removes `key`.
    fn del(&mut self, key: &[u8]);
}

/// A store that can be both read and written.
pub trait KvStore: KvReader + KvWriter {}

impl<T: KvReader + KvWriter + ?Sized> KvStore for T {}

impl<R: KvReader + ?Sized> KvReader for &R {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        (**self).get(key)
    }

    fn has(&self, key: &[u8]) -> bool {
        (**self).has(key)
    }

    fn iterate(&self, prefix: &[u8], f: &mut dyn FnMut(&[u8], &[u8]) -> bool) {
        (**self).iterate(prefix, f)
    }
}

impl<R: KvReader + ?Sized> KvReader for &mut R {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        (**self).get(key)
    }

    fn has(&self, key: &[u8]) -> bool {
        (**self).has(key)
    }

    fn iterate(&self, prefix: &[u8], f: &mut dyn FnMut(&[u8], &[u8]) -> bool) {
        (**self).iterate(prefix, f)
    }
}

impl<W: KvWriter + ?Sized> KvWriter for &mut W {
    fn set(&mut self, key: &[u8], value: &[u8]) {
        (**self).set(key, value)
    }

    fn del(&mut self, key: &[u8]) {
        (**self).del(key)
    }
}

/// Concatenates key parts.
pub fn key_join(parts: &[&[u8]]) -> Vec<u8> {
    parts.concat()
}
