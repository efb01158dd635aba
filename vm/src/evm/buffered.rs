//! Buffered view over the EVM state database.

use std::ops::{Deref, DerefMut};

use kv_state::{BufferedKvStore, KvReader, Mutations};

use super::{EvmLog, EvmStateDb};

/// An [`EvmStateDb`] whose writes stay in memory until committed.
///
/// Every EVM transaction runs on one of these; only a successful run hands
/// its mutations to the owner of the base store.
#[derive(Debug)]
pub struct BufferedStateDb<R: KvReader> {
    db: EvmStateDb<BufferedKvStore<R>>,
}

impl<R: KvReader> BufferedStateDb<R> {
    /// A buffer over `base`.
    pub fn new(base: R) -> Self {
        Self {
            db: EvmStateDb::new(BufferedKvStore::new(base)),
        }
    }

    /// Finishes the buffer, returning the writes to apply to the base and the
    /// logs recorded.
    pub fn commit(self) -> (Mutations, Vec<EvmLog>) {
        let (kv, logs) = self.db.into_parts();
        (kv.into_mutations(), logs)
    }

    /// Drops every buffered write and log.
    pub fn discard(&mut self) {
        self.db.kv_mut().discard();
        self.db.take_logs();
    }
}

impl<R: KvReader> Deref for BufferedStateDb<R> {
    type Target = EvmStateDb<BufferedKvStore<R>>;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

impl<R: KvReader> DerefMut for BufferedStateDb<R> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.db
    }
}
