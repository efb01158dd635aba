//! The key-value state of a chain.
//!
//! A chain's state is a flat, ordered map from byte keys to byte values.
//! Core contracts and the EVM each own a [`SubRealm`] of it, i.e. all keys
//! under a reserved prefix. Every request executes against a
//! [`BufferedKvStore`] that records [`Mutations`] on top of the committed
//! state, so that a failed request can be dropped without touching anything
//! else.
//!
//! Committed state lives in a [`StateDb`], which keeps a hashed Patricia
//! trie in sync with the map. The root of that trie is the
//! [`L1Commitment`] placed in the anchor output after each block.

#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_debug_implementations)]
#![deny(missing_docs)]

pub mod buffered;
pub mod codec;
pub mod collections;
pub mod dict;
pub mod kv;
pub mod nibbles;
pub mod state;
pub mod subrealm;
pub mod trie;

pub use buffered::{BufferedKvStore, Mutations};
pub use codec::{KvDecodeError, KvResult};
pub use dict::Dict;
pub use kv::{KvReader, KvStore, KvWriter};
pub use state::{L1Commitment, StateDb};
pub use subrealm::SubRealm;

#[cfg(test)]
pub(crate) mod testing_utils {
    use std::sync::Once;

    static INIT: Once = Once::new();

    pub(crate) fn common_setup() {
        // Try init since multiple tests calling `init` will cause an error.
        INIT.call_once(|| {
            let _ = pretty_env_logger::try_init();
        });
    }
}
