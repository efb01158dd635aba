//! Committed chain state and its L1 commitment.

use std::fmt;
use std::str::FromStr;

use ethereum_types::H256;
use log::trace;
use serde::{Deserialize, Serialize};

use crate::buffered::Mutations;
use crate::codec::KvDecodeError;
use crate::dict::Dict;
use crate::kv::{KvReader, KvWriter};
use crate::trie::StateTrie;

/// The 32-byte digest of a chain state, carried as the state metadata of the
/// anchor output.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct L1Commitment(pub H256);

impl L1Commitment {
    /// Byte length of a commitment.
    pub const LEN: usize = 32;

    /// Bytes as stored in an anchor's state metadata.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.as_bytes().to_vec()
    }

    /// Parses anchor state metadata.
    pub fn from_bytes(b: &[u8]) -> Result<Self, KvDecodeError> {
        if b.len() != Self::LEN {
            return Err(KvDecodeError::WrongLength {
                what: "L1 commitment",
                expected: Self::LEN,
                got: b.len(),
            });
        }
        Ok(Self(H256::from_slice(b)))
    }
}

impl fmt::Display for L1Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

impl FromStr for L1Commitment {
    type Err = KvDecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s.trim_start_matches("0x"))
            .map_err(|_| KvDecodeError::Invalid("L1 commitment hex"))?;
        Self::from_bytes(&raw)
    }
}

/// An in-memory committed chain state: the flat map plus the trie that
/// commits to it. Only a chain's own task writes to it, by committing the
/// mutations of a produced block.
#[derive(Clone, Debug, Default)]
pub struct StateDb {
    kv: Dict,
    trie: StateTrie,
}

impl StateDb {
    /// An empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `muts` and returns the commitment to the resulting state.
    pub fn commit(&mut self, muts: &Mutations) -> L1Commitment {
        trace!("Committing {} mutations", muts.len());
        for k in muts.dels() {
            self.kv.del(k);
            self.trie.delete(k);
        }
        for (k, v) in muts.sets() {
            self.kv.set(k, v);
            self.trie.insert(k, v.clone());
        }
        self.commitment()
    }

    /// The commitment `muts` would produce, leaving this state untouched.
    pub fn commitment_after(&self, muts: &Mutations) -> L1Commitment {
        let mut trie = self.trie.clone();
        for k in muts.dels() {
            trie.delete(k);
        }
        for (k, v) in muts.sets() {
            trie.insert(k, v.clone());
        }
        L1Commitment(trie.hash())
    }

    /// The commitment to the current state.
    pub fn commitment(&self) -> L1Commitment {
        L1Commitment(self.trie.hash())
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.kv.len()
    }

    /// Whether the state holds nothing.
    pub fn is_empty(&self) -> bool {
        self.kv.is_empty()
    }
}

impl KvReader for StateDb {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.kv.get(key)
    }

    fn has(&self, key: &[u8]) -> bool {
        self.kv.has(key)
    }

    fn iterate(&self, prefix: &[u8], f: &mut dyn FnMut(&[u8], &[u8]) -> bool) {
        self.kv.iterate(prefix, f)
    }
}

#[cfg(test)]
mod tests {
    use anchor_common::EMPTY_TRIE_HASH;

    use super::*;
    use crate::buffered::BufferedKvStore;

    #[test]
    fn commitment_tracks_content_not_history() {
        let mut a = StateDb::new();
        assert_eq!(a.commitment().0, EMPTY_TRIE_HASH);

        let mut m1 = Mutations::new();
        m1.set(b"x", b"1");
        m1.set(b"y", b"2");
        a.commit(&m1);
        let mut m2 = Mutations::new();
        m2.del(b"x");
        let after_two = a.commit(&m2);

        let mut b = StateDb::new();
        let mut only = Mutations::new();
        only.set(b"y", b"2");
        assert_eq!(b.commit(&only), after_two);
        assert_eq!(a.len(), 1);
    }

    #[test]
    fn preview_matches_commit() {
        let mut db = StateDb::new();
        let muts = {
            let mut buf = BufferedKvStore::new(&db);
            buf.set(b"k", b"v");
            buf.into_mutations()
        };
        let preview = db.commitment_after(&muts);
        assert_eq!(db.commitment().0, EMPTY_TRIE_HASH);
        assert_eq!(db.commit(&muts), preview);
        assert_eq!(db.get(b"k"), Some(b"v".to_vec()));
    }

    #[test]
    fn commitment_bytes() {
        let c = L1Commitment(H256::repeat_byte(7));
        assert_eq!(L1Commitment::from_bytes(&c.to_bytes()).unwrap(), c);
        assert!(L1Commitment::from_bytes(&[0; 31]).is_err());
        assert_eq!(c.to_string().parse::<L1Commitment>().unwrap(), c);
    }
}
