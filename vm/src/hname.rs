//! 32-bit hashed names of contracts and entry points.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use keccak_hash::keccak;
use kv_state::codec::{decode_u32, KvDecodeError, KvResult};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Hashed values below this bound are reserved for special meanings and are
/// never produced from a name.
pub const RESERVED_HNAME_BOUND: u32 = 0x100;

/// A hashed name.
#[derive(
    Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize,
)]
pub struct Hname(pub u32);

impl Hname {
    /// The reserved empty name.
    pub const NIL: Hname = Hname(0);

    /// Hashes `name`. The hash is re-done with a `_` appended as long as it
    /// lands in the reserved range or on `u32::MAX`.
    pub fn from_name(name: &str) -> Self {
        let mut input = name.as_bytes().to_vec();
        loop {
            let h = keccak(&input);
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&h.as_bytes()[..4]);
            let v = u32::from_le_bytes(raw);
            if v >= RESERVED_HNAME_BOUND && v != u32::MAX {
                return Hname(v);
            }
            input.push(b'_');
        }
    }

    /// Little-endian bytes; also the state prefix of a contract.
    pub const fn to_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    /// Parses the form produced by [`Hname::to_bytes`].
    pub fn from_bytes(b: &[u8]) -> KvResult<Self> {
        decode_u32(b).map(Hname)
    }

    /// Whether this is [`Hname::NIL`].
    pub const fn is_nil(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Hname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl fmt::Debug for Hname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hname({:08x})", self.0)
    }
}

impl FromStr for Hname {
    type Err = KvDecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u32::from_str_radix(s, 16)
            .map(Hname)
            .map_err(|_| KvDecodeError::Invalid("hname"))
    }
}

/// Two distinct names hash to the same value.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
#[error("name {name:?} collides with {existing:?} (hname {hname})")]
pub struct HnameCollision {
    /// The name being registered.
    pub name: String,
    /// The name already holding the hash.
    pub existing: String,
    /// The shared hash.
    pub hname: Hname,
}

/// Names registered within one scope, e.g. the entry points of a contract.
#[derive(Clone, Debug, Default)]
pub struct HnameRegistry(HashMap<Hname, String>);

impl HnameRegistry {
    /// Registers `name`, failing if its hash is taken by another name.
    /// Registering the same name twice is allowed.
    pub fn register(&mut self, name: &str) -> Result<Hname, HnameCollision> {
        let hname = Hname::from_name(name);
        match self.0.get(&hname) {
            Some(existing) if existing != name => Err(HnameCollision {
                name: name.to_owned(),
                existing: existing.clone(),
                hname,
            }),
            _ => {
                self.0.insert(hname, name.to_owned());
                Ok(hname)
            }
        }
    }

    /// The name registered under `hname`.
    pub fn name_of(&self, hname: Hname) -> Option<&str> {
        self.0.get(&hname).map(String::as_str)
    }
}
