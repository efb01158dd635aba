//! Ledger addresses.

use std::fmt;

use bytes::{Buf, BufMut};
use keccak_hash::keccak;
use serde::{Deserialize, Serialize};

use crate::codec::{read_array, read_u8, CodecError, CodecResult, Packable};
use crate::ids::{AliasId, NftId};

/// Type byte of an Ed25519 address.
pub const ED25519_ADDRESS_KIND: u8 = 0;
/// Type byte of an alias address.
pub const ALIAS_ADDRESS_KIND: u8 = 8;
/// Type byte of an NFT address.
pub const NFT_ADDRESS_KIND: u8 = 16;

/// Address derived from an Ed25519 public key.
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize)]
pub struct Ed25519Address(pub [u8; 32]);

impl Ed25519Address {
    /// Derives the address controlled by `public_key`.
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        Self(keccak(public_key).0)
    }
}

impl fmt::Debug for Ed25519Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ed25519Address(0x{})", hex::encode(self.0))
    }
}

/// Any address an output can be locked to.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize)]
pub enum Address {
    /// Unlocked by a signature of the matching key.
    Ed25519(Ed25519Address),
    /// Unlocked by the state transition of an alias output.
    Alias(AliasId),
    /// Unlocked by the transition of an NFT output.
    Nft(NftId),
}

impl Address {
    /// The type byte of the address.
    pub const fn kind(&self) -> u8 {
        match self {
            Address::Ed25519(_) => ED25519_ADDRESS_KIND,
            Address::Alias(_) => ALIAS_ADDRESS_KIND,
            Address::Nft(_) => NFT_ADDRESS_KIND,
        }
    }

    /// The alias id if this is an alias address.
    pub const fn as_alias(&self) -> Option<&AliasId> {
        match self {
            Address::Alias(id) => Some(id),
            _ => None,
        }
    }

    /// Whether this is an Ed25519 address.
    pub const fn is_ed25519(&self) -> bool {
        matches!(self, Address::Ed25519(_))
    }

    fn body(&self) -> &[u8; 32] {
        match self {
            Address::Ed25519(a) => &a.0,
            Address::Alias(a) => a.as_bytes(),
            Address::Nft(a) => a.as_bytes(),
        }
    }
}

impl From<AliasId> for Address {
    fn from(v: AliasId) -> Self {
        Address::Alias(v)
    }
}

impl From<NftId> for Address {
    fn from(v: NftId) -> Self {
        Address::Nft(v)
    }
}

impl From<Ed25519Address> for Address {
    fn from(v: Ed25519Address) -> Self {
        Address::Ed25519(v)
    }
}

impl Packable for Address {
    fn pack<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.kind());
        buf.put_slice(self.body());
    }

    fn unpack<B: Buf>(buf: &mut B) -> CodecResult<Self> {
        let kind = read_u8(buf)?;
        let body: [u8; 32] = read_array(buf)?;
        match kind {
            ED25519_ADDRESS_KIND => Ok(Address::Ed25519(Ed25519Address(body))),
            ALIAS_ADDRESS_KIND => Ok(Address::Alias(AliasId(body))),
            NFT_ADDRESS_KIND => Ok(Address::Nft(NftId(body))),
            kind => Err(CodecError::UnknownKind {
                what: "address",
                kind,
            }),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self {
            Address::Ed25519(_) => "ed25519",
            Address::Alias(_) => "alias",
            Address::Nft(_) => "nft",
        };
        write!(f, "{prefix}:0x{}", hex::encode(self.body()))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}
