//! Fixed-size identifiers of ledger objects.

use std::fmt;
use std::str::FromStr;

use bytes::{Buf, BufMut};
use keccak_hash::keccak;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::codec::{read_array, read_u16, CodecError, CodecResult, Packable};

macro_rules! impl_fixed_id {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
        pub struct $name(pub [u8; $len]);

        impl Default for $name {
            fn default() -> Self {
                Self::null()
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }

        impl $name {
            /// Length of the identifier in bytes.
            pub const LEN: usize = $len;

            /// The all-zero identifier.
            pub const fn null() -> Self {
                Self([0; $len])
            }

            /// Whether this is the all-zero identifier.
            pub fn is_null(&self) -> bool {
                self.0.iter().all(|b| *b == 0)
            }

            /// Raw bytes of the identifier.
            pub const fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(v: [u8; $len]) -> Self {
                Self(v)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{}", hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl FromStr for $name {
            type Err = CodecError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let raw = hex::decode(s.trim_start_matches("0x"))
                    .map_err(|e| CodecError::Invalid(e.to_string()))?;
                let arr: [u8; $len] = raw.try_into().map_err(|_| {
                    CodecError::Invalid(format!("{} must be {} bytes", stringify!($name), $len))
                })?;
                Ok(Self(arr))
            }
        }

        impl Packable for $name {
            fn pack<B: BufMut>(&self, buf: &mut B) {
                buf.put_slice(&self.0);
            }

            fn unpack<B: Buf>(buf: &mut B) -> CodecResult<Self> {
                read_array(buf).map(Self)
            }
        }
    };
}

impl_fixed_id!(
    /// Hash of a packed transaction.
    TransactionId,
    32
);
impl_fixed_id!(
    /// Hash of a packed block.
    BlockId,
    32
);
impl_fixed_id!(
    /// Stable identifier of an alias output. A chain is identified by the
    /// alias id of its anchor.
    AliasId,
    32
);
impl_fixed_id!(
    /// Stable identifier of an NFT output.
    NftId,
    32
);
impl_fixed_id!(
    /// Identifier of a foundry: the controlling alias address, the foundry
    /// serial number and the token scheme kind.
    FoundryId,
    38
);

/// Native tokens are identified by the foundry that controls their supply.
pub type TokenId = FoundryId;

impl AliasId {
    /// Derives the id of an alias created by the output `output_id`.
    pub fn from_output_id(output_id: &OutputId) -> Self {
        Self(keccak(output_id.to_bytes()).0)
    }

    /// Returns `self`, or the id derived from `output_id` when `self` is null
    /// (a freshly created alias does not carry its own id yet).
    pub fn or_from_output_id(self, output_id: &OutputId) -> Self {
        match self.is_null() {
            true => Self::from_output_id(output_id),
            false => self,
        }
    }
}

impl NftId {
    /// Derives the id of an NFT minted by the output `output_id`.
    pub fn from_output_id(output_id: &OutputId) -> Self {
        Self(keccak(output_id.to_bytes()).0)
    }

    /// See [`AliasId::or_from_output_id`].
    pub fn or_from_output_id(self, output_id: &OutputId) -> Self {
        match self.is_null() {
            true => Self::from_output_id(output_id),
            false => self,
        }
    }
}

impl FoundryId {
    /// Builds the id of the foundry numbered `serial_number` controlled by the
    /// alias `alias_id`.
    pub fn build(alias_id: &AliasId, serial_number: u32, token_scheme_kind: u8) -> Self {
        let mut raw = [0; 38];
        raw[0] = crate::address::ALIAS_ADDRESS_KIND;
        raw[1..33].copy_from_slice(alias_id.as_bytes());
        raw[33..37].copy_from_slice(&serial_number.to_le_bytes());
        raw[37] = token_scheme_kind;
        Self(raw)
    }

    /// The alias that controls this foundry.
    pub fn alias_id(&self) -> AliasId {
        let mut raw = [0; 32];
        raw.copy_from_slice(&self.0[1..33]);
        AliasId(raw)
    }

    /// The serial number of the foundry within its alias.
    pub fn serial_number(&self) -> u32 {
        let mut raw = [0; 4];
        raw.copy_from_slice(&self.0[33..37]);
        u32::from_le_bytes(raw)
    }
}

/// Points to an output of a transaction.
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize)]
pub struct OutputId {
    /// The transaction that created the output.
    pub transaction_id: TransactionId,
    /// Position of the output in the transaction.
    pub index: u16,
}

impl OutputId {
    /// Length of the packed form.
    pub const LEN: usize = TransactionId::LEN + 2;

    /// Creates an output id.
    pub const fn new(transaction_id: TransactionId, index: u16) -> Self {
        Self {
            transaction_id,
            index,
        }
    }
}

impl Packable for OutputId {
    fn pack<B: BufMut>(&self, buf: &mut B) {
        self.transaction_id.pack(buf);
        buf.put_u16_le(self.index);
    }

    fn unpack<B: Buf>(buf: &mut B) -> CodecResult<Self> {
        Ok(Self {
            transaction_id: TransactionId::unpack(buf)?,
            index: read_u16(buf)?,
        })
    }
}

impl fmt::Display for OutputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.transaction_id, self.index)
    }
}

impl fmt::Debug for OutputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OutputId({})", self)
    }
}

impl FromStr for OutputId {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (tx, index) = s
            .split_once(':')
            .ok_or_else(|| CodecError::Invalid(format!("malformed output id {s}")))?;
        let index = index
            .parse()
            .map_err(|_| CodecError::Invalid(format!("malformed output index {index}")))?;
        Ok(Self::new(tx.parse()?, index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_id_string_form_parses_back() {
        let id = OutputId::new(TransactionId([7; 32]), 3);
        let s = id.to_string();
        assert!(s.ends_with(":3"));
        assert_eq!(s.parse::<OutputId>().unwrap(), id);
    }

    #[test]
    fn foundry_id_exposes_its_parts() {
        let alias = AliasId([9; 32]);
        let id = FoundryId::build(&alias, 42, 0);
        assert_eq!(id.alias_id(), alias);
        assert_eq!(id.serial_number(), 42);
    }

    #[test]
    fn null_alias_id_is_derived_from_output() {
        let oid = OutputId::new(TransactionId([1; 32]), 0);
        let derived = AliasId::null().or_from_output_id(&oid);
        assert!(!derived.is_null());
        assert_eq!(derived, AliasId::from_output_id(&oid));
        assert_eq!(AliasId([5; 32]).or_from_output_id(&oid), AliasId([5; 32]));
    }

    #[test]
    fn ids_serialize_as_hex_strings() {
        let id = FoundryId::build(&AliasId([0xab; 32]), 1, 0);
        let json = serde_json::to_string(&id).unwrap();
        assert!(json.starts_with("\"0x08abab"));
        assert_eq!(serde_json::from_str::<FoundryId>(&json).unwrap(), id);
    }
}
