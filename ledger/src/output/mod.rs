//! Output types of the ledger.
//!
//! Four kinds of outputs exist:
//! - [`BasicOutput`]: plain value transfer, also the carrier of on-ledger
//!   requests (through its metadata feature).
//! - [`AliasOutput`]: an account-like output with a stable
//!   [`AliasId`](crate::AliasId); a chain anchor is an alias output.
//! - [`FoundryOutput`]: controls the supply of one native token.
//! - [`NftOutput`]: a non-fungible token with a stable [`NftId`].

mod conditions;
mod features;

use bytes::{Buf, BufMut};
use enum_as_inner::EnumAsInner;
use ethereum_types::U256;
use serde::{Deserialize, Serialize};

pub use self::conditions::{UnlockCondition, UnlockConditions};
pub use self::features::{Feature, Features, MAX_METADATA_LEN, MAX_TAG_LEN};
use crate::address::Address;
use crate::codec::{
    read_bytes_u16, read_u256, read_u32, read_u64, read_u8, write_bytes_u16, write_u256,
    CodecError, CodecResult, Packable,
};
use crate::ids::{AliasId, FoundryId, NftId, TokenId};
use crate::tokens::NativeTokens;

/// Maximum length of the state metadata of an alias output.
pub const MAX_STATE_METADATA_LEN: usize = 8192;

/// Kind of the only supported token scheme.
pub const SIMPLE_TOKEN_SCHEME_KIND: u8 = 0;

/// Type byte of each output kind.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize)]
#[repr(u8)]
pub enum OutputKind {
    /// [`BasicOutput`].
    Basic = 3,
    /// [`AliasOutput`].
    Alias = 4,
    /// [`FoundryOutput`].
    Foundry = 5,
    /// [`NftOutput`].
    Nft = 6,
}

/// A plain output holding tokens.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct BasicOutput {
    /// Base tokens held.
    pub amount: u64,
    /// Native tokens held.
    pub native_tokens: NativeTokens,
    /// Conditions for unlocking.
    pub unlock_conditions: UnlockConditions,
    /// Attached features.
    pub features: Features,
}

/// An alias output. The anchor of a chain.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct AliasOutput {
    /// Base tokens held.
    pub amount: u64,
    /// Native tokens held directly by the alias.
    pub native_tokens: NativeTokens,
    /// Stable id; null while the alias is being created.
    pub alias_id: AliasId,
    /// Incremented on every state transition.
    pub state_index: u32,
    /// Opaque data set by the state controller.
    pub state_metadata: Vec<u8>,
    /// Number of foundries ever created by this alias.
    pub foundry_counter: u32,
    /// State controller and governor conditions.
    pub unlock_conditions: UnlockConditions,
    /// Mutable features.
    pub features: Features,
    /// Features fixed at creation.
    pub immutable_features: Features,
}

impl AliasOutput {
    /// The address allowed to perform state transitions.
    pub fn state_controller(&self) -> Option<&Address> {
        self.unlock_conditions.state_controller()
    }

    /// The address allowed to perform governance transitions.
    pub fn governor(&self) -> Option<&Address> {
        self.unlock_conditions.governor()
    }
}

/// Supply accounting of a foundry.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct SimpleTokenScheme {
    /// Total ever minted.
    pub minted_tokens: U256,
    /// Total ever melted.
    pub melted_tokens: U256,
    /// Upper bound of the circulating supply.
    pub maximum_supply: U256,
}

impl SimpleTokenScheme {
    /// Tokens currently in circulation.
    pub fn circulating_supply(&self) -> U256 {
        self.minted_tokens.saturating_sub(self.melted_tokens)
    }
}

/// A foundry output.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct FoundryOutput {
    /// Base tokens held.
    pub amount: u64,
    /// Native tokens held.
    pub native_tokens: NativeTokens,
    /// Serial number within the controlling alias.
    pub serial_number: u32,
    /// Supply accounting.
    pub token_scheme: SimpleTokenScheme,
    /// Must contain the immutable alias condition.
    pub unlock_conditions: UnlockConditions,
    /// Mutable features.
    pub features: Features,
    /// Features fixed at creation.
    pub immutable_features: Features,
}

impl FoundryOutput {
    /// The id of this foundry, if the controlling alias is set.
    pub fn id(&self) -> Option<FoundryId> {
        self.unlock_conditions
            .immutable_alias()
            .map(|alias| FoundryId::build(alias, self.serial_number, SIMPLE_TOKEN_SCHEME_KIND))
    }

    /// The native token whose supply this foundry controls.
    pub fn token_id(&self) -> Option<TokenId> {
        self.id()
    }
}

/// An NFT output.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct NftOutput {
    /// Base tokens held.
    pub amount: u64,
    /// Native tokens held.
    pub native_tokens: NativeTokens,
    /// Stable id; null while the NFT is being minted.
    pub nft_id: NftId,
    /// Conditions for unlocking.
    pub unlock_conditions: UnlockConditions,
    /// Mutable features.
    pub features: Features,
    /// Issuer and immutable metadata.
    pub immutable_features: Features,
}

/// Any output.
#[derive(Clone, Debug, Eq, PartialEq, EnumAsInner, Deserialize, Serialize)]
pub enum Output {
    /// A basic output.
    Basic(BasicOutput),
    /// An alias output.
    Alias(AliasOutput),
    /// A foundry output.
    Foundry(FoundryOutput),
    /// An NFT output.
    Nft(NftOutput),
}

impl Output {
    /// The output kind.
    pub const fn kind(&self) -> OutputKind {
        match self {
            Output::Basic(_) => OutputKind::Basic,
            Output::Alias(_) => OutputKind::Alias,
            Output::Foundry(_) => OutputKind::Foundry,
            Output::Nft(_) => OutputKind::Nft,
        }
    }

    /// Base tokens held.
    pub fn amount(&self) -> u64 {
        match self {
            Output::Basic(o) => o.amount,
            Output::Alias(o) => o.amount,
            Output::Foundry(o) => o.amount,
            Output::Nft(o) => o.amount,
        }
    }

    /// Replaces the base-token amount.
    pub fn set_amount(&mut self, amount: u64) {
        match self {
            Output::Basic(o) => o.amount = amount,
            Output::Alias(o) => o.amount = amount,
            Output::Foundry(o) => o.amount = amount,
            Output::Nft(o) => o.amount = amount,
        }
    }

    /// Native tokens held.
    pub fn native_tokens(&self) -> &NativeTokens {
        match self {
            Output::Basic(o) => &o.native_tokens,
            Output::Alias(o) => &o.native_tokens,
            Output::Foundry(o) => &o.native_tokens,
            Output::Nft(o) => &o.native_tokens,
        }
    }

    /// Unlock conditions.
    pub fn unlock_conditions(&self) -> &UnlockConditions {
        match self {
            Output::Basic(o) => &o.unlock_conditions,
            Output::Alias(o) => &o.unlock_conditions,
            Output::Foundry(o) => &o.unlock_conditions,
            Output::Nft(o) => &o.unlock_conditions,
        }
    }

    /// Mutable features.
    pub fn features(&self) -> &Features {
        match self {
            Output::Basic(o) => &o.features,
            Output::Alias(o) => &o.features,
            Output::Foundry(o) => &o.features,
            Output::Nft(o) => &o.features,
        }
    }
}

// Each kind converts into `Output` and packs as one, kind byte included.
macro_rules! impl_output_kind {
    ($ty:ident, $variant:ident, $into:ident) => {
        impl From<$ty> for Output {
            fn from(v: $ty) -> Self {
                Output::$variant(v)
            }
        }

        impl Packable for $ty {
            fn pack<B: BufMut>(&self, buf: &mut B) {
                Output::$variant(self.clone()).pack(buf);
            }

            fn unpack<B: Buf>(buf: &mut B) -> CodecResult<Self> {
                Output::unpack(buf)?.$into().map_err(|o| CodecError::UnknownKind {
                    what: stringify!($ty),
                    kind: o.kind() as u8,
                })
            }
        }
    };
}

impl_output_kind!(BasicOutput, Basic, into_basic);
impl_output_kind!(AliasOutput, Alias, into_alias);
impl_output_kind!(FoundryOutput, Foundry, into_foundry);
impl_output_kind!(NftOutput, Nft, into_nft);

impl Packable for SimpleTokenScheme {
    fn pack<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(SIMPLE_TOKEN_SCHEME_KIND);
        write_u256(buf, &self.minted_tokens);
        write_u256(buf, &self.melted_tokens);
        write_u256(buf, &self.maximum_supply);
    }

    fn unpack<B: Buf>(buf: &mut B) -> CodecResult<Self> {
        match read_u8(buf)? {
            SIMPLE_TOKEN_SCHEME_KIND => {}
            kind => {
                return Err(CodecError::UnknownKind {
                    what: "token scheme",
                    kind,
                })
            }
        }
        let ret = Self {
            minted_tokens: read_u256(buf)?,
            melted_tokens: read_u256(buf)?,
            maximum_supply: read_u256(buf)?,
        };
        if ret.melted_tokens > ret.minted_tokens
            || ret.circulating_supply() > ret.maximum_supply
            || ret.maximum_supply.is_zero()
        {
            return Err(CodecError::Invalid("inconsistent token scheme".into()));
        }
        Ok(ret)
    }
}

impl Packable for Output {
    fn pack<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.kind() as u8);
        match self {
            Output::Basic(o) => {
                buf.put_u64_le(o.amount);
                o.native_tokens.pack(buf);
                o.unlock_conditions.pack(buf);
                o.features.pack(buf);
            }
            Output::Alias(o) => {
                buf.put_u64_le(o.amount);
                o.native_tokens.pack(buf);
                o.alias_id.pack(buf);
                buf.put_u32_le(o.state_index);
                write_bytes_u16(buf, &o.state_metadata);
                buf.put_u32_le(o.foundry_counter);
                o.unlock_conditions.pack(buf);
                o.features.pack(buf);
                o.immutable_features.pack(buf);
            }
            Output::Foundry(o) => {
                buf.put_u64_le(o.amount);
                o.native_tokens.pack(buf);
                buf.put_u32_le(o.serial_number);
                o.token_scheme.pack(buf);
                o.unlock_conditions.pack(buf);
                o.features.pack(buf);
                o.immutable_features.pack(buf);
            }
            Output::Nft(o) => {
                buf.put_u64_le(o.amount);
                o.native_tokens.pack(buf);
                o.nft_id.pack(buf);
                o.unlock_conditions.pack(buf);
                o.features.pack(buf);
                o.immutable_features.pack(buf);
            }
        }
    }

    fn unpack<B: Buf>(buf: &mut B) -> CodecResult<Self> {
        Ok(match read_u8(buf)? {
            3 => Output::Basic(BasicOutput {
                amount: read_u64(buf)?,
                native_tokens: NativeTokens::unpack(buf)?,
                unlock_conditions: UnlockConditions::unpack(buf)?,
                features: Features::unpack(buf)?,
            }),
            4 => {
                let amount = read_u64(buf)?;
                let native_tokens = NativeTokens::unpack(buf)?;
                let alias_id = AliasId::unpack(buf)?;
                let state_index = read_u32(buf)?;
                let state_metadata = read_bytes_u16(buf)?;
                if state_metadata.len() > MAX_STATE_METADATA_LEN {
                    return Err(CodecError::Invalid("state metadata too long".into()));
                }
                Output::Alias(AliasOutput {
                    amount,
                    native_tokens,
                    alias_id,
                    state_index,
                    state_metadata,
                    foundry_counter: read_u32(buf)?,
                    unlock_conditions: UnlockConditions::unpack(buf)?,
                    features: Features::unpack(buf)?,
                    immutable_features: Features::unpack(buf)?,
                })
            }
            5 => Output::Foundry(FoundryOutput {
                amount: read_u64(buf)?,
                native_tokens: NativeTokens::unpack(buf)?,
                serial_number: read_u32(buf)?,
                token_scheme: SimpleTokenScheme::unpack(buf)?,
                unlock_conditions: UnlockConditions::unpack(buf)?,
                features: Features::unpack(buf)?,
                immutable_features: Features::unpack(buf)?,
            }),
            6 => Output::Nft(NftOutput {
                amount: read_u64(buf)?,
                native_tokens: NativeTokens::unpack(buf)?,
                nft_id: NftId::unpack(buf)?,
                unlock_conditions: UnlockConditions::unpack(buf)?,
                features: Features::unpack(buf)?,
                immutable_features: Features::unpack(buf)?,
            }),
            kind => {
                return Err(CodecError::UnknownKind {
                    what: "output",
                    kind,
                })
            }
        })
    }
}

/// Optional clauses of an output sent by a chain.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct SendOptions {
    /// Output cannot be unlocked before this time.
    pub timelock: Option<u32>,
    /// After `.1`, the output returns to `.0`.
    pub expiration: Option<(Address, u32)>,
}

/// Creates a basic output sending `tokens` to `target`.
///
/// When `sender` is given a sender feature is attached; `metadata` becomes
/// the metadata feature. The amount is raised to the minimum storage deposit
/// required by `rent` unless `adjust_to_min_deposit` is false.
pub fn make_basic_output(
    target: Address,
    sender: Option<Address>,
    tokens: &crate::tokens::FungibleTokens,
    metadata: Option<Vec<u8>>,
    options: SendOptions,
    rent: &crate::rent::RentStructure,
    adjust_to_min_deposit: bool,
) -> BasicOutput {
    let mut out = BasicOutput {
        amount: tokens.base_tokens,
        native_tokens: tokens.native_tokens.clone(),
        unlock_conditions: UnlockConditions::new().with(UnlockCondition::Address(target)),
        features: Features::new(),
    };
    if let Some(sender) = sender {
        out.features.upsert(Feature::Sender(sender));
    }
    if let Some(metadata) = metadata.filter(|m| !m.is_empty()) {
        out.features.upsert(Feature::Metadata(metadata));
    }
    if let Some(unix_time) = options.timelock {
        out.unlock_conditions
            .upsert(UnlockCondition::Timelock { unix_time });
    }
    if let Some((return_address, unix_time)) = options.expiration {
        out.unlock_conditions.upsert(UnlockCondition::Expiration {
            return_address,
            unix_time,
        });
    }
    if adjust_to_min_deposit {
        let min = rent.min_storage_deposit(&Output::Basic(out.clone()));
        if out.amount < min {
            out.amount = min;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Ed25519Address;
    use crate::rent::RentStructure;
    use crate::tokens::FungibleTokens;

    fn owner() -> Address {
        Address::Ed25519(Ed25519Address([4; 32]))
    }

    fn anchor() -> AliasOutput {
        AliasOutput {
            amount: 10_000_000,
            alias_id: AliasId([2; 32]),
            state_index: 7,
            state_metadata: vec![0xaa; 32],
            foundry_counter: 1,
            unlock_conditions: [
                UnlockCondition::StateControllerAddress(owner()),
                UnlockCondition::GovernorAddress(owner()),
            ]
            .into_iter()
            .collect(),
            features: Features::new().with(Feature::Sender(Address::Alias(AliasId([2; 32])))),
            ..Default::default()
        }
    }

    #[test]
    fn alias_output_decodes_to_itself() {
        let out = Output::Alias(anchor());
        let bytes = out.to_bytes();
        assert_eq!(bytes[0], OutputKind::Alias as u8);
        let back = Output::from_bytes(&bytes).unwrap();
        assert_eq!(back.as_alias().unwrap().state_controller(), Some(&owner()));
        assert_eq!(back, out);
    }

    #[test]
    fn foundry_id_requires_alias_condition() {
        let mut foundry = FoundryOutput {
            serial_number: 3,
            ..Default::default()
        };
        assert_eq!(foundry.id(), None);
        foundry
            .unlock_conditions
            .upsert(UnlockCondition::ImmutableAliasAddress(AliasId([2; 32])));
        assert_eq!(foundry.id().unwrap().serial_number(), 3);
    }

    #[test]
    fn basic_output_is_raised_to_min_deposit() {
        let rent = RentStructure::default();
        let out = make_basic_output(
            owner(),
            Some(Address::Alias(AliasId([2; 32]))),
            &FungibleTokens::with_base_tokens(1),
            Some(vec![1, 2, 3]),
            SendOptions {
                timelock: Some(100),
                expiration: None,
            },
            &rent,
            true,
        );
        assert_eq!(out.amount, rent.min_storage_deposit(&out.clone().into()));
        assert_eq!(out.unlock_conditions.timelock(), Some(100));
        assert_eq!(out.features.metadata(), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn unknown_output_kind_is_rejected() {
        assert!(matches!(
            Output::from_bytes(&[9]),
            Err(CodecError::UnknownKind { what: "output", kind: 9 })
        ));
    }
}
