//! Base tokens and native tokens.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut};
use ethereum_types::U256;
use serde::{Deserialize, Serialize};

use crate::codec::{read_u256, read_u64, read_u8, write_u256, CodecError, CodecResult, Packable};
use crate::ids::TokenId;

/// Maximum number of distinct native tokens a single output may hold.
pub const MAX_NATIVE_TOKENS_PER_OUTPUT: usize = 64;

/// An amount of one native token.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct NativeToken {
    /// The token.
    pub id: TokenId,
    /// The amount held.
    pub amount: U256,
}

/// A set of native token amounts, keyed and ordered by token id. Zero
/// amounts are never stored.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct NativeTokens(BTreeMap<TokenId, U256>);

impl NativeTokens {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Amount held of `id`, zero if absent.
    pub fn get(&self, id: &TokenId) -> U256 {
        self.0.get(id).copied().unwrap_or_default()
    }

    /// Adds `amount` of `id`. Returns `false` on overflow, in which case
    /// nothing changes.
    pub fn add(&mut self, id: TokenId, amount: U256) -> bool {
        if amount.is_zero() {
            return true;
        }
        let current = self.get(&id);
        match current.checked_add(amount) {
            Some(sum) => {
                self.0.insert(id, sum);
                true
            }
            None => false,
        }
    }

    /// Removes `amount` of `id`. Returns `false` if the balance is
    /// insufficient, in which case nothing changes.
    pub fn sub(&mut self, id: TokenId, amount: U256) -> bool {
        if amount.is_zero() {
            return true;
        }
        let current = self.get(&id);
        match current.checked_sub(amount) {
            Some(rest) if rest.is_zero() => {
                self.0.remove(&id);
                true
            }
            Some(rest) => {
                self.0.insert(id, rest);
                true
            }
            None => false,
        }
    }

    /// Sets the amount of `id`, removing it when zero.
    pub fn set(&mut self, id: TokenId, amount: U256) {
        match amount.is_zero() {
            true => self.0.remove(&id),
            false => self.0.insert(id, amount),
        };
    }

    /// Number of distinct tokens.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no token is held.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether every amount in `other` is covered by `self`.
    pub fn contains(&self, other: &NativeTokens) -> bool {
        other.iter().all(|t| self.get(&t.id) >= t.amount)
    }

    /// Iterates tokens in id order.
    pub fn iter(&self) -> impl Iterator<Item = NativeToken> + '_ {
        self.0.iter().map(|(id, amount)| NativeToken {
            id: *id,
            amount: *amount,
        })
    }

    /// Iterates token ids in order.
    pub fn ids(&self) -> impl Iterator<Item = &TokenId> + '_ {
        self.0.keys()
    }
}

impl FromIterator<NativeToken> for NativeTokens {
    fn from_iter<T: IntoIterator<Item = NativeToken>>(iter: T) -> Self {
        let mut ret = Self::new();
        for t in iter {
            ret.add(t.id, t.amount);
        }
        ret
    }
}

impl Packable for NativeTokens {
    fn pack<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.0.len() as u8);
        for (id, amount) in &self.0 {
            id.pack(buf);
            write_u256(buf, amount);
        }
    }

    fn unpack<B: Buf>(buf: &mut B) -> CodecResult<Self> {
        let count = read_u8(buf)? as usize;
        if count > MAX_NATIVE_TOKENS_PER_OUTPUT {
            return Err(CodecError::TooMany {
                what: "native tokens",
                count,
                max: MAX_NATIVE_TOKENS_PER_OUTPUT,
            });
        }
        let mut ret = BTreeMap::new();
        let mut last: Option<TokenId> = None;
        for _ in 0..count {
            let id = TokenId::unpack(buf)?;
            let amount = read_u256(buf)?;
            if last.is_some_and(|l| l >= id) {
                return Err(CodecError::NotCanonical {
                    what: "native tokens",
                });
            }
            if amount.is_zero() {
                return Err(CodecError::Invalid("zero native token amount".into()));
            }
            last = Some(id);
            ret.insert(id, amount);
        }
        Ok(Self(ret))
    }
}

/// Base tokens plus native tokens.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct FungibleTokens {
    /// Amount of the L1 base token.
    pub base_tokens: u64,
    /// Native token amounts.
    pub native_tokens: NativeTokens,
}

impl FungibleTokens {
    /// Only base tokens.
    pub fn with_base_tokens(base_tokens: u64) -> Self {
        Self {
            base_tokens,
            native_tokens: NativeTokens::new(),
        }
    }

    /// Adds a native token amount, builder style.
    pub fn add_native_token(mut self, id: TokenId, amount: U256) -> Self {
        self.native_tokens.add(id, amount);
        self
    }

    /// Whether nothing is held.
    pub fn is_empty(&self) -> bool {
        self.base_tokens == 0 && self.native_tokens.is_empty()
    }

    /// Adds everything in `other`. Returns `false` on overflow, leaving
    /// `self` unchanged.
    pub fn add(&mut self, other: &FungibleTokens) -> bool {
        let mut next = self.clone();
        let Some(base) = next.base_tokens.checked_add(other.base_tokens) else {
            return false;
        };
        next.base_tokens = base;
        if !other.native_tokens.iter().all(|t| next.native_tokens.add(t.id, t.amount)) {
            return false;
        }
        *self = next;
        true
    }

    /// Removes everything in `other`. Returns `false` if anything is missing,
    /// leaving `self` unchanged.
    pub fn spend(&mut self, other: &FungibleTokens) -> bool {
        if self.base_tokens < other.base_tokens || !self.native_tokens.contains(&other.native_tokens)
        {
            return false;
        }
        self.base_tokens -= other.base_tokens;
        for t in other.native_tokens.iter() {
            self.native_tokens.sub(t.id, t.amount);
        }
        true
    }
}

impl Packable for FungibleTokens {
    fn pack<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64_le(self.base_tokens);
        self.native_tokens.pack(buf);
    }

    fn unpack<B: Buf>(buf: &mut B) -> CodecResult<Self> {
        Ok(Self {
            base_tokens: read_u64(buf)?,
            native_tokens: NativeTokens::unpack(buf)?,
        })
    }
}
