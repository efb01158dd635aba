use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::codec::{read_u32, read_u64, read_u8, CodecError, CodecResult, Packable};
use crate::ids::AliasId;

/// A condition that must hold for an output to be unlocked.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum UnlockCondition {
    /// Owner of the output.
    Address(Address),
    /// The consuming transaction must return `amount` base tokens to
    /// `return_address`.
    StorageDepositReturn {
        /// Where the deposit goes back.
        return_address: Address,
        /// Amount to return.
        amount: u64,
    },
    /// The output cannot be unlocked before `unix_time`.
    Timelock {
        /// Seconds since the epoch.
        unix_time: u32,
    },
    /// After `unix_time` only `return_address` can unlock the output.
    Expiration {
        /// The owner after expiry.
        return_address: Address,
        /// Seconds since the epoch.
        unix_time: u32,
    },
    /// Controller of state transitions of an alias.
    StateControllerAddress(Address),
    /// Controller of governance transitions of an alias.
    GovernorAddress(Address),
    /// Alias that controls a foundry.
    ImmutableAliasAddress(AliasId),
}

impl UnlockCondition {
    /// The type byte.
    pub const fn kind(&self) -> u8 {
        match self {
            UnlockCondition::Address(_) => 0,
            UnlockCondition::StorageDepositReturn { .. } => 1,
            UnlockCondition::Timelock { .. } => 2,
            UnlockCondition::Expiration { .. } => 3,
            UnlockCondition::StateControllerAddress(_) => 4,
            UnlockCondition::GovernorAddress(_) => 5,
            UnlockCondition::ImmutableAliasAddress(_) => 6,
        }
    }
}

impl Packable for UnlockCondition {
    fn pack<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.kind());
        match self {
            UnlockCondition::Address(a)
            | UnlockCondition::StateControllerAddress(a)
            | UnlockCondition::GovernorAddress(a) => a.pack(buf),
            UnlockCondition::StorageDepositReturn {
                return_address,
                amount,
            } => {
                return_address.pack(buf);
                buf.put_u64_le(*amount);
            }
            UnlockCondition::Timelock { unix_time } => buf.put_u32_le(*unix_time),
            UnlockCondition::Expiration {
                return_address,
                unix_time,
            } => {
                return_address.pack(buf);
                buf.put_u32_le(*unix_time);
            }
            UnlockCondition::ImmutableAliasAddress(id) => Address::Alias(*id).pack(buf),
        }
    }

    fn unpack<B: Buf>(buf: &mut B) -> CodecResult<Self> {
        Ok(match read_u8(buf)? {
            0 => UnlockCondition::Address(Address::unpack(buf)?),
            1 => UnlockCondition::StorageDepositReturn {
                return_address: Address::unpack(buf)?,
                amount: read_u64(buf)?,
            },
            2 => UnlockCondition::Timelock {
                unix_time: read_u32(buf)?,
            },
            3 => UnlockCondition::Expiration {
                return_address: Address::unpack(buf)?,
                unix_time: read_u32(buf)?,
            },
            4 => UnlockCondition::StateControllerAddress(Address::unpack(buf)?),
            5 => UnlockCondition::GovernorAddress(Address::unpack(buf)?),
            6 => match Address::unpack(buf)? {
                Address::Alias(id) => UnlockCondition::ImmutableAliasAddress(id),
                _ => {
                    return Err(CodecError::Invalid(
                        "immutable alias condition must hold an alias address".into(),
                    ))
                }
            },
            kind => {
                return Err(CodecError::UnknownKind {
                    what: "unlock condition",
                    kind,
                })
            }
        })
    }
}

/// The unlock conditions of an output, kept sorted by kind with at most one
/// condition per kind.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct UnlockConditions(Vec<UnlockCondition>);

impl UnlockConditions {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `cond`, replacing a condition of the same kind.
    pub fn upsert(&mut self, cond: UnlockCondition) {
        match self.0.binary_search_by_key(&cond.kind(), UnlockCondition::kind) {
            Ok(i) => self.0[i] = cond,
            Err(i) => self.0.insert(i, cond),
        }
    }

    /// Builder-style [`Self::upsert`].
    pub fn with(mut self, cond: UnlockCondition) -> Self {
        self.upsert(cond);
        self
    }

    /// Iterates the conditions in kind order.
    pub fn iter(&self) -> impl Iterator<Item = &UnlockCondition> {
        self.0.iter()
    }

    fn find(&self, kind: u8) -> Option<&UnlockCondition> {
        self.0.iter().find(|c| c.kind() == kind)
    }

    /// The owner address, if any.
    pub fn address(&self) -> Option<&Address> {
        match self.find(0) {
            Some(UnlockCondition::Address(a)) => Some(a),
            _ => None,
        }
    }

    /// The storage deposit return clause, if any.
    pub fn storage_deposit_return(&self) -> Option<(Address, u64)> {
        match self.find(1) {
            Some(UnlockCondition::StorageDepositReturn {
                return_address,
                amount,
            }) => Some((*return_address, *amount)),
            _ => None,
        }
    }

    /// The timelock, if any.
    pub fn timelock(&self) -> Option<u32> {
        match self.find(2) {
            Some(UnlockCondition::Timelock { unix_time }) => Some(*unix_time),
            _ => None,
        }
    }

    /// The expiration clause, if any.
    pub fn expiration(&self) -> Option<(Address, u32)> {
        match self.find(3) {
            Some(UnlockCondition::Expiration {
                return_address,
                unix_time,
            }) => Some((*return_address, *unix_time)),
            _ => None,
        }
    }

    /// The state controller of an alias.
    pub fn state_controller(&self) -> Option<&Address> {
        match self.find(4) {
            Some(UnlockCondition::StateControllerAddress(a)) => Some(a),
            _ => None,
        }
    }

    /// The governor of an alias.
    pub fn governor(&self) -> Option<&Address> {
        match self.find(5) {
            Some(UnlockCondition::GovernorAddress(a)) => Some(a),
            _ => None,
        }
    }

    /// The alias controlling a foundry.
    pub fn immutable_alias(&self) -> Option<&AliasId> {
        match self.find(6) {
            Some(UnlockCondition::ImmutableAliasAddress(a)) => Some(a),
            _ => None,
        }
    }

    /// Whether the output is addressed to `addr` as its plain owner.
    pub fn is_addressed_to(&self, addr: &Address) -> bool {
        self.address() == Some(addr)
    }
}

impl FromIterator<UnlockCondition> for UnlockConditions {
    fn from_iter<T: IntoIterator<Item = UnlockCondition>>(iter: T) -> Self {
        let mut ret = Self::new();
        for c in iter {
            ret.upsert(c);
        }
        ret
    }
}

impl Packable for UnlockConditions {
    fn pack<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.0.len() as u8);
        for c in &self.0 {
            c.pack(buf);
        }
    }

    fn unpack<B: Buf>(buf: &mut B) -> CodecResult<Self> {
        let count = read_u8(buf)?;
        let mut ret = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let c = UnlockCondition::unpack(buf)?;
            if ret.last().is_some_and(|l: &UnlockCondition| l.kind() >= c.kind()) {
                return Err(CodecError::NotCanonical {
                    what: "unlock conditions",
                });
            }
            ret.push(c);
        }
        Ok(Self(ret))
    }
}
