//! Identities that can own funds on a chain.

use std::fmt;

use anchor_ledger::codec::{read_array, read_u8};
use anchor_ledger::{Address, AliasId, CodecError, CodecResult, Packable};
use bytes::{Buf, BufMut};
use ethereum_types::H160;
use serde::{Deserialize, Serialize};

use crate::hname::Hname;

/// The id of a chain: the alias id of its anchor.
pub type ChainId = AliasId;

const NIL_KIND: u8 = 0;
const ADDRESS_KIND: u8 = 1;
const CONTRACT_KIND: u8 = 2;
const ETH_KIND: u8 = 3;

/// An owner of an on-chain account.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize)]
pub enum AgentId {
    /// Nobody. Used for anonymous requests.
    #[default]
    Nil,
    /// An L1 address.
    Address(Address),
    /// A contract on some chain.
    Contract {
        /// The chain.
        chain_id: ChainId,
        /// The contract.
        hname: Hname,
    },
    /// An account of the EVM.
    Eth(H160),
}

impl AgentId {
    /// The L1 address that funds sent to this agent go to.
    pub fn address(&self) -> Option<Address> {
        match self {
            AgentId::Address(a) => Some(*a),
            AgentId::Contract { chain_id, .. } => Some(Address::Alias(*chain_id)),
            AgentId::Nil | AgentId::Eth(_) => None,
        }
    }

    /// The account every chain keeps for itself: fees and storage deposit
    /// refunds without a better owner end up here.
    pub fn common_account(chain_id: ChainId) -> Self {
        AgentId::Contract {
            chain_id,
            hname: Hname::NIL,
        }
    }

    /// The EVM address used when this agent sends EVM transactions.
    pub fn eth_address(&self) -> H160 {
        match self {
            AgentId::Eth(a) => *a,
            other => {
                let b = other.to_bytes();
                let h = keccak_hash::keccak(b);
                H160::from_slice(&h.as_bytes()[12..])
            }
        }
    }
}

impl Packable for AgentId {
    fn pack<B: BufMut>(&self, buf: &mut B) {
        match self {
            AgentId::Nil => buf.put_u8(NIL_KIND),
            AgentId::Address(a) => {
                buf.put_u8(ADDRESS_KIND);
                a.pack(buf);
            }
            AgentId::Contract { chain_id, hname } => {
                buf.put_u8(CONTRACT_KIND);
                chain_id.pack(buf);
                buf.put_slice(&hname.to_bytes());
            }
            AgentId::Eth(a) => {
                buf.put_u8(ETH_KIND);
                buf.put_slice(a.as_bytes());
            }
        }
    }

    fn unpack<B: Buf>(buf: &mut B) -> CodecResult<Self> {
        Ok(match read_u8(buf)? {
            NIL_KIND => AgentId::Nil,
            ADDRESS_KIND => AgentId::Address(Address::unpack(buf)?),
            CONTRACT_KIND => AgentId::Contract {
                chain_id: AliasId::unpack(buf)?,
                hname: Hname(u32::from_le_bytes(read_array(buf)?)),
            },
            ETH_KIND => AgentId::Eth(H160(read_array(buf)?)),
            kind => {
                return Err(CodecError::UnknownKind {
                    what: "agent id",
                    kind,
                })
            }
        })
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentId::Nil => write!(f, "-"),
            AgentId::Address(a) => write!(f, "{a}"),
            AgentId::Contract { chain_id, hname } => write!(f, "{hname}@{chain_id}"),
            AgentId::Eth(a) => write!(f, "{a:?}"),
        }
    }
}
