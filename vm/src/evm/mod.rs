//! Ethereum-compatible state over the partition of the `evm` contract.
//!
//! There is no bytecode interpreter: an EVM transaction states its effects
//! (code to install, storage slots to write, logs to emit, value to move)
//! and the emulator applies them with Ethereum account semantics, gas
//! accounting and block structure.

use bytes::Bytes;
use ethereum_types::{H160, H256, U256};
use keccak_hash::keccak;
use kv_state::KvDecodeError;
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};
use rlp_derive::{RlpDecodable, RlpEncodable};
use thiserror::Error;

pub mod block;
pub mod buffered;
pub mod emulator;
pub mod statedb;

pub use block::{BlockChainDb, BlockContext, EvmBlock, EvmBlockHeader};
pub use buffered::BufferedStateDb;
pub use emulator::{trace_transaction, EvmEmulator, EvmTrace, StorageChange};
pub use statedb::EvmStateDb;

/// Result of an EVM operation.
pub type EvmResult<T> = Result<T, EvmError>;

/// Why an EVM transaction or query failed.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum EvmError {
    /// The transaction nonce is not the sender's next nonce.
    #[error("nonce mismatch: expected {expected}, got {got}")]
    NonceMismatch {
        /// Nonce of the sender account.
        expected: u64,
        /// Nonce of the transaction.
        got: u64,
    },

    /// The sender cannot pay the value.
    #[error("insufficient balance for transfer")]
    InsufficientBalance,

    /// The gas limit does not cover what the transaction uses.
    #[error("out of gas: limit {limit}, needed {needed}")]
    OutOfGas {
        /// Gas limit of the transaction.
        limit: u64,
        /// Gas the transaction uses.
        needed: u64,
    },

    /// The transaction does not fit in the remaining gas of the block.
    #[error("block gas limit exceeded")]
    BlockGasLimitExceeded,

    /// A contract already exists at the creation address.
    #[error("contract address collision at {0:?}")]
    AddressCollision(H160),

    /// Storage or logs were given for an account without code.
    #[error("no contract at {0:?}")]
    NoContract(H160),

    /// No minted block contains the transaction.
    #[error("transaction {0:?} not found")]
    TransactionNotFound(H256),

    /// Stored RLP could not be decoded.
    #[error("rlp: {0}")]
    Rlp(#[from] DecoderError),

    /// A stored value could not be decoded.
    #[error("decode failed: {0}")]
    Decode(#[from] KvDecodeError),
}

/// A log emitted by a transaction.
#[derive(Clone, Debug, Eq, PartialEq, RlpEncodable, RlpDecodable)]
pub struct EvmLog {
    /// The emitting contract.
    pub address: H160,
    /// Indexed topics.
    pub topics: Vec<H256>,
    /// Unindexed data.
    pub data: Bytes,
}

/// A storage slot written by a transaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq, RlpEncodable, RlpDecodable)]
pub struct StorageWrite {
    /// The slot.
    pub key: H256,
    /// The new value.
    pub value: H256,
}

/// A log a transaction asks the called contract to emit.
#[derive(Clone, Debug, Eq, PartialEq, RlpEncodable, RlpDecodable)]
pub struct LogEntry {
    /// Indexed topics.
    pub topics: Vec<H256>,
    /// Unindexed data.
    pub data: Bytes,
}

/// An EVM transaction. `to == None` creates a contract whose code is
/// `data`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct EvmTransaction {
    /// Must equal the sender's account nonce.
    pub nonce: u64,
    /// Upper bound of the gas used.
    pub gas_limit: u64,
    /// Called contract or value recipient.
    pub to: Option<H160>,
    /// Wei moved to the recipient.
    pub value: U256,
    /// Call data, or the code of the created contract.
    pub data: Bytes,
    /// Storage of the target contract after the transaction.
    pub storage: Vec<StorageWrite>,
    /// Logs emitted by the target contract.
    pub logs: Vec<LogEntry>,
}

impl EvmTransaction {
    /// Keccak of the RLP form.
    pub fn hash(&self) -> H256 {
        keccak(rlp::encode(self))
    }

    /// Whether the transaction creates a contract.
    pub fn is_create(&self) -> bool {
        self.to.is_none()
    }
}

fn append_optional_address(s: &mut RlpStream, addr: &Option<H160>) {
    match addr {
        Some(a) => s.append(a),
        None => s.append_empty_data(),
    };
}

fn decode_optional_address(rlp: &Rlp, index: usize) -> Result<Option<H160>, DecoderError> {
    let item = rlp.at(index)?;
    match item.is_empty() {
        true => Ok(None),
        false => Ok(Some(item.as_val()?)),
    }
}

impl Encodable for EvmTransaction {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(7);
        s.append(&self.nonce);
        s.append(&self.gas_limit);
        append_optional_address(s, &self.to);
        s.append(&self.value);
        s.append(&self.data);
        s.append_list::<StorageWrite, _>(&self.storage);
        s.append_list::<LogEntry, _>(&self.logs);
    }
}

impl Decodable for EvmTransaction {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if rlp.item_count()? != 7 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        Ok(Self {
            nonce: rlp.val_at(0)?,
            gas_limit: rlp.val_at(1)?,
            to: decode_optional_address(rlp, 2)?,
            value: rlp.val_at(3)?,
            data: rlp.val_at(4)?,
            storage: rlp.list_at(5)?,
            logs: rlp.list_at(6)?,
        })
    }
}

/// Outcome of an applied transaction.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct EvmReceipt {
    /// Hash of the transaction.
    pub tx_hash: H256,
    /// Gas used by the transaction alone.
    pub gas_used: u64,
    /// Gas used by the block up to and including the transaction.
    pub cumulative_gas_used: u64,
    /// Address of the created contract.
    pub contract_address: Option<H160>,
    /// Emitted logs.
    pub logs: Vec<EvmLog>,
}

impl Encodable for EvmReceipt {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(5);
        s.append(&self.tx_hash);
        s.append(&self.gas_used);
        s.append(&self.cumulative_gas_used);
        append_optional_address(s, &self.contract_address);
        s.append_list::<EvmLog, _>(&self.logs);
    }
}

impl Decodable for EvmReceipt {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if rlp.item_count()? != 5 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        Ok(Self {
            tx_hash: rlp.val_at(0)?,
            gas_used: rlp.val_at(1)?,
            cumulative_gas_used: rlp.val_at(2)?,
            contract_address: decode_optional_address(rlp, 3)?,
            logs: rlp.list_at(4)?,
        })
    }
}

/// Address of the contract `sender` creates with `nonce`.
pub fn create_address(sender: &H160, nonce: u64) -> H160 {
    let mut s = RlpStream::new_list(2);
    s.append(sender);
    s.append(&nonce);
    H160::from_slice(&keccak(s.out()).as_bytes()[12..])
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;

    #[test]
    fn transaction_rlp() {
        let tx = EvmTransaction {
            nonce: 3,
            gas_limit: 100_000,
            to: Some(H160::repeat_byte(1)),
            value: U256::from(5),
            data: Bytes::from_static(b"\x01\x02"),
            storage: vec![StorageWrite {
                key: H256::zero(),
                value: H256::from_low_u64_be(7),
            }],
            logs: vec![LogEntry {
                topics: vec![H256::repeat_byte(9)],
                data: Bytes::new(),
            }],
        };
        let decoded: EvmTransaction = rlp::decode(&rlp::encode(&tx)).unwrap();
        assert_eq!(decoded, tx);

        let create = EvmTransaction {
            data: Bytes::from_static(b"code"),
            ..Default::default()
        };
        let decoded: EvmTransaction = rlp::decode(&rlp::encode(&create)).unwrap();
        assert!(decoded.is_create());
        assert_ne!(create.hash(), tx.hash());
    }

    #[test]
    fn create_address_matches_ethereum() {
        // First contract deployed by 0x6ac7ea33f8831ea9dcc53393aaa88b25a785dbf0.
        let sender = H160(hex!("6ac7ea33f8831ea9dcc53393aaa88b25a785dbf0"));
        assert_eq!(
            create_address(&sender, 0),
            H160(hex!("cd234a471b72ba2f1ccf0a70fcaba648a5eecd8d"))
        );
    }
}
