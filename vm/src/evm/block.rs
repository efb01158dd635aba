//! The emulated EVM chain: one EVM block per L2 block.
//!
//! Transactions of an L2 block accumulate in a [`BlockContext`] stored under
//! the pending key; it is created by the first EVM transaction of the block
//! and turned into an [`EvmBlock`] when the L2 block is closed.

use anchor_common::EVM_BLOCK_GAS_LIMIT;
use ethereum_types::{H160, H256};
use keccak_hash::keccak;
use kv_state::codec::{decode_or, decode_u64, encode_u64};
use kv_state::kv::key_join;
use kv_state::{KvReader, KvStore};
use log::trace;
use rlp::RlpStream;
use rlp_derive::{RlpDecodable, RlpEncodable};

use super::{EvmError, EvmReceipt, EvmResult, EvmTransaction};

const KEY_LATEST: &[u8] = b"n";
const KEY_BLOCKS: &[u8] = b"b";
const KEY_HASHES: &[u8] = b"h";
const KEY_TX_INDEX: &[u8] = b"t";
const KEY_PENDING: &[u8] = b"p";

/// Header of an emulated block.
#[derive(Clone, Debug, Default, Eq, PartialEq, RlpEncodable, RlpDecodable)]
pub struct EvmBlockHeader {
    /// Equals the index of the L2 block.
    pub number: u64,
    /// Hash of the previous block.
    pub parent_hash: H256,
    /// Seconds since the epoch; never decreases.
    pub timestamp: u64,
    /// Gas limit of every block.
    pub gas_limit: u64,
    /// Gas used by all transactions.
    pub gas_used: u64,
    /// Keccak of the RLP list of transaction hashes.
    pub transactions_root: H256,
    /// Keccak of the RLP list of receipts.
    pub receipts_root: H256,
}

impl EvmBlockHeader {
    /// Keccak of the RLP form.
    pub fn hash(&self) -> H256 {
        keccak(rlp::encode(self))
    }
}

/// A minted block with its transactions.
#[derive(Clone, Debug, Default, Eq, PartialEq, RlpEncodable, RlpDecodable)]
pub struct EvmBlock {
    /// The header.
    pub header: EvmBlockHeader,
    /// Sender of each transaction.
    pub senders: Vec<H160>,
    /// Transactions in execution order.
    pub transactions: Vec<EvmTransaction>,
    /// One receipt per transaction.
    pub receipts: Vec<EvmReceipt>,
}

impl EvmBlock {
    /// Hash of the header.
    pub fn hash(&self) -> H256 {
        self.header.hash()
    }
}

/// The EVM block being built during an L2 block.
#[derive(Clone, Debug, Default, Eq, PartialEq, RlpEncodable, RlpDecodable)]
pub struct BlockContext {
    /// Number of the block being built.
    pub number: u64,
    /// Its timestamp.
    pub timestamp: u64,
    /// Gas used so far.
    pub gas_used: u64,
    /// Senders so far.
    pub senders: Vec<H160>,
    /// Transactions so far.
    pub transactions: Vec<EvmTransaction>,
    /// Receipts so far.
    pub receipts: Vec<EvmReceipt>,
}

impl BlockContext {
    /// Gas the block can still take.
    pub fn gas_left(&self) -> u64 {
        EVM_BLOCK_GAS_LIMIT.saturating_sub(self.gas_used)
    }
}

fn list_hash<'a>(hashes: impl ExactSizeIterator<Item = &'a H256>) -> H256 {
    let mut s = RlpStream::new_list(hashes.len());
    for h in hashes {
        s.append(h);
    }
    keccak(s.out())
}

/// Blocks, transaction index and pending context, over the store of the
/// `evm` contract.
#[derive(Debug)]
pub struct BlockChainDb<S> {
    kv: S,
}

impl<S> BlockChainDb<S> {
    /// Opens the chain on `kv`.
    pub fn new(kv: S) -> Self {
        Self { kv }
    }
}

impl<S: KvReader> BlockChainDb<S> {
    /// Number of the latest minted block.
    pub fn block_number(&self) -> EvmResult<u64> {
        Ok(decode_or(self.kv.get(KEY_LATEST), 0, decode_u64)?)
    }

    /// The minted block `number`.
    pub fn block_by_number(&self, number: u64) -> EvmResult<Option<EvmBlock>> {
        self.kv
            .get(&key_join(&[KEY_BLOCKS, &number.to_be_bytes()]))
            .map(|b| rlp::decode(&b))
            .transpose()
            .map_err(Into::into)
    }

    /// The latest minted block.
    pub fn latest_block(&self) -> EvmResult<Option<EvmBlock>> {
        self.block_by_number(self.block_number()?)
    }

    /// The minted block with header hash `hash`.
    pub fn block_by_hash(&self, hash: &H256) -> EvmResult<Option<EvmBlock>> {
        match self.kv.get(&key_join(&[KEY_HASHES, hash.as_bytes()])) {
            Some(n) => self.block_by_number(decode_u64(&n)?),
            None => Ok(None),
        }
    }

    /// Block number and position of a minted transaction.
    pub fn transaction_location(&self, tx_hash: &H256) -> EvmResult<Option<(u64, usize)>> {
        let Some(v) = self.kv.get(&key_join(&[KEY_TX_INDEX, tx_hash.as_bytes()])) else {
            return Ok(None);
        };
        if v.len() != 12 {
            return Err(EvmError::Decode(kv_state::KvDecodeError::WrongLength {
                what: "transaction location",
                expected: 12,
                got: v.len(),
            }));
        }
        let number = decode_u64(&v[..8])?;
        let index = kv_state::codec::decode_u32(&v[8..])?;
        Ok(Some((number, index as usize)))
    }

    /// A minted transaction with its sender.
    pub fn transaction(&self, tx_hash: &H256) -> EvmResult<Option<(H160, EvmTransaction)>> {
        Ok(self.located(tx_hash)?.map(|(block, i)| {
            (block.senders[i], block.transactions[i].clone())
        }))
    }

    /// The receipt of a minted transaction.
    pub fn receipt(&self, tx_hash: &H256) -> EvmResult<Option<EvmReceipt>> {
        Ok(self
            .located(tx_hash)?
            .map(|(block, i)| block.receipts[i].clone()))
    }

    fn located(&self, tx_hash: &H256) -> EvmResult<Option<(EvmBlock, usize)>> {
        let Some((number, index)) = self.transaction_location(tx_hash)? else {
            return Ok(None);
        };
        let block = self
            .block_by_number(number)?
            .ok_or(EvmError::TransactionNotFound(*tx_hash))?;
        match index < block.transactions.len() {
            true => Ok(Some((block, index))),
            false => Err(EvmError::TransactionNotFound(*tx_hash)),
        }
    }

    /// The context of the block being built, if any transaction ran in it.
    pub fn pending(&self) -> EvmResult<Option<BlockContext>> {
        self.kv
            .get(KEY_PENDING)
            .map(|b| rlp::decode(&b))
            .transpose()
            .map_err(Into::into)
    }
}

impl<S: KvStore> BlockChainDb<S> {
    fn store_block(&mut self, block: &EvmBlock) {
        let number = block.header.number;
        let hash = block.hash();
        self.kv.set(
            &key_join(&[KEY_BLOCKS, &number.to_be_bytes()]),
            &rlp::encode(block),
        );
        self.kv
            .set(&key_join(&[KEY_HASHES, hash.as_bytes()]), &encode_u64(number));
        for (i, tx) in block.transactions.iter().enumerate() {
            let loc = [number.to_le_bytes().as_slice(), &(i as u32).to_le_bytes()].concat();
            self.kv
                .set(&key_join(&[KEY_TX_INDEX, tx.hash().as_bytes()]), &loc);
        }
        self.kv.set(KEY_LATEST, &encode_u64(number));
    }

    /// Stores block 0.
    pub fn init(&mut self, timestamp: u64) {
        let genesis = EvmBlock {
            header: EvmBlockHeader {
                number: 0,
                timestamp,
                gas_limit: EVM_BLOCK_GAS_LIMIT,
                transactions_root: list_hash(std::iter::empty()),
                receipts_root: keccak(rlp::encode_list::<EvmReceipt, EvmReceipt>(&[])),
                ..Default::default()
            },
            ..Default::default()
        };
        self.store_block(&genesis);
    }

    /// The pending context, created for block `number` when there is none.
    /// The timestamp never goes below the one of the latest block.
    pub fn open_context(&mut self, number: u64, timestamp: u64) -> EvmResult<BlockContext> {
        if let Some(ctx) = self.pending()? {
            return Ok(ctx);
        }
        let prev = self
            .latest_block()?
            .map(|b| b.header.timestamp)
            .unwrap_or_default();
        trace!("Opening EVM block {number}");
        Ok(BlockContext {
            number,
            timestamp: timestamp.max(prev),
            ..Default::default()
        })
    }

    /// Stores the pending context.
    pub fn save_context(&mut self, ctx: &BlockContext) {
        self.kv.set(KEY_PENDING, &rlp::encode(ctx));
    }

    /// Mints the EVM block of L2 block `number` from the pending context, or
    /// an empty one when no EVM transaction ran.
    pub fn mint(&mut self, number: u64, timestamp: u64) -> EvmResult<EvmBlock> {
        let ctx = self.open_context(number, timestamp)?;
        let parent_hash = self
            .latest_block()?
            .map(|b| b.hash())
            .unwrap_or_default();
        let tx_hashes: Vec<H256> = ctx.transactions.iter().map(|t| t.hash()).collect();
        let block = EvmBlock {
            header: EvmBlockHeader {
                number: ctx.number,
                parent_hash,
                timestamp: ctx.timestamp,
                gas_limit: EVM_BLOCK_GAS_LIMIT,
                gas_used: ctx.gas_used,
                transactions_root: list_hash(tx_hashes.iter()),
                receipts_root: keccak(rlp::encode_list::<EvmReceipt, _>(&ctx.receipts)),
            },
            senders: ctx.senders,
            transactions: ctx.transactions,
            receipts: ctx.receipts,
        };
        self.store_block(&block);
        self.kv.del(KEY_PENDING);
        trace!(
            "Minted EVM block {} with {} transactions",
            block.header.number,
            block.transactions.len()
        );
        Ok(block)
    }
}
