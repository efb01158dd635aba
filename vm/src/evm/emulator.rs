//! The EVM emulator applying declared transaction effects.

use ethereum_types::{H160, H256};
use kv_state::{KvReader, KvStore, SubRealm};
use log::{debug, trace};

use super::{
    create_address, BlockChainDb, BlockContext, BufferedStateDb, EvmBlock, EvmError, EvmLog,
    EvmReceipt, EvmResult, EvmStateDb, EvmTransaction,
};

/// Prefix of the account state inside the partition of the `evm` contract.
pub const STATE_PREFIX: &[u8] = b"s";

const TX_GAS: u64 = 21_000;
const TX_CREATE_GAS: u64 = 32_000;
const TX_DATA_ZERO_GAS: u64 = 4;
const TX_DATA_NON_ZERO_GAS: u64 = 16;
const CODE_DEPOSIT_GAS: u64 = 200;
const SSTORE_SET_GAS: u64 = 20_000;
const SSTORE_RESET_GAS: u64 = 5_000;
const LOG_GAS: u64 = 375;
const LOG_TOPIC_GAS: u64 = 375;
const LOG_DATA_GAS: u64 = 8;

/// A storage slot as changed by a transaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StorageChange {
    /// The contract.
    pub address: H160,
    /// The slot.
    pub slot: H256,
    /// Value before the transaction.
    pub before: H256,
    /// Value after it.
    pub after: H256,
}

/// What re-executing a transaction observed.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct EvmTrace {
    /// The transaction.
    pub tx_hash: H256,
    /// Its sender.
    pub from: H160,
    /// Gas it used.
    pub gas_used: u64,
    /// The contract it created.
    pub contract_address: Option<H160>,
    /// Slots it wrote.
    pub storage: Vec<StorageChange>,
    /// Logs it emitted.
    pub logs: Vec<EvmLog>,
}

struct Applied {
    gas_used: u64,
    contract_address: Option<H160>,
    storage: Vec<StorageChange>,
}

fn intrinsic_gas(tx: &EvmTransaction) -> u64 {
    let data: u64 = tx
        .data
        .iter()
        .map(|b| match b {
            0 => TX_DATA_ZERO_GAS,
            _ => TX_DATA_NON_ZERO_GAS,
        })
        .sum();
    let create = match tx.is_create() {
        true => TX_CREATE_GAS + CODE_DEPOSIT_GAS * tx.data.len() as u64,
        false => 0,
    };
    TX_GAS + data + create
}

fn apply<S: KvStore>(
    db: &mut EvmStateDb<S>,
    from: &H160,
    tx: &EvmTransaction,
) -> EvmResult<Applied> {
    let nonce = db.get_nonce(from)?;
    if tx.nonce != nonce {
        return Err(EvmError::NonceMismatch {
            expected: nonce,
            got: tx.nonce,
        });
    }
    let target = match tx.to {
        Some(to) => to,
        None => {
            let addr = create_address(from, nonce);
            if db.get_code_size(&addr) > 0 || db.get_nonce(&addr)? > 0 {
                return Err(EvmError::AddressCollision(addr));
            }
            addr
        }
    };
    let touches_contract = !tx.storage.is_empty() || !tx.logs.is_empty();
    if !tx.is_create() && touches_contract && db.get_code_size(&target) == 0 {
        return Err(EvmError::NoContract(target));
    }

    let mut gas = intrinsic_gas(tx);
    let mut storage = Vec::with_capacity(tx.storage.len());
    for w in &tx.storage {
        let before = db.get_state(&target, &w.key);
        gas += match before.is_zero() && !w.value.is_zero() {
            true => SSTORE_SET_GAS,
            false => SSTORE_RESET_GAS,
        };
        storage.push(StorageChange {
            address: target,
            slot: w.key,
            before,
            after: w.value,
        });
    }
    for l in &tx.logs {
        gas += LOG_GAS
            + LOG_TOPIC_GAS * l.topics.len() as u64
            + LOG_DATA_GAS * l.data.len() as u64;
    }
    if gas > tx.gas_limit {
        return Err(EvmError::OutOfGas {
            limit: tx.gas_limit,
            needed: gas,
        });
    }

    db.sub_balance(from, tx.value)?;
    db.add_balance(&target, tx.value)?;
    db.set_nonce(from, nonce + 1);
    if tx.is_create() {
        db.set_code(&target, &tx.data);
        db.set_nonce(&target, 1);
    }
    for c in &storage {
        db.set_state(&c.address, &c.slot, &c.after);
    }
    for l in &tx.logs {
        db.add_log(EvmLog {
            address: target,
            topics: l.topics.clone(),
            data: l.data.clone(),
        });
    }
    Ok(Applied {
        gas_used: gas,
        contract_address: tx.is_create().then_some(target),
        storage,
    })
}

/// Runs EVM transactions against the partition of the `evm` contract.
#[derive(Debug)]
pub struct EvmEmulator<S> {
    kv: S,
}

impl<S> EvmEmulator<S> {
    /// An emulator over the `evm` partition `kv`.
    pub fn new(kv: S) -> Self {
        Self { kv }
    }
}

impl<S: KvReader> EvmEmulator<S> {
    /// Read access to accounts and storage.
    pub fn state(&self) -> EvmStateDb<SubRealm<&S>> {
        EvmStateDb::new(SubRealm::new(&self.kv, STATE_PREFIX))
    }

    /// Read access to the minted blocks.
    pub fn blockchain(&self) -> BlockChainDb<&S> {
        BlockChainDb::new(&self.kv)
    }
}

impl<S: KvStore> EvmEmulator<S> {
    /// Writable accounts and storage.
    pub fn state_mut(&mut self) -> EvmStateDb<SubRealm<&mut S>> {
        EvmStateDb::new(SubRealm::new(&mut self.kv, STATE_PREFIX))
    }

    /// Writable blocks.
    pub fn blockchain_mut(&mut self) -> BlockChainDb<&mut S> {
        BlockChainDb::new(&mut self.kv)
    }

    /// Applies `tx` sent by `from` in L2 block `block_number`. Only a
    /// successful transaction changes anything; it joins the pending block.
    pub fn send_transaction(
        &mut self,
        from: H160,
        tx: EvmTransaction,
        block_number: u64,
        timestamp: u64,
    ) -> EvmResult<EvmReceipt> {
        let mut ctx: BlockContext = self.blockchain_mut().open_context(block_number, timestamp)?;
        if tx.gas_limit > ctx.gas_left() {
            return Err(EvmError::BlockGasLimitExceeded);
        }

        let mut buf = BufferedStateDb::new(SubRealm::new(&self.kv, STATE_PREFIX));
        let applied = apply(&mut *buf, &from, &tx)?;
        let (muts, logs) = buf.commit();
        muts.apply_to(&mut SubRealm::new(&mut self.kv, STATE_PREFIX));

        let tx_hash = tx.hash();
        ctx.gas_used += applied.gas_used;
        let receipt = EvmReceipt {
            tx_hash,
            gas_used: applied.gas_used,
            cumulative_gas_used: ctx.gas_used,
            contract_address: applied.contract_address,
            logs,
        };
        debug!(
            "EVM transaction {tx_hash:?} from {from:?} used {} gas",
            applied.gas_used
        );
        ctx.senders.push(from);
        ctx.transactions.push(tx);
        ctx.receipts.push(receipt.clone());
        self.blockchain_mut().save_context(&ctx);
        Ok(receipt)
    }
}

/// Re-executes transaction `tx_hash` of `block` on top of `parent`, the
/// `evm` partition as of the previous block. Nothing is written.
pub fn trace_transaction<R: KvReader>(
    parent: R,
    block: &EvmBlock,
    tx_hash: &H256,
) -> EvmResult<EvmTrace> {
    let index = block
        .transactions
        .iter()
        .position(|t| &t.hash() == tx_hash)
        .ok_or(EvmError::TransactionNotFound(*tx_hash))?;
    let mut buf = BufferedStateDb::new(SubRealm::new(parent, STATE_PREFIX));
    for (tx, from) in block.transactions[..index].iter().zip(&block.senders) {
        apply(&mut *buf, from, tx)?;
    }
    buf.take_logs();
    let from = block.senders[index];
    let applied = apply(&mut *buf, &from, &block.transactions[index])?;
    trace!("Traced {tx_hash:?}: {} slots written", applied.storage.len());
    Ok(EvmTrace {
        tx_hash: *tx_hash,
        from,
        gas_used: applied.gas_used,
        contract_address: applied.contract_address,
        storage: applied.storage,
        logs: buf.take_logs(),
    })
}

#[cfg(test)]
mod tests {
    use anchor_common::EVM_BLOCK_GAS_LIMIT;
    use bytes::Bytes;
    use ethereum_types::U256;
    use kv_state::Dict;

    use super::*;
    use crate::evm::{LogEntry, StorageWrite};

    fn sender() -> H160 {
        H160::repeat_byte(0x11)
    }

    fn deploy(value: u64) -> EvmTransaction {
        EvmTransaction {
            nonce: 0,
            gas_limit: 1_000_000,
            data: Bytes::from_static(b"\x60\x2a\x60\x00\x55"),
            storage: vec![StorageWrite {
                key: H256::zero(),
                value: H256::from_low_u64_be(value),
            }],
            ..Default::default()
        }
    }

    fn set(contract: H160, nonce: u64, value: u64) -> EvmTransaction {
        EvmTransaction {
            nonce,
            gas_limit: 1_000_000,
            to: Some(contract),
            storage: vec![StorageWrite {
                key: H256::zero(),
                value: H256::from_low_u64_be(value),
            }],
            logs: vec![LogEntry {
                topics: vec![H256::repeat_byte(7)],
                data: Bytes::new(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn deploy_then_call() {
        let mut evm = EvmEmulator::new(Dict::new());
        evm.blockchain_mut().init(1);

        let receipt = evm.send_transaction(sender(), deploy(42), 1, 10).unwrap();
        let contract = receipt.contract_address.unwrap();
        assert_eq!(contract, create_address(&sender(), 0));
        assert_eq!(
            evm.state().get_state(&contract, &H256::zero()),
            H256::from_low_u64_be(42)
        );
        assert_eq!(evm.state().get_nonce(&sender()).unwrap(), 1);
        assert_eq!(evm.state().get_nonce(&contract).unwrap(), 1);

        let receipt = evm.send_transaction(sender(), set(contract, 1, 7), 1, 10).unwrap();
        assert_eq!(receipt.logs.len(), 1);
        assert_eq!(receipt.logs[0].address, contract);
        assert_eq!(
            receipt.cumulative_gas_used,
            evm.blockchain().pending().unwrap().unwrap().gas_used
        );
        assert_eq!(
            evm.state().get_state(&contract, &H256::zero()),
            H256::from_low_u64_be(7)
        );
    }

    #[test]
    fn rejected_transactions_change_nothing() {
        let mut evm = EvmEmulator::new(Dict::new());
        evm.blockchain_mut().init(1);

        let mut tx = deploy(1);
        tx.nonce = 5;
        assert_eq!(
            evm.send_transaction(sender(), tx, 1, 10),
            Err(EvmError::NonceMismatch {
                expected: 0,
                got: 5
            })
        );

        let mut tx = deploy(1);
        tx.value = U256::one();
        assert_eq!(
            evm.send_transaction(sender(), tx, 1, 10),
            Err(EvmError::InsufficientBalance)
        );

        let mut tx = deploy(1);
        tx.gas_limit = 21_000;
        assert!(matches!(
            evm.send_transaction(sender(), tx, 1, 10),
            Err(EvmError::OutOfGas { .. })
        ));

        let mut tx = deploy(1);
        tx.gas_limit = EVM_BLOCK_GAS_LIMIT + 1;
        assert_eq!(
            evm.send_transaction(sender(), tx, 1, 10),
            Err(EvmError::BlockGasLimitExceeded)
        );

        assert_eq!(
            evm.send_transaction(sender(), set(H160::repeat_byte(9), 0, 1), 1, 10),
            Err(EvmError::NoContract(H160::repeat_byte(9)))
        );

        assert_eq!(evm.state().get_nonce(&sender()).unwrap(), 0);
        assert!(evm.blockchain().pending().unwrap().is_none());
    }

    #[test]
    fn value_transfers() {
        let mut evm = EvmEmulator::new(Dict::new());
        evm.state_mut()
            .add_balance(&sender(), U256::from(100))
            .unwrap();
        let to = H160::repeat_byte(0x22);
        let tx = EvmTransaction {
            gas_limit: 21_000,
            to: Some(to),
            value: U256::from(60),
            ..Default::default()
        };
        let receipt = evm.send_transaction(sender(), tx, 1, 10).unwrap();
        assert_eq!(receipt.gas_used, 21_000);
        assert_eq!(evm.state().get_balance(&to).unwrap(), U256::from(60));
        assert_eq!(evm.state().get_balance(&sender()).unwrap(), U256::from(40));
    }

    #[test]
    fn tracing_replays_on_the_parent_state() {
        let mut evm = EvmEmulator::new(Dict::new());
        evm.blockchain_mut().init(1);
        let parent = evm.kv.clone();

        let deployed = deploy(42);
        let receipt = evm.send_transaction(sender(), deployed.clone(), 1, 10).unwrap();
        let contract = receipt.contract_address.unwrap();
        let setter = set(contract, 1, 7);
        evm.send_transaction(sender(), setter.clone(), 1, 10).unwrap();
        let block = evm.blockchain_mut().mint(1, 10).unwrap();

        let trace = trace_transaction(&parent, &block, &deployed.hash()).unwrap();
        assert_eq!(trace.contract_address, Some(contract));
        assert_eq!(
            trace.storage,
            vec![StorageChange {
                address: contract,
                slot: H256::zero(),
                before: H256::zero(),
                after: H256::from_low_u64_be(42),
            }]
        );

        let trace = trace_transaction(&parent, &block, &setter.hash()).unwrap();
        assert_eq!(trace.storage[0].before, H256::from_low_u64_be(42));
        assert_eq!(trace.logs.len(), 1);
        assert_eq!(trace.gas_used, block.receipts[1].gas_used);
    }
}
