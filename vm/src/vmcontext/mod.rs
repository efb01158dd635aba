//! Production of a block.
//!
//! [`run_block`] takes the committed state of a chain, the anchor output
//! carrying its commitment and a batch of requests. Requests run one after
//! the other, each on its own overlay of the state: a request that fails
//! leaves only its receipt and its fee behind. Once the batch is done the
//! block is closed (EVM block minted, internal outputs and block info
//! logged) and the anchor transaction is laid out around the commitment to
//! the new state. Nothing is written to the committed state; the caller
//! commits [`BlockResult::mutations`] once the transaction is confirmed.

mod runreq;

use std::sync::Arc;

use anchor_ledger::{
    Address, AliasOutput, Ed25519Signature, L1Params, OutputId, Transaction, TransactionEssence,
    Unlock,
};
use ed25519_dalek::{Signer, SigningKey};
use kv_state::{BufferedKvStore, L1Commitment, Mutations, StateDb};
use thiserror::Error;
use tracing::{debug, info};

use self::runreq::RequestRunner;
use crate::accounts::{self, InternalOutputs};
use crate::agent::{AgentId, ChainId};
use crate::blocklog::{self as bl, BlockInfo, ControlAddresses, RequestReceipt};
use crate::contracts::{evm, governance, partition, partition_mut, CoreContract, Processors};
use crate::error::{VmError, VmResult};
use crate::request::{Request, RequestId};
use crate::sandbox::BlockEnv;
use crate::txbuilder::{AnchorTxBuilder, StorageDepositAssumption, TxBuilderError};

/// Why a request of the batch was left out of the block.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum SkipReason {
    /// A receipt for the request already exists.
    #[error("request already processed")]
    AlreadyProcessed,

    /// The off-ledger signature does not verify.
    #[error("invalid signature")]
    InvalidSignature,

    /// The off-ledger request names another chain.
    #[error("request addressed to chain {0}")]
    WrongChain(ChainId),

    /// The off-ledger request does not pay for any gas.
    #[error("zero gas budget")]
    ZeroGasBudget,

    /// The nonce was used, skipped over or lies too far ahead.
    #[error("{0}")]
    InvalidNonce(String),

    /// The block already burned all the gas it may.
    #[error("block gas limit reached")]
    BlockGasLimit,

    /// The anchor transaction cannot take the request.
    #[error("anchor transaction: {0}")]
    Limit(TxBuilderError),

    /// The request cannot be taken in at all.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl SkipReason {
    /// Whether the request may fit in a later block.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SkipReason::BlockGasLimit | SkipReason::Limit(_))
    }
}

/// Everything needed to produce the next block of a chain.
#[derive(Clone, Debug)]
pub struct BlockTask {
    /// The anchor output the block consumes.
    pub anchor: AliasOutput,
    /// Its id.
    pub anchor_output_id: OutputId,
    /// The batch, in execution order.
    pub requests: Vec<Request>,
    /// Seconds since the epoch. Raised to the previous block's time if
    /// lower.
    pub timestamp: u64,
    /// Account receiving the validator share of fees. The whole fee goes
    /// to the common account when unset.
    pub validator: Option<AgentId>,
    /// Protocol parameters of the ledger.
    pub l1_params: L1Params,
}

/// A produced block, not yet committed.
#[derive(Clone, Debug)]
pub struct BlockResult {
    /// Index of the block.
    pub block_index: u32,
    /// Time of the block.
    pub timestamp: u64,
    /// The unsigned anchor transaction.
    pub essence: TransactionEssence,
    /// Commitment to the consumed outputs.
    pub inputs_commitment: [u8; 32],
    /// Commitment to the state after the block.
    pub l1_commitment: L1Commitment,
    /// State changes of the block.
    pub mutations: Mutations,
    /// One receipt per processed request, in batch order.
    pub receipts: Vec<RequestReceipt>,
    /// Requests left out, with the reason.
    pub skipped: Vec<(RequestId, SkipReason)>,
    /// New controllers of the anchor, when the block rotates.
    pub rotation: Option<(Address, Address)>,
}

impl BlockResult {
    /// The anchor output produced by the block.
    pub fn next_anchor(&self) -> Option<&AliasOutput> {
        self.essence.outputs.first().and_then(|o| o.as_alias())
    }
}

/// Signs the anchor transaction of a block with the key of the state
/// controller. Every input after the anchor belongs to the chain and is
/// unlocked through it.
pub fn sign_anchor_transaction(essence: TransactionEssence, key: &SigningKey) -> Transaction {
    let signature = key.sign(&essence.signing_message());
    let mut unlocks = vec![Unlock::Signature(Ed25519Signature {
        public_key: key.verifying_key().to_bytes(),
        signature: signature.to_bytes(),
    })];
    unlocks.extend((1..essence.inputs.len()).map(|_| Unlock::Alias(0)));
    Transaction { essence, unlocks }
}

fn check_anchor(state: &StateDb, anchor: &AliasOutput) -> VmResult<BlockInfo> {
    let carried = L1Commitment::from_bytes(&anchor.state_metadata)?;
    let actual = state.commitment();
    if carried != actual {
        return Err(VmError::Fatal(format!(
            "state commitment mismatch: anchor carries {carried}, state is {actual}"
        )));
    }
    let prev = bl::get_latest_block_info(&partition(state, CoreContract::Blocklog.hname()))?
        .ok_or_else(|| VmError::Fatal("chain state has no origin block".into()))?;
    if prev.block_index != anchor.state_index {
        return Err(VmError::Fatal(format!(
            "anchor at state index {} but latest block is {}",
            anchor.state_index, prev.block_index
        )));
    }
    Ok(prev)
}

/// Runs `task` on top of `state` and lays out the anchor transaction of
/// the block.
///
/// Request failures end up in receipts. An error means the block cannot be
/// produced: the state is inconsistent, or the anchor transaction cannot be
/// closed.
pub fn run_block(
    state: &StateDb,
    processors: &Processors,
    task: BlockTask,
) -> VmResult<BlockResult> {
    let BlockTask {
        anchor,
        anchor_output_id,
        requests,
        timestamp,
        validator,
        l1_params,
    } = task;
    let prev = check_anchor(state, &anchor)?;
    let block_index = anchor.state_index + 1;
    let timestamp = timestamp.max(prev.timestamp);

    let blocklog_state = partition(state, CoreContract::Blocklog.hname());
    let tip = (anchor.state_index, anchor_output_id.transaction_id);
    let internal = InternalOutputs::load(
        &partition(state, CoreContract::Accounts.hname()),
        |b| match b == tip.0 {
            true => Some(tip.1),
            false => bl::anchor_tx_id(&blocklog_state, b).ok().flatten(),
        },
    )?;
    let txb = AnchorTxBuilder::new(
        anchor,
        anchor_output_id,
        l1_params.clone(),
        StorageDepositAssumption::new(&l1_params.rent),
        Arc::new(internal),
    )?;

    let gov = partition(state, CoreContract::Governance.hname());
    let env = BlockEnv {
        chain_id: txb.chain_id(),
        block_index,
        timestamp,
        l1_params: &l1_params,
        processors,
    };
    debug!(
        chain_id = %env.chain_id,
        block_index,
        requests = requests.len(),
        "running block"
    );

    let mut block = BufferedKvStore::new(state);
    let mut runner = RequestRunner::new(
        &env,
        txb,
        governance::fee_policy(&gov)?,
        governance::gas_limits(&gov)?,
        validator,
    );
    for request in requests {
        runner.run(&mut block, request)?;
    }
    let RequestRunner {
        txb,
        receipts,
        skipped,
        gas_burned,
        gas_fee_charged,
        ..
    } = runner;

    evm::mint_block(
        &mut partition_mut(&mut block, CoreContract::Evm.hname()),
        block_index,
        timestamp,
    )?;
    accounts::save_internal_outputs(
        &mut partition_mut(&mut block, CoreContract::Accounts.hname()),
        &txb.changed_internal_outputs(),
        block_index,
    );
    let info = BlockInfo {
        block_index,
        timestamp,
        previous_anchor: anchor_output_id,
        previous_l1_commitment: state.commitment(),
        total_requests: receipts.len() as u16,
        successful_requests: receipts.iter().filter(|r| r.is_ok()).count() as u16,
        off_ledger_requests: receipts.iter().filter(|r| r.request.is_off_ledger()).count() as u16,
        gas_burned,
        gas_fee_charged,
    };
    let mut log = partition_mut(&mut block, CoreContract::Blocklog.hname());
    bl::save_block_info(&mut log, &info)?;
    let rotation = txb.next_controllers();
    if let Some((state_controller, governor)) = rotation {
        bl::save_control_addresses(
            &mut log,
            &ControlAddresses {
                state_controller,
                governor,
                since_block_index: block_index + 1,
            },
        )?;
    }
    drop(log);

    let mutations = block.into_mutations();
    let l1_commitment = state.commitment_after(&mutations);
    let (essence, inputs_commitment) = txb.build_essence(&l1_commitment)?;
    info!(
        chain_id = %env.chain_id,
        block_index,
        requests = info.total_requests,
        successful = info.successful_requests,
        skipped = skipped.len(),
        gas_burned,
        %l1_commitment,
        "block produced"
    );
    Ok(BlockResult {
        block_index,
        timestamp,
        essence,
        inputs_commitment,
        l1_commitment,
        mutations,
        receipts,
        skipped,
        rotation,
    })
}
