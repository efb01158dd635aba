//! The origin of a chain: the state of block 0 and the transaction that
//! creates the anchor committing to it.
//!
//! The origin state does not depend on the chain id, which is only known
//! once the origin transaction is signed: the id is derived from the first
//! output of that transaction.

use anchor_ledger::{
    inputs_commitment, Address, AliasId, AliasOutput, BasicOutput, Ed25519Signature,
    FungibleTokens, L1Params, Output, OutputId, Transaction, TransactionEssence, Unlock,
    UnlockCondition, UnlockConditions,
};
use ed25519_dalek::{Signer, SigningKey};
use kv_state::{BufferedKvStore, L1Commitment, Mutations, StateDb};
use tracing::info;

use crate::accounts;
use crate::agent::{AgentId, ChainId};
use crate::blocklog::{self as bl, BlockInfo, ControlAddresses};
use crate::contracts::{evm, governance, partition_mut, root, CoreContract};
use crate::error::{VmError, VmResult};
use crate::gas::{GasFeePolicy, GasLimits};
use crate::txbuilder::{StorageDepositAssumption, TxBuilderError};

/// Settings of a new chain.
#[derive(Clone, Debug)]
pub struct OriginParams {
    /// Owner of the chain; receives the funds of the anchor on L2.
    pub owner: AgentId,
    /// First state controller of the anchor.
    pub state_controller: Address,
    /// Governor of the anchor.
    pub governor: Address,
    /// Initial fee policy.
    pub fee_policy: GasFeePolicy,
    /// Initial gas limits.
    pub gas_limits: GasLimits,
    /// Time of block 0.
    pub timestamp: u64,
}

/// The state of block 0 of a chain whose anchor holds `anchor_amount`.
pub fn origin_mutations(
    params: &OriginParams,
    l1_params: &L1Params,
    anchor_amount: u64,
) -> VmResult<Mutations> {
    let sd = StorageDepositAssumption::new(&l1_params.rent);
    let funds = anchor_amount.checked_sub(sd.anchor_output).ok_or(
        TxBuilderError::InsufficientStorageDeposit {
            available: anchor_amount,
            required: sd.anchor_output,
        },
    )?;
    let mut state = BufferedKvStore::new(StateDb::new());

    let mut registry = partition_mut(&mut state, CoreContract::Root.hname());
    for c in CoreContract::ALL {
        let processor = c.processor();
        root::register_contract(
            &mut registry,
            c.hname(),
            &root::ContractRecord {
                program_hash: processor.program_hash(),
                name: c.name().to_string(),
                description: processor.description().to_string(),
                deployer: AgentId::Nil,
            },
        )?;
    }
    drop(registry);

    if funds > 0 {
        accounts::credit(
            &mut partition_mut(&mut state, CoreContract::Accounts.hname()),
            &params.owner,
            &FungibleTokens::with_base_tokens(funds),
        )?;
    }
    governance::init_state(
        &mut partition_mut(&mut state, CoreContract::Governance.hname()),
        &params.owner,
        &params.fee_policy,
        &params.gas_limits,
    );

    let mut log = partition_mut(&mut state, CoreContract::Blocklog.hname());
    bl::save_block_info(
        &mut log,
        &BlockInfo {
            block_index: 0,
            timestamp: params.timestamp,
            ..Default::default()
        },
    )?;
    bl::save_control_addresses(
        &mut log,
        &ControlAddresses {
            state_controller: params.state_controller,
            governor: params.governor,
            since_block_index: 0,
        },
    )?;
    drop(log);

    evm::init_state(
        &mut partition_mut(&mut state, CoreContract::Evm.hname()),
        params.timestamp,
    );
    Ok(state.into_mutations())
}

/// The committed state of block 0 and its commitment.
pub fn origin_state(
    params: &OriginParams,
    l1_params: &L1Params,
    anchor_amount: u64,
) -> VmResult<(StateDb, L1Commitment)> {
    let muts = origin_mutations(params, l1_params, anchor_amount)?;
    let mut db = StateDb::new();
    let commitment = db.commit(&muts);
    Ok((db, commitment))
}

/// The anchor created by the origin transaction.
pub fn origin_anchor(
    params: &OriginParams,
    anchor_amount: u64,
    commitment: &L1Commitment,
) -> AliasOutput {
    AliasOutput {
        amount: anchor_amount,
        state_metadata: commitment.to_bytes(),
        unlock_conditions: UnlockConditions::new()
            .with(UnlockCondition::StateControllerAddress(params.state_controller))
            .with(UnlockCondition::GovernorAddress(params.governor)),
        ..Default::default()
    }
}

/// Lays out the origin transaction. `inputs` are outputs of `wallet`
/// paying for the anchor; whatever they hold beyond `anchor_amount` returns
/// to `wallet` in a second output.
pub fn origin_transaction_essence(
    params: &OriginParams,
    l1_params: &L1Params,
    anchor_amount: u64,
    wallet: Address,
    inputs: &[(OutputId, Output)],
) -> VmResult<TransactionEssence> {
    let mut available = FungibleTokens::default();
    for (_, out) in inputs {
        let ok = available.add(&FungibleTokens {
            base_tokens: out.amount(),
            native_tokens: out.native_tokens().clone(),
        });
        if !ok {
            return Err(TxBuilderError::Overflow.into());
        }
    }
    let remainder = available
        .base_tokens
        .checked_sub(anchor_amount)
        .ok_or(VmError::NotEnoughFunds)?;

    let commitment = origin_mutations(params, l1_params, anchor_amount)
        .map(|muts| StateDb::new().commitment_after(&muts))?;
    let mut outputs = vec![Output::Alias(origin_anchor(
        params,
        anchor_amount,
        &commitment,
    ))];
    if remainder > 0 || !available.native_tokens.is_empty() {
        let change = Output::Basic(BasicOutput {
            amount: remainder,
            native_tokens: available.native_tokens,
            unlock_conditions: UnlockConditions::new().with(UnlockCondition::Address(wallet)),
            ..Default::default()
        });
        let required = l1_params.rent.min_storage_deposit(&change);
        if remainder < required {
            return Err(TxBuilderError::InsufficientStorageDeposit {
                available: remainder,
                required,
            }
            .into());
        }
        outputs.push(change);
    }
    info!(%commitment, anchor_amount, remainder, "origin transaction prepared");
    Ok(TransactionEssence {
        network_id: l1_params.network_id,
        inputs: inputs.iter().map(|(id, _)| *id).collect(),
        inputs_commitment: inputs_commitment(inputs.iter().map(|(_, o)| o)),
        outputs,
    })
}

/// Signs an origin transaction whose inputs all belong to the address of
/// `key`.
pub fn sign_origin_transaction(essence: TransactionEssence, key: &SigningKey) -> Transaction {
    let signature = key.sign(&essence.signing_message());
    let mut unlocks = vec![Unlock::Signature(Ed25519Signature {
        public_key: key.verifying_key().to_bytes(),
        signature: signature.to_bytes(),
    })];
    unlocks.extend((1..essence.inputs.len()).map(|_| Unlock::Reference(0)));
    Transaction { essence, unlocks }
}

/// The id of the chain created by a signed origin transaction.
pub fn chain_id_of(origin: &Transaction) -> ChainId {
    AliasId::from_output_id(&OutputId::new(origin.id(), 0))
}
