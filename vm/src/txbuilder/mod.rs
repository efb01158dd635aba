//! Builder of the anchor transaction of a block.
//!
//! The builder follows the execution of a batch: every consumed request and
//! every output posted by a contract passes through it, and it keeps the
//! base token pool of the chain, the internal native token outputs, the
//! foundries and the NFTs held by the chain in sync with those changes. At
//! the end of the block [`AnchorTxBuilder::build_essence`] lays the
//! transaction out in a fixed order:
//!
//! | inputs                                | outputs                          |
//! |---------------------------------------|----------------------------------|
//! | previous anchor                       | next anchor                      |
//! | consumed requests, in consume order   | changed native token outputs     |
//! | native token outputs, by token id     | changed foundries, by serial     |
//! | foundries, by serial number           | NFTs kept by the chain, by id    |
//! | NFTs, by id                           | posted outputs, in posting order |
//!
//! Internal outputs hold a storage deposit taken out of the L2 base token
//! pool. Calls that create or destroy an internal output return the change
//! of that pool (negative when a deposit is charged) so that the caller can
//! mirror it in the L2 accounts.

mod foundries;
mod nativetokens;
mod nfts;
mod totals;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anchor_ledger::tokens::MAX_NATIVE_TOKENS_PER_OUTPUT;
use anchor_ledger::{
    inputs_commitment, Address, AliasId, AliasOutput, BasicOutput, Feature, Features,
    FoundryOutput, L1Params, NftId, NftOutput, Output, OutputId, RentStructure,
    SimpleTokenScheme, TokenId, TransactionEssence, UnlockCondition, UnlockConditions,
};
use ethereum_types::U256;
use kv_state::codec::{decode_u64, KvDecodeError, KvResult};
use kv_state::L1Commitment;
use log::trace;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::foundries::SupplyChange;
use self::foundries::FoundryInvoked;
use self::nativetokens::NativeTokenBalance;
use self::nfts::NftIncluded;
pub use self::totals::TransactionTotals;
use crate::request::OnLedgerRequest;

/// Alias for the result of builder operations.
pub type TxBuilderResult<T> = Result<T, TxBuilderError>;

/// Why the anchor transaction cannot take a change.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum TxBuilderError {
    /// The transaction already has the maximum number of inputs.
    #[error("input limit exceeded")]
    InputLimitExceeded,

    /// The transaction already has the maximum number of outputs.
    #[error("output limit exceeded")]
    OutputLimitExceeded,

    /// A single output carries more native tokens than allowed.
    #[error("too many native tokens in one output")]
    NativeTokenCountExceeded,

    /// The transaction would move more distinct native tokens than allowed.
    #[error("total native tokens limit exceeded")]
    TotalNativeTokensLimitExceeded,

    /// The L2 base token pool cannot cover a payment.
    #[error("not enough base tokens balance")]
    NotEnoughBaseTokensBalance,

    /// The chain does not hold enough of a native token.
    #[error("not enough native tokens balance")]
    NotEnoughNativeTokensBalance,

    /// The L2 base token pool cannot pay for the deposit of a new internal
    /// output.
    #[error("not enough funds for internal storage deposit")]
    NotEnoughFundsForInternalStorageDeposit,

    /// An output holds less than its storage deposit.
    #[error("not enough base tokens for storage deposit: available {available} < required {required}")]
    InsufficientStorageDeposit {
        /// Base tokens in the output.
        available: u64,
        /// Minimum storage deposit.
        required: u64,
    },

    /// The chain controls no foundry with that serial number.
    #[error("foundry {0} not found")]
    FoundryNotFound(u32),

    /// Minting or melting would leave the supply out of bounds.
    #[error("native token supply out of bounds")]
    SupplyOutOfBounds,

    /// The chain does not hold the NFT.
    #[error("NFT {0} not found")]
    NftNotFound(NftId),

    /// An amount does not fit its type.
    #[error("overflow")]
    Overflow,

    /// Inputs and outputs do not balance. The state is corrupted.
    #[error("unbalanced anchor transaction: {0}")]
    Unbalanced(String),
}

/// Storage deposits the chain sets aside for the anchor and for each kind of
/// internal output. These are assumed not to grow during the life of a
/// chain.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct StorageDepositAssumption {
    /// Deposit of the anchor output.
    pub anchor_output: u64,
    /// Deposit of an internal native token output.
    pub native_token_output: u64,
    /// Deposit of an NFT output held by the chain.
    pub nft_output: u64,
    /// Deposit of a foundry output.
    pub foundry_output: u64,
}

impl StorageDepositAssumption {
    /// Computes the deposits of outputs of the shapes the chain produces.
    pub fn new(rent: &RentStructure) -> Self {
        let chain = Address::Alias(AliasId::null());
        let anchor = AliasOutput {
            state_metadata: vec![0; L1Commitment::LEN],
            unlock_conditions: UnlockConditions::new()
                .with(UnlockCondition::StateControllerAddress(chain))
                .with(UnlockCondition::GovernorAddress(chain)),
            features: Features::new().with(Feature::Sender(chain)),
            ..Default::default()
        };
        let native_token = BasicOutput {
            native_tokens: [anchor_ledger::NativeToken {
                id: TokenId::null(),
                amount: U256::MAX,
            }]
            .into_iter()
            .collect(),
            unlock_conditions: UnlockConditions::new().with(UnlockCondition::Address(chain)),
            ..Default::default()
        };
        let nft = NftOutput {
            unlock_conditions: UnlockConditions::new().with(UnlockCondition::Address(chain)),
            ..Default::default()
        };
        let foundry = FoundryOutput {
            token_scheme: SimpleTokenScheme {
                minted_tokens: U256::MAX,
                melted_tokens: U256::MAX,
                maximum_supply: U256::MAX,
            },
            unlock_conditions: UnlockConditions::new()
                .with(UnlockCondition::ImmutableAliasAddress(AliasId::null())),
            ..Default::default()
        };
        Self {
            anchor_output: rent.min_storage_deposit(&anchor.into()),
            native_token_output: rent.min_storage_deposit(&native_token.into()),
            nft_output: rent.min_storage_deposit(&nft.into()),
            foundry_output: rent.min_storage_deposit(&foundry.into()),
        }
    }

    /// Stored form.
    pub fn to_bytes(&self) -> Vec<u8> {
        [
            self.anchor_output,
            self.native_token_output,
            self.nft_output,
            self.foundry_output,
        ]
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect()
    }

    /// Parses the stored form.
    pub fn from_bytes(b: &[u8]) -> KvResult<Self> {
        if b.len() != 32 {
            return Err(KvDecodeError::WrongLength {
                what: "storage deposit assumption",
                expected: 32,
                got: b.len(),
            });
        }
        Ok(Self {
            anchor_output: decode_u64(&b[..8])?,
            native_token_output: decode_u64(&b[8..16])?,
            nft_output: decode_u64(&b[16..24])?,
            foundry_output: decode_u64(&b[24..])?,
        })
    }
}

/// Finds the internal outputs the chain produced in earlier blocks. `None`
/// means the output has not been materialised yet.
pub trait OutputLoader: fmt::Debug {
    /// The output holding the chain's balance of a native token.
    fn load_native_token_output(&self, id: &TokenId) -> Option<(BasicOutput, OutputId)>;

    /// A foundry of the chain.
    fn load_foundry(&self, serial_number: u32) -> Option<(FoundryOutput, OutputId)>;

    /// An NFT held by the chain.
    fn load_nft(&self, id: &NftId) -> Option<(NftOutput, OutputId)>;
}

/// Loader for a chain that holds no internal outputs.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOutputs;

impl OutputLoader for NoOutputs {
    fn load_native_token_output(&self, _id: &TokenId) -> Option<(BasicOutput, OutputId)> {
        None
    }

    fn load_foundry(&self, _serial_number: u32) -> Option<(FoundryOutput, OutputId)> {
        None
    }

    fn load_nft(&self, _id: &NftId) -> Option<(NftOutput, OutputId)> {
        None
    }
}

/// How an internal output changes with the block: `Some((output, index))`
/// when the block produces it at `index`, `None` when it is consumed and not
/// reproduced.
pub type OutputChange<T> = Option<(T, u16)>;

/// Internal outputs touched by the block, with their place in the
/// transaction.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InternalOutputChanges {
    /// Native token outputs.
    pub native_tokens: Vec<(TokenId, OutputChange<BasicOutput>)>,
    /// Foundries.
    pub foundries: Vec<(u32, OutputChange<FoundryOutput>)>,
    /// NFTs.
    pub nfts: Vec<(NftId, OutputChange<NftOutput>)>,
}

/// Accumulates the effects of a batch and produces the anchor transaction.
///
/// Cloning is cheap enough to snapshot the builder before every request.
#[derive(Clone, Debug)]
pub struct AnchorTxBuilder {
    anchor: AliasOutput,
    anchor_output_id: OutputId,
    params: L1Params,
    sd: StorageDepositAssumption,
    loader: Arc<dyn OutputLoader + Send + Sync>,
    consumed: Vec<OnLedgerRequest>,
    // Base tokens owned by L2 accounts; excludes every storage deposit.
    total_base_tokens_in_l2_accounts: u64,
    native_tokens: BTreeMap<TokenId, NativeTokenBalance>,
    foundries: BTreeMap<u32, FoundryInvoked>,
    nfts: BTreeMap<NftId, NftIncluded>,
    posted: Vec<Output>,
    next_controllers: Option<(Address, Address)>,
}

impl AnchorTxBuilder {
    /// Starts a block on top of `anchor`.
    pub fn new(
        anchor: AliasOutput,
        anchor_output_id: OutputId,
        params: L1Params,
        sd: StorageDepositAssumption,
        loader: Arc<dyn OutputLoader + Send + Sync>,
    ) -> TxBuilderResult<Self> {
        let total = anchor.amount.checked_sub(sd.anchor_output).ok_or(
            TxBuilderError::InsufficientStorageDeposit {
                available: anchor.amount,
                required: sd.anchor_output,
            },
        )?;
        Ok(Self {
            anchor,
            anchor_output_id,
            params,
            sd,
            loader,
            consumed: Vec::new(),
            total_base_tokens_in_l2_accounts: total,
            native_tokens: BTreeMap::new(),
            foundries: BTreeMap::new(),
            nfts: BTreeMap::new(),
            posted: Vec::new(),
            next_controllers: None,
        })
    }

    /// A copy to return to with [`AnchorTxBuilder::restore`].
    pub fn snapshot(&self) -> Self {
        self.clone()
    }

    /// Drops every change made since `snapshot` was taken.
    pub fn restore(&mut self, snapshot: Self) {
        *self = snapshot;
    }

    /// The anchor consumed by the block.
    pub fn anchor(&self) -> &AliasOutput {
        &self.anchor
    }

    /// The alias id of the chain.
    pub fn chain_id(&self) -> AliasId {
        self.anchor.alias_id.or_from_output_id(&self.anchor_output_id)
    }

    fn chain_address(&self) -> Address {
        Address::Alias(self.chain_id())
    }

    /// The storage deposits in use.
    pub fn storage_deposit_assumption(&self) -> &StorageDepositAssumption {
        &self.sd
    }

    /// Base tokens owned by L2 accounts, storage deposits excluded.
    pub fn total_base_tokens_in_l2_accounts(&self) -> u64 {
        self.total_base_tokens_in_l2_accounts
    }

    /// Number of requests consumed so far.
    pub fn num_consumed(&self) -> usize {
        self.consumed.len()
    }

    /// Consumes an on-ledger request. Everything it carries joins the chain.
    ///
    /// Fails without changing anything when the inputs are full. Any other
    /// failure may leave the builder inconsistent; restore a snapshot.
    pub fn consume(&mut self, req: &OnLedgerRequest) -> TxBuilderResult<i64> {
        if self.inputs_are_full() {
            return Err(TxBuilderError::InputLimitExceeded);
        }
        let tokens = req.fungible_tokens();
        if tokens.native_tokens.len() > MAX_NATIVE_TOKENS_PER_OUTPUT {
            return Err(TxBuilderError::NativeTokenCountExceeded);
        }
        self.consumed.push(req.clone());
        self.add_base_tokens_to_total(tokens.base_tokens)?;

        let mut adjustment = 0i64;
        for nt in tokens.native_tokens.iter() {
            adjustment += self.native_token_delta(nt.id, nt.amount, true)?;
        }
        if let Some(nft) = req.output().as_nft() {
            adjustment += self.consume_nft(nft, req.output_id())?;
        }
        self.check_limits()?;
        trace!(
            "consumed {}: {} base tokens, adjustment {adjustment}",
            req.output_id(),
            tokens.base_tokens
        );
        Ok(adjustment)
    }

    /// Posts an output paid from the chain's funds.
    ///
    /// Fails without changing anything when the outputs are full or the
    /// output is below its storage deposit.
    pub fn add_output(&mut self, output: Output) -> TxBuilderResult<i64> {
        if self.outputs_are_full() {
            return Err(TxBuilderError::OutputLimitExceeded);
        }
        if output.native_tokens().len() > MAX_NATIVE_TOKENS_PER_OUTPUT {
            return Err(TxBuilderError::NativeTokenCountExceeded);
        }
        let required = self.params.rent.min_storage_deposit(&output);
        if output.amount() < required {
            return Err(TxBuilderError::InsufficientStorageDeposit {
                available: output.amount(),
                required,
            });
        }
        self.sub_base_tokens_from_total(output.amount())?;

        let mut adjustment = 0i64;
        for nt in output.native_tokens().iter() {
            adjustment += self.native_token_delta(nt.id, nt.amount, false)?;
        }
        if let Some(nft) = output.as_nft() {
            adjustment += self.send_nft(nft)?;
        }
        self.posted.push(output);
        self.check_limits()?;
        Ok(adjustment)
    }

    /// Makes the next anchor use new controllers.
    pub fn rotate_to(&mut self, state_controller: Address, governor: Address) {
        self.next_controllers = Some((state_controller, governor));
    }

    /// The controllers set by [`AnchorTxBuilder::rotate_to`], if any.
    pub fn next_controllers(&self) -> Option<(Address, Address)> {
        self.next_controllers
    }

    /// Whether another input would exceed the limit.
    pub fn inputs_are_full(&self) -> bool {
        self.num_inputs() >= self.params.max_inputs
    }

    /// Whether another output would exceed the limit.
    pub fn outputs_are_full(&self) -> bool {
        self.num_outputs() >= self.params.max_outputs
    }

    fn num_inputs(&self) -> usize {
        1 + self.consumed.len()
            + self.native_tokens.values().filter(|b| b.requires_input()).count()
            + self.foundries.values().filter(|f| f.requires_input()).count()
            + self.nfts.values().filter(|n| n.requires_input()).count()
    }

    fn num_outputs(&self) -> usize {
        1 + self.posted.len()
            + self.native_tokens.values().filter(|b| b.produces_output()).count()
            + self.foundries.values().filter(|f| f.produces_output()).count()
            + self.nfts.values().filter(|n| n.produces_output()).count()
    }

    fn check_limits(&self) -> TxBuilderResult<()> {
        if self.num_inputs() > self.params.max_inputs {
            return Err(TxBuilderError::InputLimitExceeded);
        }
        if self.num_outputs() > self.params.max_outputs {
            return Err(TxBuilderError::OutputLimitExceeded);
        }
        let touched = self
            .native_tokens
            .values()
            .filter(|b| b.requires_input() || b.produces_output())
            .count();
        if touched > self.params.max_native_tokens_per_tx {
            return Err(TxBuilderError::TotalNativeTokensLimitExceeded);
        }
        Ok(())
    }

    fn add_base_tokens_to_total(&mut self, delta: u64) -> TxBuilderResult<()> {
        let total = self
            .total_base_tokens_in_l2_accounts
            .checked_add(delta)
            .ok_or(TxBuilderError::Overflow)?;
        total
            .checked_add(self.sd.anchor_output)
            .ok_or(TxBuilderError::Overflow)?;
        self.total_base_tokens_in_l2_accounts = total;
        Ok(())
    }

    fn sub_base_tokens_from_total(&mut self, delta: u64) -> TxBuilderResult<()> {
        self.total_base_tokens_in_l2_accounts = self
            .total_base_tokens_in_l2_accounts
            .checked_sub(delta)
            .ok_or(TxBuilderError::NotEnoughBaseTokensBalance)?;
        Ok(())
    }

    // Moves a storage deposit between the L2 pool and an internal output.
    fn apply_storage_deposit_adjustment(&mut self, adjustment: i64) -> TxBuilderResult<i64> {
        let amount = adjustment.unsigned_abs();
        if adjustment < 0 {
            self.total_base_tokens_in_l2_accounts = self
                .total_base_tokens_in_l2_accounts
                .checked_sub(amount)
                .ok_or(TxBuilderError::NotEnoughFundsForInternalStorageDeposit)?;
        } else {
            self.add_base_tokens_to_total(amount)?;
        }
        Ok(adjustment)
    }

    fn next_foundry_counter(&self) -> u32 {
        self.anchor.foundry_counter + self.foundries.values().filter(|f| f.is_new()).count() as u32
    }

    /// Internal outputs that change with the block, with the index each
    /// produced one will have in the transaction.
    pub fn changed_internal_outputs(&self) -> InternalOutputChanges {
        let mut index = 1u16;
        let mut next = || {
            let i = index;
            index += 1;
            i
        };
        let mut ret = InternalOutputChanges::default();
        for (id, b) in &self.native_tokens {
            if b.produces_output() {
                ret.native_tokens.push((*id, Some((b.out.clone(), next()))));
            } else if b.requires_input() {
                ret.native_tokens.push((*id, None));
            }
        }
        for (sn, f) in &self.foundries {
            match (&f.out, f.produces_output(), f.requires_input()) {
                (Some(out), true, _) => ret.foundries.push((*sn, Some((out.clone(), next())))),
                (_, false, true) => ret.foundries.push((*sn, None)),
                _ => {}
            }
        }
        for (id, n) in &self.nfts {
            if n.produces_output() {
                ret.nfts.push((*id, Some((n.out.clone(), next()))));
            } else if n.requires_input() {
                ret.nfts.push((*id, None));
            }
        }
        ret
    }

    fn inputs(&self) -> Vec<(OutputId, Output)> {
        let mut ret = vec![(self.anchor_output_id, Output::Alias(self.anchor.clone()))];
        ret.extend(
            self.consumed
                .iter()
                .map(|r| (r.output_id(), r.output().clone())),
        );
        for b in self.native_tokens.values() {
            if let (true, Some((out, id))) = (b.requires_input(), &b.input) {
                ret.push((*id, Output::Basic(out.clone())));
            }
        }
        for f in self.foundries.values() {
            if let (true, Some((out, id))) = (f.requires_input(), &f.input) {
                ret.push((*id, Output::Foundry(out.clone())));
            }
        }
        for n in self.nfts.values() {
            if let (true, Some((out, id))) = (n.requires_input(), &n.input) {
                ret.push((*id, Output::Nft(out.clone())));
            }
        }
        ret
    }

    fn next_anchor(&self, l1_commitment: &L1Commitment) -> TxBuilderResult<AliasOutput> {
        let alias_id = self.chain_id();
        let (state_controller, governor) = match self.next_controllers {
            Some(c) => c,
            None => (
                *self.anchor.state_controller().ok_or_else(|| {
                    TxBuilderError::Unbalanced("anchor has no state controller".into())
                })?,
                *self.anchor.governor().ok_or_else(|| {
                    TxBuilderError::Unbalanced("anchor has no governor".into())
                })?,
            ),
        };
        let amount = self
            .total_base_tokens_in_l2_accounts
            .checked_add(self.sd.anchor_output)
            .ok_or(TxBuilderError::Overflow)?;
        Ok(AliasOutput {
            amount,
            native_tokens: Default::default(),
            alias_id,
            state_index: self.anchor.state_index + 1,
            state_metadata: l1_commitment.to_bytes(),
            foundry_counter: self.next_foundry_counter(),
            unlock_conditions: UnlockConditions::new()
                .with(UnlockCondition::StateControllerAddress(state_controller))
                .with(UnlockCondition::GovernorAddress(governor)),
            features: Features::new().with(Feature::Sender(Address::Alias(alias_id))),
            immutable_features: self.anchor.immutable_features.clone(),
        })
    }

    fn outputs(&self, l1_commitment: &L1Commitment) -> TxBuilderResult<Vec<Output>> {
        let mut ret = vec![Output::Alias(self.next_anchor(l1_commitment)?)];
        ret.extend(
            self.native_tokens
                .values()
                .filter(|b| b.produces_output())
                .map(|b| Output::Basic(b.out.clone())),
        );
        ret.extend(self.foundries.values().filter_map(|f| match f.produces_output() {
            true => f.out.clone().map(Output::Foundry),
            false => None,
        }));
        ret.extend(
            self.nfts
                .values()
                .filter(|n| n.produces_output())
                .map(|n| Output::Nft(n.out.clone())),
        );
        ret.extend(self.posted.iter().cloned());
        Ok(ret)
    }

    /// Produces the essence of the anchor transaction and the commitment to
    /// its inputs. The new anchor carries `l1_commitment` as its state
    /// metadata.
    pub fn build_essence(
        &self,
        l1_commitment: &L1Commitment,
    ) -> TxBuilderResult<(TransactionEssence, [u8; 32])> {
        self.balanced_check()?;
        let inputs = self.inputs();
        if inputs.len() != self.num_inputs() {
            return Err(TxBuilderError::Unbalanced(format!(
                "expected {} inputs, laid out {}",
                self.num_inputs(),
                inputs.len()
            )));
        }
        let commitment = inputs_commitment(inputs.iter().map(|(_, o)| o));
        let essence = TransactionEssence {
            network_id: self.params.network_id,
            inputs: inputs.into_iter().map(|(id, _)| id).collect(),
            inputs_commitment: commitment,
            outputs: self.outputs(l1_commitment)?,
        };
        Ok((essence, commitment))
    }
}

#[cfg(test)]
mod tests;
