use anchor_ledger::{Address, BasicOutput, OutputId, TokenId, UnlockCondition, UnlockConditions};
use ethereum_types::U256;

use super::{AnchorTxBuilder, TxBuilderError, TxBuilderResult};

/// The chain's balance of one native token during a block.
#[derive(Clone, Debug)]
pub(super) struct NativeTokenBalance {
    id: TokenId,
    /// The output holding the balance before the block, if any.
    pub(super) input: Option<(BasicOutput, OutputId)>,
    /// The output holding the balance after the block.
    pub(super) out: BasicOutput,
    deposit_held: bool,
}

impl NativeTokenBalance {
    fn new(id: TokenId, chain: Address, deposit: u64) -> Self {
        Self {
            id,
            input: None,
            out: BasicOutput {
                amount: deposit,
                unlock_conditions: UnlockConditions::new().with(UnlockCondition::Address(chain)),
                ..Default::default()
            },
            deposit_held: false,
        }
    }

    fn loaded(id: TokenId, out: BasicOutput, output_id: OutputId) -> Self {
        Self {
            id,
            input: Some((out.clone(), output_id)),
            out,
            deposit_held: true,
        }
    }

    fn in_value(&self) -> U256 {
        self.input
            .as_ref()
            .map(|(o, _)| o.native_tokens.get(&self.id))
            .unwrap_or_default()
    }

    pub(super) fn out_value(&self) -> U256 {
        self.out.native_tokens.get(&self.id)
    }

    fn identical(&self) -> bool {
        self.input.is_some() && self.in_value() == self.out_value()
    }

    pub(super) fn requires_input(&self) -> bool {
        self.input.is_some() && !self.identical()
    }

    pub(super) fn produces_output(&self) -> bool {
        !self.identical() && !self.out_value().is_zero()
    }

    /// Value before the block when an input is needed.
    pub(super) fn input_value(&self) -> Option<(U256, u64)> {
        match (self.requires_input(), &self.input) {
            (true, Some((o, _))) => Some((self.in_value(), o.amount)),
            _ => None,
        }
    }
}

impl AnchorTxBuilder {
    fn ensure_native_token_balance(&mut self, id: TokenId) -> &mut NativeTokenBalance {
        let chain = self.chain_address();
        let deposit = self.sd.native_token_output;
        let loader = self.loader.clone();
        self.native_tokens
            .entry(id)
            .or_insert_with(|| match loader.load_native_token_output(&id) {
                Some((out, output_id)) => NativeTokenBalance::loaded(id, out, output_id),
                None => NativeTokenBalance::new(id, chain, deposit),
            })
    }

    /// Changes the chain's balance of `id` by `amount`, up when `increase`.
    /// Returns the storage deposit adjustment of the L2 base token pool.
    pub(super) fn native_token_delta(
        &mut self,
        id: TokenId,
        amount: U256,
        increase: bool,
    ) -> TxBuilderResult<i64> {
        if amount.is_zero() {
            return Ok(0);
        }
        let balance = self.ensure_native_token_balance(id);
        let current = balance.out_value();
        let next = match increase {
            true => current.checked_add(amount).ok_or(TxBuilderError::Overflow)?,
            false => current
                .checked_sub(amount)
                .ok_or(TxBuilderError::NotEnoughNativeTokensBalance)?,
        };
        balance.out.native_tokens.set(id, next);

        let deposit = balance.out.amount as i64;
        let adjustment = match (balance.deposit_held, next.is_zero()) {
            (true, true) => {
                balance.deposit_held = false;
                deposit
            }
            (false, false) => {
                balance.deposit_held = true;
                -deposit
            }
            _ => 0,
        };
        self.apply_storage_deposit_adjustment(adjustment)
    }

    /// The chain's balance of `id` as it stands in the builder.
    pub fn native_token_balance(&self, id: &TokenId) -> Option<U256> {
        self.native_tokens.get(id).map(NativeTokenBalance::out_value)
    }
}
