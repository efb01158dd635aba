use std::collections::BTreeMap;

use anchor_ledger::TokenId;
use ethereum_types::U256;
use serde::{Deserialize, Serialize};

use super::{AnchorTxBuilder, TxBuilderError, TxBuilderResult};

/// Per-asset sums of one side of the anchor transaction.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct TransactionTotals {
    /// Base tokens owned by L2 accounts.
    pub base_tokens_in_l2_accounts: u64,
    /// Base tokens locked as storage deposits of the anchor and internal
    /// outputs.
    pub base_tokens_in_storage_deposits: u64,
    /// Native tokens held by the chain.
    pub native_tokens: BTreeMap<TokenId, U256>,
    /// Circulating supply of every foundry involved.
    pub circulating_supplies: BTreeMap<TokenId, U256>,
    /// Base tokens leaving the chain in posted outputs.
    pub sent_out_base_tokens: u64,
    /// Native tokens leaving the chain in posted outputs.
    pub sent_out_native_tokens: BTreeMap<TokenId, U256>,
}

impl TransactionTotals {
    fn total_base_tokens(&self) -> TxBuilderResult<u64> {
        self.base_tokens_in_l2_accounts
            .checked_add(self.base_tokens_in_storage_deposits)
            .and_then(|v| v.checked_add(self.sent_out_base_tokens))
            .ok_or(TxBuilderError::Overflow)
    }
}

fn add_to(map: &mut BTreeMap<TokenId, U256>, id: TokenId, amount: U256) -> TxBuilderResult<()> {
    let e = map.entry(id).or_default();
    *e = e.checked_add(amount).ok_or(TxBuilderError::Overflow)?;
    Ok(())
}

impl AnchorTxBuilder {
    fn sum_inputs(&self) -> TxBuilderResult<TransactionTotals> {
        let mut totals = TransactionTotals {
            base_tokens_in_l2_accounts: self.anchor.amount - self.sd.anchor_output,
            base_tokens_in_storage_deposits: self.sd.anchor_output,
            ..Default::default()
        };
        for (id, b) in &self.native_tokens {
            if let Some((value, deposit)) = b.input_value() {
                add_to(&mut totals.native_tokens, *id, value)?;
                totals.base_tokens_in_storage_deposits += deposit;
            }
        }
        for req in &self.consumed {
            let tokens = req.fungible_tokens();
            totals.base_tokens_in_l2_accounts = totals
                .base_tokens_in_l2_accounts
                .checked_add(tokens.base_tokens)
                .ok_or(TxBuilderError::Overflow)?;
            for nt in tokens.native_tokens.iter() {
                add_to(&mut totals.native_tokens, nt.id, nt.amount)?;
            }
        }
        for f in self.foundries.values() {
            if let (true, Some((out, _))) = (f.requires_input(), &f.input) {
                totals.base_tokens_in_storage_deposits += out.amount;
                if let Some(id) = out.token_id() {
                    totals
                        .circulating_supplies
                        .insert(id, out.token_scheme.circulating_supply());
                }
            }
        }
        for n in self.nfts.values() {
            if let (true, Some((out, _))) = (n.requires_input(), &n.input) {
                totals.base_tokens_in_storage_deposits += out.amount;
            }
        }
        Ok(totals)
    }

    fn sum_outputs(&self) -> TxBuilderResult<TransactionTotals> {
        let mut totals = TransactionTotals {
            base_tokens_in_l2_accounts: self.total_base_tokens_in_l2_accounts,
            base_tokens_in_storage_deposits: self.sd.anchor_output,
            ..Default::default()
        };
        for (id, b) in &self.native_tokens {
            if b.produces_output() {
                add_to(&mut totals.native_tokens, *id, b.out_value())?;
                totals.base_tokens_in_storage_deposits += b.out.amount;
            }
        }
        for f in self.foundries.values() {
            if let (true, Some(out)) = (f.produces_output(), &f.out) {
                totals.base_tokens_in_storage_deposits += out.amount;
                if let Some(id) = out.token_id() {
                    totals
                        .circulating_supplies
                        .insert(id, out.token_scheme.circulating_supply());
                }
            }
        }
        for n in self.nfts.values() {
            if n.produces_output() {
                totals.base_tokens_in_storage_deposits += n.out.amount;
            }
        }
        for out in &self.posted {
            totals.sent_out_base_tokens = totals
                .sent_out_base_tokens
                .checked_add(out.amount())
                .ok_or(TxBuilderError::Overflow)?;
            for nt in out.native_tokens().iter() {
                add_to(&mut totals.sent_out_native_tokens, nt.id, nt.amount)?;
            }
        }
        Ok(totals)
    }

    /// Sums of the input side and of the output side, after checking that
    /// they balance.
    pub fn totals(&self) -> TxBuilderResult<(TransactionTotals, TransactionTotals)> {
        let ins = self.sum_inputs()?;
        let outs = self.sum_outputs()?;

        let base_in = ins.total_base_tokens()?;
        let base_out = outs.total_base_tokens()?;
        if base_in != base_out {
            return Err(TxBuilderError::Unbalanced(format!(
                "base tokens in {base_in} != out {base_out}"
            )));
        }

        let ids = ins
            .native_tokens
            .keys()
            .chain(outs.native_tokens.keys())
            .chain(outs.sent_out_native_tokens.keys())
            .chain(outs.circulating_supplies.keys());
        for id in ids {
            let get = |m: &BTreeMap<TokenId, U256>| m.get(id).copied().unwrap_or_default();
            // Supply changes of a foundry touched by the block.
            let (minted, melted) = match (
                outs.circulating_supplies.get(id),
                ins.circulating_supplies.get(id),
            ) {
                (Some(after), Some(before)) if after >= before => (*after - *before, U256::zero()),
                (Some(after), Some(before)) => (U256::zero(), *before - *after),
                (Some(after), None) => (*after, U256::zero()),
                (None, Some(before)) => (U256::zero(), *before),
                (None, None) => (U256::zero(), U256::zero()),
            };
            let lhs = get(&ins.native_tokens)
                .checked_add(minted)
                .ok_or(TxBuilderError::Overflow)?;
            let rhs = get(&outs.native_tokens)
                .checked_add(get(&outs.sent_out_native_tokens))
                .and_then(|v| v.checked_add(melted))
                .ok_or(TxBuilderError::Overflow)?;
            if lhs != rhs {
                return Err(TxBuilderError::Unbalanced(format!(
                    "native token {id}: in {lhs} != out {rhs}"
                )));
            }
        }
        Ok((ins, outs))
    }

    /// Fails if inputs and outputs do not balance for every asset.
    pub fn balanced_check(&self) -> TxBuilderResult<()> {
        self.totals().map(|_| ())
    }
}
