use anchor_ledger::{
    Feature, Features, FoundryOutput, OutputId, SimpleTokenScheme, TokenId, UnlockCondition,
    UnlockConditions,
};
use ethereum_types::U256;

use super::{AnchorTxBuilder, TxBuilderError, TxBuilderResult};

/// A change of the circulating supply of a native token.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SupplyChange {
    /// New tokens credited to the chain.
    Mint(U256),
    /// Tokens taken from the chain and destroyed.
    Melt(U256),
}

/// A foundry touched by the block.
#[derive(Clone, Debug)]
pub(super) struct FoundryInvoked {
    /// The foundry before the block; `None` when created by the block.
    pub(super) input: Option<(FoundryOutput, OutputId)>,
    /// The foundry after the block; `None` when destroyed.
    pub(super) out: Option<FoundryOutput>,
}

impl FoundryInvoked {
    pub(super) fn is_new(&self) -> bool {
        self.input.is_none()
    }

    fn identical(&self) -> bool {
        matches!((&self.input, &self.out), (Some((i, _)), Some(o)) if i == o)
    }

    pub(super) fn requires_input(&self) -> bool {
        self.input.is_some() && !self.identical()
    }

    pub(super) fn produces_output(&self) -> bool {
        self.out.is_some() && !self.identical()
    }
}

impl AnchorTxBuilder {
    fn next_foundry_serial_number(&self) -> u32 {
        self.next_foundry_counter() + 1
    }

    /// Creates a foundry controlled by the chain. Returns its serial number
    /// and the storage deposit it takes from the L2 pool.
    pub fn create_foundry(
        &mut self,
        token_scheme: SimpleTokenScheme,
        metadata: Option<Vec<u8>>,
    ) -> TxBuilderResult<(u32, u64)> {
        if self.outputs_are_full() {
            return Err(TxBuilderError::OutputLimitExceeded);
        }
        if !token_scheme.minted_tokens.is_zero()
            || !token_scheme.melted_tokens.is_zero()
            || token_scheme.maximum_supply.is_zero()
        {
            return Err(TxBuilderError::SupplyOutOfBounds);
        }
        let serial_number = self.next_foundry_serial_number();
        let mut features = Features::new();
        if let Some(m) = metadata.filter(|m| !m.is_empty()) {
            features.upsert(Feature::Metadata(m));
        }
        let mut out = FoundryOutput {
            serial_number,
            token_scheme,
            unlock_conditions: UnlockConditions::new()
                .with(UnlockCondition::ImmutableAliasAddress(self.chain_id())),
            features,
            ..Default::default()
        };
        out.amount = self
            .params
            .rent
            .min_storage_deposit(&out.clone().into())
            .max(self.sd.foundry_output);
        let deposit = out.amount;
        self.apply_storage_deposit_adjustment(-(deposit as i64))?;
        self.foundries.insert(
            serial_number,
            FoundryInvoked {
                input: None,
                out: Some(out),
            },
        );
        Ok((serial_number, deposit))
    }

    fn ensure_foundry(&mut self, serial_number: u32) -> TxBuilderResult<&mut FoundryInvoked> {
        if !self.foundries.contains_key(&serial_number) {
            let (out, id) = self
                .loader
                .load_foundry(serial_number)
                .ok_or(TxBuilderError::FoundryNotFound(serial_number))?;
            self.foundries.insert(
                serial_number,
                FoundryInvoked {
                    input: Some((out.clone(), id)),
                    out: Some(out),
                },
            );
        }
        self.foundries
            .get_mut(&serial_number)
            .ok_or(TxBuilderError::FoundryNotFound(serial_number))
    }

    /// Mints or melts tokens of a foundry of the chain. Minted tokens are
    /// credited to the chain's balance, melted ones are taken from it.
    /// Returns the storage deposit adjustment of the L2 pool.
    pub fn modify_foundry_supply(
        &mut self,
        serial_number: u32,
        change: SupplyChange,
    ) -> TxBuilderResult<i64> {
        let f = self.ensure_foundry(serial_number)?;
        let out = f
            .out
            .as_mut()
            .ok_or(TxBuilderError::FoundryNotFound(serial_number))?;
        let token_id = out
            .token_id()
            .ok_or(TxBuilderError::FoundryNotFound(serial_number))?;
        let mut scheme = out.token_scheme;
        let (amount, increase) = match change {
            SupplyChange::Mint(amount) => {
                scheme.minted_tokens = scheme
                    .minted_tokens
                    .checked_add(amount)
                    .ok_or(TxBuilderError::SupplyOutOfBounds)?;
                (amount, true)
            }
            SupplyChange::Melt(amount) => {
                scheme.melted_tokens = scheme
                    .melted_tokens
                    .checked_add(amount)
                    .ok_or(TxBuilderError::SupplyOutOfBounds)?;
                (amount, false)
            }
        };
        if scheme.melted_tokens > scheme.minted_tokens
            || scheme.circulating_supply() > scheme.maximum_supply
        {
            return Err(TxBuilderError::SupplyOutOfBounds);
        }
        out.token_scheme = scheme;
        self.native_token_delta(token_id, amount, increase)
    }

    /// Destroys a foundry whose tokens are all melted. Returns the storage
    /// deposit given back to the L2 pool.
    pub fn destroy_foundry(&mut self, serial_number: u32) -> TxBuilderResult<u64> {
        let f = self.ensure_foundry(serial_number)?;
        let out = f
            .out
            .take()
            .ok_or(TxBuilderError::FoundryNotFound(serial_number))?;
        if !out.token_scheme.circulating_supply().is_zero() {
            f.out = Some(out);
            return Err(TxBuilderError::SupplyOutOfBounds);
        }
        self.apply_storage_deposit_adjustment(out.amount as i64)?;
        Ok(out.amount)
    }

    /// The current output of a foundry, loading it if needed.
    pub fn foundry_output(&mut self, serial_number: u32) -> TxBuilderResult<FoundryOutput> {
        self.ensure_foundry(serial_number)?
            .out
            .clone()
            .ok_or(TxBuilderError::FoundryNotFound(serial_number))
    }

    /// Token ids of the foundries created in this block.
    pub fn created_foundries(&self) -> Vec<TokenId> {
        self.foundries
            .values()
            .filter(|f| f.is_new())
            .filter_map(|f| f.out.as_ref().and_then(FoundryOutput::token_id))
            .collect()
    }
}
