use anchor_ledger::{NftId, NftOutput, OutputId, UnlockCondition, UnlockConditions};

use super::{AnchorTxBuilder, TxBuilderError, TxBuilderResult};

/// An NFT that enters or leaves the chain in the block.
#[derive(Clone, Debug)]
pub(super) struct NftIncluded {
    /// The output holding the NFT since an earlier block.
    pub(super) input: Option<(NftOutput, OutputId)>,
    /// The output holding the NFT for the chain.
    pub(super) out: NftOutput,
    sent_outside: bool,
}

impl NftIncluded {
    pub(super) fn requires_input(&self) -> bool {
        self.input.is_some() && self.sent_outside
    }

    pub(super) fn produces_output(&self) -> bool {
        self.input.is_none() && !self.sent_outside
    }
}

impl AnchorTxBuilder {
    // Takes the NFT of a consumed request into an output of the chain.
    pub(super) fn consume_nft(
        &mut self,
        nft: &NftOutput,
        output_id: OutputId,
    ) -> TxBuilderResult<i64> {
        let id = nft.nft_id.or_from_output_id(&output_id);
        if let Some(held) = self.nfts.get_mut(&id) {
            if !held.sent_outside {
                return Err(TxBuilderError::Unbalanced(format!("NFT {id} consumed twice")));
            }
            held.sent_outside = false;
            let deposit = held.out.amount as i64;
            return self.apply_storage_deposit_adjustment(-deposit);
        }
        let mut out = NftOutput {
            nft_id: id,
            unlock_conditions: UnlockConditions::new()
                .with(UnlockCondition::Address(self.chain_address())),
            immutable_features: nft.immutable_features.clone(),
            ..Default::default()
        };
        out.amount = self
            .params
            .rent
            .min_storage_deposit(&out.clone().into())
            .max(self.sd.nft_output);
        let deposit = out.amount as i64;
        self.nfts.insert(
            id,
            NftIncluded {
                input: None,
                out,
                sent_outside: false,
            },
        );
        self.apply_storage_deposit_adjustment(-deposit)
    }

    // Releases the chain's output of an NFT that is being sent away.
    pub(super) fn send_nft(&mut self, nft: &NftOutput) -> TxBuilderResult<i64> {
        let id = nft.nft_id;
        let refund = match self.nfts.get_mut(&id) {
            Some(held) if held.sent_outside => return Err(TxBuilderError::NftNotFound(id)),
            Some(held) => {
                held.sent_outside = true;
                held.out.amount
            }
            None => {
                let (out, output_id) = self
                    .loader
                    .load_nft(&id)
                    .ok_or(TxBuilderError::NftNotFound(id))?;
                let refund = out.amount;
                self.nfts.insert(
                    id,
                    NftIncluded {
                        input: Some((out.clone(), output_id)),
                        out,
                        sent_outside: true,
                    },
                );
                refund
            }
        };
        self.apply_storage_deposit_adjustment(refund as i64)
    }

    /// Whether the chain holds `id` as the builder stands.
    pub fn holds_nft(&self, id: &NftId) -> bool {
        match self.nfts.get(id) {
            Some(n) => !n.sent_outside,
            None => self.loader.load_nft(id).is_some(),
        }
    }
}
