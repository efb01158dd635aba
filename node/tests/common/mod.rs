#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anchor_ledger::{
    make_basic_output, Address, AliasId, AliasOutput, BasicOutput, Block, BlockId,
    Ed25519Address, FungibleTokens, L1Params, Output, OutputId, SendOptions, Transaction,
    TransactionId, UnlockCondition, UnlockConditions,
};
use chain_node::l1::{MetadataStream, OutputStream};
use chain_node::{BlockMetadata, InclusionState, L1Client, NodeConnError, NodeConnResult, PeerSender};
use chain_vm::origin::{origin_transaction_essence, sign_origin_transaction};
use chain_vm::{
    chain_id_of, origin_state, AgentId, ChainId, GasFeePolicy, GasLimits, OffLedgerRequest,
    OriginParams,
};
use ed25519_dalek::SigningKey;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use kv_state::StateDb;
use parking_lot::Mutex;

pub const ANCHOR_AMOUNT: u64 = 10_000_000;
pub const WALLET_FUNDS: u64 = 100_000_000;
pub const GENESIS_TIME: u64 = 1_700_000_000;

pub fn key(seed: u8) -> SigningKey {
    SigningKey::from_bytes(&[seed; 32])
}

pub fn address_of(key: &SigningKey) -> Address {
    Address::Ed25519(Ed25519Address::from_public_key(
        &key.verifying_key().to_bytes(),
    ))
}

pub fn agent_of(key: &SigningKey) -> AgentId {
    AgentId::Address(address_of(key))
}

#[derive(Default)]
struct Ledger {
    unspent: BTreeMap<OutputId, Output>,
    blocks: HashMap<BlockId, InclusionState>,
    posted: Vec<TransactionId>,
    sent: u32,
    hold: bool,
    held: Vec<Transaction>,
    conflict_next: bool,
    output_subs: Vec<(Address, UnboundedSender<(OutputId, Output)>)>,
    alias_subs: Vec<(AliasId, UnboundedSender<(OutputId, Output)>)>,
}

impl Ledger {
    fn create(&mut self, id: OutputId, out: Output) {
        match &out {
            Output::Alias(alias) => {
                let alias_id = alias.alias_id.or_from_output_id(&id);
                self.alias_subs
                    .retain(|(sub, tx)| *sub != alias_id || tx.unbounded_send((id, out.clone())).is_ok());
            }
            _ => {
                if let Some(address) = out.unlock_conditions().address().copied() {
                    self.output_subs.retain(|(sub, tx)| {
                        *sub != address || tx.unbounded_send((id, out.clone())).is_ok()
                    });
                }
            }
        }
        self.unspent.insert(id, out);
    }

    fn apply(&mut self, tx: &Transaction) -> InclusionState {
        if tx
            .essence
            .inputs
            .iter()
            .any(|id| !self.unspent.contains_key(id))
        {
            return InclusionState::Conflicting;
        }
        for id in &tx.essence.inputs {
            self.unspent.remove(id);
        }
        let tx_id = tx.id();
        for (i, out) in tx.essence.outputs.iter().enumerate() {
            self.create(OutputId::new(tx_id, i as u16), out.clone());
        }
        InclusionState::Included
    }
}

/// A ledger node and indexer in memory. Posted blocks are included at once
/// unless they spend an output that is gone, or the ledger is told to hold
/// them or to see the next one as conflicting.
#[derive(Clone, Default)]
pub struct FakeLedger {
    inner: Arc<Mutex<Ledger>>,
}

impl FakeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates `out` as if a wallet had sent it.
    pub fn send(&self, out: Output) -> OutputId {
        let mut ledger = self.inner.lock();
        ledger.sent += 1;
        let mut tx = [0x55; 32];
        tx[..4].copy_from_slice(&ledger.sent.to_le_bytes());
        let id = OutputId::new(TransactionId(tx), 0);
        ledger.create(id, out);
        id
    }

    pub fn apply(&self, tx: &Transaction) -> InclusionState {
        self.inner.lock().apply(tx)
    }

    /// Anchor transactions posted so far.
    pub fn posted(&self) -> Vec<TransactionId> {
        self.inner.lock().posted.clone()
    }

    pub fn is_unspent(&self, id: &OutputId) -> bool {
        self.inner.lock().unspent.contains_key(id)
    }

    /// Posted blocks stay pending and their transactions are kept aside.
    pub fn hold_blocks(&self) {
        self.inner.lock().hold = true;
    }

    /// Includes the transactions held so far and stops holding. The
    /// metadata of their blocks stays pending, as with an indexer that lost
    /// track of them.
    pub fn release_held(&self) -> Vec<TransactionId> {
        let mut ledger = self.inner.lock();
        ledger.hold = false;
        let held = std::mem::take(&mut ledger.held);
        held.iter()
            .map(|tx| {
                assert_eq!(ledger.apply(tx), InclusionState::Included);
                tx.id()
            })
            .collect()
    }

    /// The next posted block is conflicting and changes nothing.
    pub fn conflict_next_post(&self) {
        self.inner.lock().conflict_next = true;
    }
}

impl L1Client for FakeLedger {
    async fn subscribe_outputs(&self, address: Address) -> NodeConnResult<OutputStream> {
        let (tx, rx) = unbounded();
        self.inner.lock().output_subs.push((address, tx));
        Ok(rx.boxed())
    }

    async fn subscribe_alias_output(&self, alias_id: AliasId) -> NodeConnResult<OutputStream> {
        let (tx, rx) = unbounded();
        self.inner.lock().alias_subs.push((alias_id, tx));
        Ok(rx.boxed())
    }

    async fn unspent_outputs(&self, address: Address) -> NodeConnResult<Vec<(OutputId, Output)>> {
        Ok(self
            .inner
            .lock()
            .unspent
            .iter()
            .filter(|(_, out)| out.unlock_conditions().address() == Some(&address))
            .map(|(id, out)| (*id, out.clone()))
            .collect())
    }

    async fn alias_output(
        &self,
        alias_id: AliasId,
    ) -> NodeConnResult<Option<(OutputId, AliasOutput)>> {
        Ok(self
            .inner
            .lock()
            .unspent
            .iter()
            .find_map(|(id, out)| match out {
                Output::Alias(alias) if alias.alias_id.or_from_output_id(id) == alias_id => {
                    Some((*id, alias.clone()))
                }
                _ => None,
            }))
    }

    async fn post_block(&self, block: Block) -> NodeConnResult<BlockId> {
        let block_id = block.id();
        let tx_id = block.payload.id();
        let mut ledger = self.inner.lock();
        let state = if ledger.conflict_next {
            ledger.conflict_next = false;
            InclusionState::Conflicting
        } else if ledger.hold {
            if !ledger.held.iter().any(|tx| tx.id() == tx_id) {
                ledger.held.push(block.payload.clone());
            }
            InclusionState::Pending
        } else {
            ledger.apply(&block.payload)
        };
        ledger.posted.push(tx_id);
        ledger.blocks.insert(block_id, state);
        Ok(block_id)
    }

    async fn subscribe_block_metadata(&self, block_id: BlockId) -> NodeConnResult<MetadataStream> {
        let state = self.inner.lock().blocks.get(&block_id).copied();
        let updates = async_stream::stream! {
            if let Some(inclusion_state) = state {
                yield BlockMetadata { block_id, inclusion_state };
            }
        };
        Ok(updates.boxed())
    }

    async fn block_metadata(&self, block_id: BlockId) -> NodeConnResult<BlockMetadata> {
        match self.inner.lock().blocks.get(&block_id) {
            Some(state) => Ok(BlockMetadata {
                block_id,
                inclusion_state: *state,
            }),
            None => Err(NodeConnError::IndexerUnavailable(format!(
                "unknown block {block_id}"
            ))),
        }
    }
}

/// Peers are never configured in these tests.
pub struct NoPeers;

impl PeerSender for NoPeers {
    fn send(&self, _peer: &str, _request: &OffLedgerRequest) {}
}

/// A chain created on `ledger`, with key 1 as owner and key 2 as state
/// controller.
pub struct Genesis {
    pub chain_id: ChainId,
    pub state: StateDb,
    pub owner: SigningKey,
    pub state_controller: SigningKey,
    pub l1_params: L1Params,
}

impl Genesis {
    pub fn new(ledger: &FakeLedger) -> Self {
        let owner = key(1);
        let state_controller = key(2);
        let l1_params = L1Params::default();
        let params = OriginParams {
            owner: agent_of(&owner),
            state_controller: address_of(&state_controller),
            governor: address_of(&owner),
            fee_policy: GasFeePolicy::default(),
            gas_limits: GasLimits::default(),
            timestamp: GENESIS_TIME,
        };
        let wallet = address_of(&owner);
        let funds = Output::Basic(BasicOutput {
            amount: WALLET_FUNDS,
            unlock_conditions: UnlockConditions::new().with(UnlockCondition::Address(wallet)),
            ..Default::default()
        });
        let funds_id = ledger.send(funds.clone());
        let essence = origin_transaction_essence(
            &params,
            &l1_params,
            ANCHOR_AMOUNT,
            wallet,
            &[(funds_id, funds)],
        )
        .unwrap();
        let origin = sign_origin_transaction(essence, &owner);
        assert_eq!(ledger.apply(&origin), InclusionState::Included);
        let (state, _) = origin_state(&params, &l1_params, ANCHOR_AMOUNT).unwrap();
        Self {
            chain_id: chain_id_of(&origin),
            state,
            owner,
            state_controller,
            l1_params,
        }
    }

    /// Base tokens sent to the chain by `sender`.
    pub fn deposit(&self, ledger: &FakeLedger, sender: &SigningKey, base_tokens: u64) -> OutputId {
        let out = make_basic_output(
            Address::Alias(self.chain_id),
            Some(address_of(sender)),
            &FungibleTokens::with_base_tokens(base_tokens),
            None,
            SendOptions::default(),
            &self.l1_params.rent,
            true,
        );
        ledger.send(out.into())
    }
}
