//! The client side of the ledger node.
//!
//! A node shares one [`L1Client`] between all its chains. It answers
//! indexer queries and hands out live subscriptions; everything chain
//! specific is built on top of it in [`crate::nodeconn`].

use std::future::Future;

use anchor_ledger::{Address, AliasId, AliasOutput, Block, BlockId, Output, OutputId};
use futures::stream::BoxStream;
use mockall::automock;
use serde::{Deserialize, Serialize};

use crate::nodeconn::NodeConnResult;

/// Live outputs with their ids.
pub type OutputStream = BoxStream<'static, (OutputId, Output)>;

/// Metadata updates of one block.
pub type MetadataStream = BoxStream<'static, BlockMetadata>;

/// Where a posted block stands in the ledger.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InclusionState {
    /// Not decided yet.
    Pending,
    /// The transaction of the block is part of the ledger.
    Included,
    /// Included and final.
    Confirmed,
    /// The transaction spends outputs spent by another one.
    Conflicting,
}

impl InclusionState {
    /// Whether the state will not change anymore.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, InclusionState::Pending)
    }
}

/// What the indexer knows about a posted block.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct BlockMetadata {
    pub block_id: BlockId,
    pub inclusion_state: InclusionState,
}

/// The ledger node and its indexer.
#[automock]
pub trait L1Client {
    /// Outputs unlockable by `address` as they are created.
    fn subscribe_outputs(
        &self,
        address: Address,
    ) -> impl Future<Output = NodeConnResult<OutputStream>> + Send;

    /// Every new state of the alias `alias_id`.
    fn subscribe_alias_output(
        &self,
        alias_id: AliasId,
    ) -> impl Future<Output = NodeConnResult<OutputStream>> + Send;

    /// The unspent outputs unlockable by `address`.
    fn unspent_outputs(
        &self,
        address: Address,
    ) -> impl Future<Output = NodeConnResult<Vec<(OutputId, Output)>>> + Send;

    /// The current state of the alias `alias_id`.
    fn alias_output(
        &self,
        alias_id: AliasId,
    ) -> impl Future<Output = NodeConnResult<Option<(OutputId, AliasOutput)>>> + Send;

    /// Attaches `block` to the ledger and returns the id the node gave it.
    fn post_block(&self, block: Block) -> impl Future<Output = NodeConnResult<BlockId>> + Send;

    fn subscribe_block_metadata(
        &self,
        block_id: BlockId,
    ) -> impl Future<Output = NodeConnResult<MetadataStream>> + Send;

    fn block_metadata(
        &self,
        block_id: BlockId,
    ) -> impl Future<Output = NodeConnResult<BlockMetadata>> + Send;
}
