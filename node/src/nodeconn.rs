//! Connection of one chain to the ledger node.
//!
//! [`NodeConn::start`] spawns two tasks: one follows the anchor of the
//! chain, the other every output sent to the chain address. Both subscribe
//! first and only then read the current unspent set from the indexer, so
//! nothing created in between is missed; an output may be delivered twice.
//! When a subscription breaks the task waits and starts over.
//!
//! [`NodeConn::publish_tx`] posts an anchor transaction and waits until the
//! ledger decides on it.

use std::sync::Arc;

use anchor_ledger::{
    Address, AliasOutput, Block, BlockId, Output, OutputId, Transaction, TransactionId,
};
use chain_vm::ChainId;
use futures::StreamExt;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::l1::{InclusionState, L1Client, MetadataStream};
use crate::retry::RetryPolicy;

/// Result of talking to the ledger.
pub type NodeConnResult<T> = Result<T, NodeConnError>;

/// Ways talking to the ledger fails.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum NodeConnError {
    /// The indexer did not answer.
    #[error("indexer unavailable: {0}")]
    IndexerUnavailable(String),

    /// A subscription stream ended.
    #[error("subscription closed")]
    SubscriptionClosed,

    /// The ledger node refused or did not take the block.
    #[error("publishing failed: {0}")]
    PublishFailed(String),

    /// Another transaction spent the same outputs.
    #[error("transaction {0} is conflicting")]
    TxConflicting(TransactionId),

    /// No decision on the transaction in time.
    #[error("transaction {0} not included in time")]
    InclusionTimeout(TransactionId),

    /// The chain was stopped.
    #[error("canceled")]
    Canceled,
}

impl NodeConnError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            NodeConnError::IndexerUnavailable(_) | NodeConnError::PublishFailed(_)
        )
    }
}

/// Used when `publish_tx` is not given a timeout.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(60);
/// Silence on the metadata stream after which the block is polled.
const METADATA_SILENCE: Duration = Duration::from_secs(20);
const METADATA_POLLS: u32 = 10;
const METADATA_POLL_INTERVAL: Duration = Duration::from_secs(1);
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);
const POST_BACKOFF: Duration = Duration::from_millis(500);
const POST_RETRIES: u32 = 4;

/// The ledger as seen by one chain.
#[derive(Debug)]
pub struct NodeConn<C> {
    client: Arc<C>,
    chain_id: ChainId,
    protocol_version: u8,
    cancel: CancellationToken,
}

impl<C> NodeConn<C>
where
    C: L1Client + Send + Sync + 'static,
{
    /// A connection of `chain_id` through `client`, stopped by `cancel`.
    pub fn new(
        client: Arc<C>,
        chain_id: ChainId,
        protocol_version: u8,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            chain_id,
            protocol_version,
            cancel,
        }
    }

    /// Starts following the ledger.
    ///
    /// `state_output_handler` gets every state of the chain's anchor,
    /// `output_handler` every other output unlockable by the chain address
    /// without a storage deposit return condition. Handlers run on the
    /// connection tasks and must not wait on the ledger client.
    pub fn start<S, O>(&self, state_output_handler: S, output_handler: O) -> [JoinHandle<()>; 2]
    where
        S: Fn(OutputId, AliasOutput) + Send + Sync + 'static,
        O: Fn(OutputId, Output) + Send + Sync + 'static,
    {
        let chain_id = self.chain_id;
        let anchor = tokio::spawn(follow_anchor(
            self.client.clone(),
            chain_id,
            self.cancel.clone(),
            move |id, out| match out {
                Output::Alias(alias) if alias.alias_id.or_from_output_id(&id) == chain_id => {
                    state_output_handler(id, alias)
                }
                _ => {}
            },
        ));
        let outputs = tokio::spawn(follow_outputs(
            self.client.clone(),
            Address::Alias(chain_id),
            self.cancel.clone(),
            move |id, out| match out.unlock_conditions().storage_deposit_return() {
                Some(_) => debug!(%chain_id, output_id = %id, "ignoring output with a return condition"),
                None => output_handler(id, out),
            },
        ));
        [anchor, outputs]
    }

    /// Posts `tx` and waits until it is included or confirmed.
    pub async fn publish_tx(
        &self,
        tx: Transaction,
        timeout_after: Option<Duration>,
    ) -> NodeConnResult<()> {
        if self.cancel.is_cancelled() {
            return Err(NodeConnError::Canceled);
        }
        let tx_id = tx.id();
        let block = Block::new(self.protocol_version, tx);
        let publish = async {
            let block_id = RetryPolicy::new(POST_BACKOFF, POST_RETRIES)
                .retry(
                    || self.client.post_block(block.clone()),
                    NodeConnError::is_transient,
                )
                .await?;
            debug!(chain_id = %self.chain_id, %tx_id, %block_id, "posted anchor transaction");
            self.await_inclusion(tx_id, block_id).await
        };
        let wait = timeout_after.unwrap_or(DEFAULT_PUBLISH_TIMEOUT);
        tokio::select! {
            _ = self.cancel.cancelled() => Err(NodeConnError::Canceled),
            res = timeout(wait, publish) => match res {
                Ok(res) => res,
                Err(_) => Err(NodeConnError::InclusionTimeout(tx_id)),
            },
        }
    }

    /// The anchor output of the chain as the indexer sees it now.
    pub async fn current_anchor(&self) -> NodeConnResult<Option<(OutputId, AliasOutput)>> {
        self.client.alias_output(self.chain_id).await
    }

    async fn await_inclusion(&self, tx_id: TransactionId, block_id: BlockId) -> NodeConnResult<()> {
        let mut stream: Option<MetadataStream> = None;
        loop {
            let mut updates = match stream.take() {
                Some(s) => s,
                None => self.client.subscribe_block_metadata(block_id).await?,
            };
            match timeout(METADATA_SILENCE, updates.next()).await {
                Ok(Some(meta)) => {
                    if let Some(res) = decided(tx_id, meta.inclusion_state) {
                        return res;
                    }
                    stream = Some(updates);
                    continue;
                }
                Ok(None) => {}
                Err(_) => stream = Some(updates),
            }
            if let Some(res) = self.poll_inclusion(tx_id, block_id).await {
                return res;
            }
        }
    }

    async fn poll_inclusion(
        &self,
        tx_id: TransactionId,
        block_id: BlockId,
    ) -> Option<NodeConnResult<()>> {
        info!(chain_id = %self.chain_id, %block_id, "no metadata updates, polling");
        for _ in 0..METADATA_POLLS {
            match self.client.block_metadata(block_id).await {
                Ok(meta) => {
                    if let Some(res) = decided(tx_id, meta.inclusion_state) {
                        return Some(res);
                    }
                }
                Err(e) => warn!(chain_id = %self.chain_id, %block_id, "polling metadata: {e}"),
            }
            sleep(METADATA_POLL_INTERVAL).await;
        }
        None
    }
}

fn decided(tx_id: TransactionId, state: InclusionState) -> Option<NodeConnResult<()>> {
    match state {
        InclusionState::Included | InclusionState::Confirmed => Some(Ok(())),
        InclusionState::Conflicting => Some(Err(NodeConnError::TxConflicting(tx_id))),
        InclusionState::Pending => None,
    }
}

async fn follow_anchor<C, F>(client: Arc<C>, chain_id: ChainId, cancel: CancellationToken, deliver: F)
where
    C: L1Client + Send + Sync + 'static,
    F: Fn(OutputId, Output) + Send + Sync + 'static,
{
    loop {
        let attempt = async {
            let mut stream = client.subscribe_alias_output(chain_id).await?;
            if let Some((id, anchor)) = client.alias_output(chain_id).await? {
                deliver(id, Output::Alias(anchor));
            }
            while let Some((id, out)) = stream.next().await {
                deliver(id, out);
            }
            NodeConnResult::<()>::Err(NodeConnError::SubscriptionClosed)
        };
        let res = tokio::select! {
            _ = cancel.cancelled() => return,
            res = attempt => res,
        };
        if let Err(e) = res {
            warn!(%chain_id, "anchor subscription: {e}, resubscribing");
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(RESUBSCRIBE_DELAY) => {}
        }
    }
}

async fn follow_outputs<C, F>(client: Arc<C>, address: Address, cancel: CancellationToken, deliver: F)
where
    C: L1Client + Send + Sync + 'static,
    F: Fn(OutputId, Output) + Send + Sync + 'static,
{
    loop {
        let attempt = async {
            let mut stream = client.subscribe_outputs(address).await?;
            for (id, out) in client.unspent_outputs(address).await? {
                deliver(id, out);
            }
            while let Some((id, out)) = stream.next().await {
                deliver(id, out);
            }
            NodeConnResult::<()>::Err(NodeConnError::SubscriptionClosed)
        };
        let res = tokio::select! {
            _ = cancel.cancelled() => return,
            res = attempt => res,
        };
        if let Err(e) = res {
            warn!(%address, "output subscription: {e}, resubscribing");
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(RESUBSCRIBE_DELAY) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicU32, Ordering};

    use anchor_ledger::{
        AliasId, BasicOutput, Ed25519Address, TransactionEssence, UnlockCondition,
        UnlockConditions,
    };
    use futures::stream;
    use parking_lot::Mutex;

    use super::*;
    use crate::l1::{BlockMetadata, MockL1Client};

    type Reply<T> = Pin<Box<dyn Future<Output = NodeConnResult<T>> + Send>>;

    fn reply<T: Send + 'static>(v: NodeConnResult<T>) -> Reply<T> {
        Box::pin(futures::future::ready(v))
    }

    fn chain() -> ChainId {
        AliasId([3; 32])
    }

    fn tx() -> Transaction {
        Transaction {
            essence: TransactionEssence {
                network_id: 1,
                inputs: vec![OutputId::new(TransactionId([2; 32]), 0)],
                inputs_commitment: [0; 32],
                outputs: Vec::new(),
            },
            unlocks: vec![anchor_ledger::Unlock::Reference(0)],
        }
    }

    fn meta(state: InclusionState) -> BlockMetadata {
        BlockMetadata {
            block_id: BlockId([1; 32]),
            inclusion_state: state,
        }
    }

    fn updates(states: Vec<InclusionState>) -> MetadataStream {
        stream::iter(states.into_iter().map(meta)).boxed()
    }

    fn output(return_condition: bool) -> Output {
        let mut conditions =
            UnlockConditions::new().with(UnlockCondition::Address(Address::Alias(chain())));
        if return_condition {
            conditions = conditions.with(UnlockCondition::StorageDepositReturn {
                return_address: Address::Ed25519(Ed25519Address([9; 32])),
                amount: 50_000,
            });
        }
        Output::Basic(BasicOutput {
            amount: 1_000_000,
            unlock_conditions: conditions,
            ..Default::default()
        })
    }

    fn conn(client: MockL1Client) -> NodeConn<MockL1Client> {
        NodeConn::new(Arc::new(client), chain(), 2, CancellationToken::new())
    }

    fn posting(client: &mut MockL1Client) {
        client
            .expect_post_block()
            .returning(|_| reply(Ok(BlockId([1; 32]))));
    }

    #[tokio::test(start_paused = true)]
    async fn included_after_pending() {
        let mut client = MockL1Client::new();
        posting(&mut client);
        client.expect_subscribe_block_metadata().returning(|_| {
            reply(Ok(updates(vec![
                InclusionState::Pending,
                InclusionState::Included,
            ])))
        });
        assert_eq!(conn(client).publish_tx(tx(), None).await, Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn conflicting_is_an_error() {
        let mut client = MockL1Client::new();
        posting(&mut client);
        client
            .expect_subscribe_block_metadata()
            .returning(|_| reply(Ok(updates(vec![InclusionState::Conflicting]))));
        assert_eq!(
            conn(client).publish_tx(tx(), None).await,
            Err(NodeConnError::TxConflicting(tx().id()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn silent_stream_falls_back_to_polling() {
        let polls = Arc::new(AtomicU32::new(0));
        let mut client = MockL1Client::new();
        posting(&mut client);
        client
            .expect_subscribe_block_metadata()
            .returning(|_| reply(Ok(stream::pending().boxed())));
        let counter = polls.clone();
        client.expect_block_metadata().returning(move |_| {
            let state = match counter.fetch_add(1, Ordering::SeqCst) {
                0..=2 => InclusionState::Pending,
                _ => InclusionState::Confirmed,
            };
            reply(Ok(meta(state)))
        });
        let start = tokio::time::Instant::now();
        assert_eq!(conn(client).publish_tx(tx(), None).await, Ok(()));
        assert_eq!(polls.load(Ordering::SeqCst), 4);
        assert_eq!(start.elapsed(), Duration::from_secs(23));
    }

    #[tokio::test(start_paused = true)]
    async fn undecided_transaction_times_out() {
        let mut client = MockL1Client::new();
        posting(&mut client);
        client
            .expect_subscribe_block_metadata()
            .returning(|_| reply(Ok(stream::pending().boxed())));
        client
            .expect_block_metadata()
            .returning(|_| reply(Ok(meta(InclusionState::Pending))));
        assert_eq!(
            conn(client)
                .publish_tx(tx(), Some(Duration::from_secs(30)))
                .await,
            Err(NodeConnError::InclusionTimeout(tx().id()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn post_is_retried() {
        let attempts = Arc::new(AtomicU32::new(0));
        let mut client = MockL1Client::new();
        let counter = attempts.clone();
        client
            .expect_post_block()
            .returning(move |_| match counter.fetch_add(1, Ordering::SeqCst) {
                0 | 1 => reply(Err(NodeConnError::PublishFailed("busy".into()))),
                _ => reply(Ok(BlockId([1; 32]))),
            });
        client
            .expect_subscribe_block_metadata()
            .returning(|_| reply(Ok(updates(vec![InclusionState::Included]))));
        assert_eq!(conn(client).publish_tx(tx(), None).await, Ok(()));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn canceled_chain_does_not_publish() {
        let conn = conn(MockL1Client::new());
        conn.cancel.cancel();
        assert_eq!(
            conn.publish_tx(tx(), None).await,
            Err(NodeConnError::Canceled)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_then_stream_without_return_conditions() {
        let mut client = MockL1Client::new();
        let old = OutputId::new(TransactionId([4; 32]), 0);
        let with_return = OutputId::new(TransactionId([4; 32]), 1);
        let live = OutputId::new(TransactionId([5; 32]), 0);
        client.expect_subscribe_outputs().returning(move |_| {
            reply(Ok(stream::iter(vec![(live, output(false))])
                .chain(stream::pending())
                .boxed()))
        });
        client.expect_unspent_outputs().returning(move |_| {
            reply(Ok(vec![(old, output(false)), (with_return, output(true))]))
        });
        client
            .expect_subscribe_alias_output()
            .returning(|_| reply(Ok(stream::pending().boxed())));
        client
            .expect_alias_output()
            .returning(|_| reply(Ok(None)));

        let conn = conn(client);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let tasks = conn.start(|_, _| {}, move |id, _| sink.lock().push(id));
        sleep(Duration::from_millis(10)).await;
        assert_eq!(*seen.lock(), vec![old, live]);

        conn.cancel.cancel();
        for t in tasks {
            t.await.unwrap();
        }
    }
}
