//! The task running one chain.
//!
//! Every chain has a single task owning its pool of requests and the only
//! write access to its state. The ledger connection and the API talk to it
//! through its inbox. On every block tick the task runs the pending requests
//! on a snapshot of the state, has the committee sign the anchor
//! transaction, publishes it and commits the block once the ledger includes
//! it. A block whose fate is unknown, because inclusion timed out or the
//! ledger could not be reached, is kept and posted again until an anchor
//! output decides it: the anchor it produced commits it, any other new anchor
//! drops it. A conflicting block is produced again.

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anchor_common::MAX_OFF_LEDGER_REQUEST_SIZE;
use anchor_ledger::{
    Address, AliasOutput, Ed25519Address, Output, OutputId, Packable, Transaction,
    TransactionEssence, TransactionId,
};
use anyhow::{anyhow, bail, ensure, Context};
use chain_vm::blocklog::{self as bl, BlockInfo, RequestReceipt};
use chain_vm::contracts::partition;
use chain_vm::evm::{trace_transaction, BlockChainDb, EvmTrace};
use chain_vm::{
    call_view, run_block, sign_anchor_transaction, BlockResult, BlockTask, ChainId, CoreContract,
    Hname, OffLedgerRequest, Processors, RequestId, VmError, VmResult,
};
use ed25519_dalek::SigningKey;
use ethereum_types::H256;
use kv_state::{Dict, L1Commitment, StateDb};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::{ChainParams, NodeConfig};
use crate::l1::L1Client;
use crate::mempool::{AdmissionError, AdmissionResult, Mempool, Submission};
use crate::nodeconn::{NodeConn, NodeConnError};
use crate::offledger::{Broadcaster, OffLedgerCache, PeerSender};

const PROCESSED_CHANNEL_SIZE: usize = 1024;
const OWN_TXS: usize = 256;
/// Committed states kept for tracing, by block index.
const STATE_HISTORY: usize = 16;

/// The nodes producing the blocks of a chain.
pub trait Committee {
    /// Address the committee signs anchor transactions as.
    fn address(&self) -> Address;

    /// Other nodes of the committee.
    fn peers(&self) -> Vec<String>;

    /// Collects the signatures unlocking the inputs of `essence`.
    fn sign(
        &self,
        essence: TransactionEssence,
    ) -> impl Future<Output = anyhow::Result<Transaction>> + Send;
}

/// A committee of one node holding the state controller key.
#[derive(Clone, Debug)]
pub struct SingleKeyCommittee {
    key: SigningKey,
    peers: Vec<String>,
}

impl SingleKeyCommittee {
    /// A committee without peers signing with `key`.
    pub fn new(key: SigningKey) -> Self {
        Self {
            key,
            peers: Vec::new(),
        }
    }

    /// Sets the peers off-ledger requests are forwarded to.
    pub fn with_peers(mut self, peers: Vec<String>) -> Self {
        self.peers = peers;
        self
    }
}

impl Committee for SingleKeyCommittee {
    fn address(&self) -> Address {
        Address::Ed25519(Ed25519Address::from_public_key(
            &self.key.verifying_key().to_bytes(),
        ))
    }

    fn peers(&self) -> Vec<String> {
        self.peers.clone()
    }

    async fn sign(&self, essence: TransactionEssence) -> anyhow::Result<Transaction> {
        Ok(sign_anchor_transaction(essence, &self.key))
    }
}

#[derive(Debug)]
enum ChainMessage {
    StateOutput(OutputId, AliasOutput),
    Output(OutputId, Output),
    OffLedger(OffLedgerRequest, oneshot::Sender<AdmissionResult<Submission>>),
}

/// Access to a running chain.
#[derive(Clone, Debug)]
pub struct ChainHandle {
    chain_id: ChainId,
    inbox: mpsc::UnboundedSender<ChainMessage>,
    state: Arc<RwLock<StateDb>>,
    history: Arc<Mutex<LruCache<u32, StateDb>>>,
    processors: Arc<Processors>,
    processed: broadcast::Sender<RequestReceipt>,
    cache: Arc<Mutex<OffLedgerCache>>,
    cancel: CancellationToken,
}

impl ChainHandle {
    /// The chain this handle talks to.
    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    /// False once the task is stopped or gone.
    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && !self.inbox.is_closed()
    }

    /// Asks the chain task to stop.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Decodes and submits an off-ledger request.
    pub async fn submit_off_ledger(&self, bytes: &[u8]) -> AdmissionResult<Submission> {
        if bytes.len() > MAX_OFF_LEDGER_REQUEST_SIZE {
            return Err(AdmissionError::Oversized(bytes.len()));
        }
        let request = OffLedgerRequest::from_bytes(bytes)
            .map_err(|e| AdmissionError::Malformed(e.to_string()))?;
        self.submit(request).await
    }

    /// Hands `request` to the chain. A request submitted again while the
    /// cache remembers it is reported as duplicated without reaching the
    /// chain.
    pub async fn submit(&self, request: OffLedgerRequest) -> AdmissionResult<Submission> {
        let id = request.id();
        if self.cache.lock().check_and_insert(id) {
            return Ok(Submission::Duplicated);
        }
        let (reply, response) = oneshot::channel();
        let res = match self.inbox.send(ChainMessage::OffLedger(request, reply)) {
            Ok(()) => response
                .await
                .unwrap_or(Err(AdmissionError::UnknownChain(self.chain_id))),
            Err(_) => Err(AdmissionError::UnknownChain(self.chain_id)),
        };
        if res.is_err() {
            self.cache.lock().forget(&id);
        }
        res
    }

    /// Calls a view on the committed state.
    pub fn call_view(&self, contract: Hname, function: Hname, params: Dict) -> VmResult<Dict> {
        let state = self.state.read();
        call_view(
            &*state,
            self.chain_id,
            &self.processors,
            contract,
            function,
            params,
        )
    }

    /// Receipt of `id` if a committed block processed it.
    pub fn receipt(&self, id: &RequestId) -> VmResult<Option<RequestReceipt>> {
        let state = self.state.read();
        bl::get_request_receipt(&partition(&*state, CoreContract::Blocklog.hname()), id)
    }

    /// The last committed block.
    pub fn latest_block(&self) -> VmResult<Option<BlockInfo>> {
        let state = self.state.read();
        bl::get_latest_block_info(&partition(&*state, CoreContract::Blocklog.hname()))
    }

    /// Commitment to the committed state.
    pub fn commitment(&self) -> L1Commitment {
        self.state.read().commitment()
    }

    /// Re-executes EVM transaction `tx_hash` on the state its block started
    /// from. Only transactions of recent blocks can be traced.
    pub fn trace_evm_transaction(&self, tx_hash: &H256) -> anyhow::Result<EvmTrace> {
        let state = self.state.read();
        let evm = partition(&*state, CoreContract::Evm.hname());
        let blocks = BlockChainDb::new(&evm);
        let (number, _) = blocks
            .transaction_location(tx_hash)?
            .with_context(|| format!("EVM transaction {tx_hash:?} not found"))?;
        let block = blocks
            .block_by_number(number)?
            .with_context(|| format!("EVM block {number} not found"))?;
        let parent_index = u32::try_from(block.header.number)?
            .checked_sub(1)
            .context("EVM block 0 has no transactions")?;
        let parent = self
            .history
            .lock()
            .get(&parent_index)
            .cloned()
            .with_context(|| format!("state of block {parent_index} is no longer kept"))?;
        Ok(trace_transaction(
            partition(&parent, CoreContract::Evm.hname()),
            &block,
            tx_hash,
        )?)
    }

    /// Waits until a committed block has processed `id`.
    pub async fn wait_request_processed(
        &self,
        id: RequestId,
        timeout: Duration,
    ) -> anyhow::Result<RequestReceipt> {
        let mut processed = self.processed.subscribe();
        if let Some(receipt) = self.receipt(&id)? {
            return Ok(receipt);
        }
        let wait = async {
            loop {
                match processed.recv().await {
                    Ok(receipt) if receipt.request.id() == id => return anyhow::Ok(receipt),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if let Some(receipt) = self.receipt(&id)? {
                            return anyhow::Ok(receipt);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        bail!("chain {} stopped", self.chain_id)
                    }
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| anyhow!("request {id} not processed within {timeout:?}"))?
    }
}

/// Starts the task of `chain_id`, whose committed state is `state`.
pub fn spawn_chain<C, K, P>(
    client: Arc<C>,
    chain_id: ChainId,
    state: StateDb,
    committee: K,
    peer_sender: P,
    config: &NodeConfig,
    cancel: CancellationToken,
) -> (ChainHandle, JoinHandle<anyhow::Result<()>>)
where
    C: L1Client + Send + Sync + 'static,
    K: Committee + Send + Sync + 'static,
    P: PeerSender + Send + 'static,
{
    let (inbox_tx, inbox) = mpsc::unbounded_channel();
    let (processed, _) = broadcast::channel(PROCESSED_CHANNEL_SIZE);
    let mut history = LruCache::new(NonZeroUsize::new(STATE_HISTORY).unwrap_or(NonZeroUsize::MIN));
    match bl::get_latest_block_info(&partition(&state, CoreContract::Blocklog.hname())) {
        Ok(info) => {
            history.put(info.map_or(0, |info| info.block_index), state.clone());
        }
        Err(e) => warn!(%chain_id, "reading the latest block: {e}"),
    }
    let handle = ChainHandle {
        chain_id,
        inbox: inbox_tx.clone(),
        state: Arc::new(RwLock::new(state)),
        history: Arc::new(Mutex::new(history)),
        processors: Arc::new(Processors::new()),
        processed,
        cache: Arc::new(Mutex::new(OffLedgerCache::new(config.off_ledger.cache_ttl))),
        cancel: cancel.clone(),
    };

    let conn = NodeConn::new(
        client,
        chain_id,
        config.chain.l1_params.protocol_version,
        cancel.clone(),
    );
    let anchors = inbox_tx.clone();
    let outputs = inbox_tx;
    // A closed inbox means the chain task is gone; the connection tasks
    // are canceled along with it.
    conn.start(
        move |id, anchor| {
            let _ = anchors.send(ChainMessage::StateOutput(id, anchor));
        },
        move |id, output| {
            let _ = outputs.send(ChainMessage::Output(id, output));
        },
    );

    let broadcaster = Broadcaster::new(
        peer_sender,
        committee.peers(),
        config.off_ledger.broadcast_peers,
    );
    let task = ChainTask {
        chain_id,
        params: config.chain.clone(),
        broadcast_interval: config.off_ledger.broadcast_interval,
        conn,
        committee,
        broadcaster,
        mempool: Mempool::new(chain_id, config.chain.dust_policy),
        state: handle.state.clone(),
        history: handle.history.clone(),
        processors: handle.processors.clone(),
        processed: handle.processed.clone(),
        anchor: None,
        pending: None,
        own_txs: LruCache::new(NonZeroUsize::new(OWN_TXS).unwrap_or(NonZeroUsize::MIN)),
        inbox,
        cancel,
    };
    (handle, tokio::spawn(task.run()))
}

struct ChainTask<C, K, P> {
    chain_id: ChainId,
    params: ChainParams,
    broadcast_interval: Duration,
    conn: NodeConn<C>,
    committee: K,
    broadcaster: Broadcaster<P>,
    mempool: Mempool,
    state: Arc<RwLock<StateDb>>,
    history: Arc<Mutex<LruCache<u32, StateDb>>>,
    processors: Arc<Processors>,
    processed: broadcast::Sender<RequestReceipt>,
    anchor: Option<(OutputId, AliasOutput)>,
    /// Published block the ledger has not decided on yet.
    pending: Option<PendingBlock>,
    own_txs: LruCache<TransactionId, ()>,
    inbox: mpsc::UnboundedReceiver<ChainMessage>,
    cancel: CancellationToken,
}

struct PendingBlock {
    tx: Transaction,
    tx_id: TransactionId,
    result: BlockResult,
}

impl PendingBlock {
    /// Whether `anchor`, found at `id`, is the one this block produced.
    fn produced(&self, id: &OutputId, anchor: &AliasOutput) -> bool {
        id.transaction_id == self.tx_id
            || anchor.state_metadata == self.result.l1_commitment.to_bytes()
    }
}

impl<C, K, P> ChainTask<C, K, P>
where
    C: L1Client + Send + Sync + 'static,
    K: Committee + Send + Sync + 'static,
    P: PeerSender + Send + 'static,
{
    async fn run(mut self) -> anyhow::Result<()> {
        info!(chain_id = %self.chain_id, "chain started");
        let mut block_tick = interval(self.params.block_interval);
        block_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut broadcast_tick = interval(self.broadcast_interval);
        broadcast_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let res = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break Ok(()),
                msg = self.inbox.recv() => match msg {
                    Some(msg) => {
                        if let Err(e) = self.handle(msg) {
                            break Err(e);
                        }
                    }
                    None => break Ok(()),
                },
                _ = broadcast_tick.tick() => self.broadcaster.tick(),
                _ = block_tick.tick() => {
                    if let Err(e) = self.produce_block().await {
                        break Err(e);
                    }
                }
            }
        };
        // Stops the ledger connection when the task ends on its own.
        self.cancel.cancel();
        match &res {
            Ok(()) => info!(chain_id = %self.chain_id, "chain stopped"),
            Err(e) => warn!(chain_id = %self.chain_id, "chain aborted: {e:#}"),
        }
        res
    }

    fn handle(&mut self, msg: ChainMessage) -> anyhow::Result<()> {
        match msg {
            ChainMessage::StateOutput(id, anchor) => return self.on_anchor(id, anchor),
            ChainMessage::Output(id, output) => {
                if self.own_txs.contains(&id.transaction_id) {
                    trace!(chain_id = %self.chain_id, output_id = %id, "own output");
                    return Ok(());
                }
                let state = self.state.read();
                match self.mempool.add_on_ledger(&*state, id, output) {
                    Ok(_) => {}
                    Err(e) => debug!(chain_id = %self.chain_id, output_id = %id, "output not admitted: {e}"),
                }
            }
            ChainMessage::OffLedger(request, reply) => {
                let state = self.state.read();
                let res = self.mempool.add_off_ledger(&*state, request.clone());
                if res == Ok(Submission::Accepted) {
                    self.broadcaster.add(request);
                }
                let _ = reply.send(res);
            }
        }
        Ok(())
    }

    fn on_anchor(&mut self, id: OutputId, anchor: AliasOutput) -> anyhow::Result<()> {
        if let Some(pending) = self.pending.take() {
            if pending.produced(&id, &anchor) {
                info!(
                    chain_id = %self.chain_id,
                    block_index = pending.result.block_index,
                    tx_id = %pending.tx_id,
                    "anchor transaction included late"
                );
                return self.commit(pending.result, id, anchor);
            }
            if self.anchor.as_ref().map(|(known, _)| *known) == Some(id) {
                // The anchor the block consumes is still unspent.
                self.pending = Some(pending);
            } else {
                warn!(
                    chain_id = %self.chain_id,
                    block_index = pending.result.block_index,
                    output_id = %id,
                    "pending block superseded by another anchor"
                );
            }
        }
        let ours = self.state.read().commitment();
        match L1Commitment::from_bytes(&anchor.state_metadata) {
            Ok(carried) if carried == ours => {
                if self.anchor.as_ref().map(|(known, _)| *known) != Some(id) {
                    debug!(
                        chain_id = %self.chain_id,
                        state_index = anchor.state_index,
                        output_id = %id,
                        "anchor"
                    );
                    self.anchor = Some((id, anchor));
                }
            }
            _ => warn!(
                chain_id = %self.chain_id,
                state_index = anchor.state_index,
                "anchor does not commit to the local state"
            ),
        }
        Ok(())
    }

    async fn produce_block(&mut self) -> anyhow::Result<()> {
        if let Some(pending) = self.pending.take() {
            debug!(
                chain_id = %self.chain_id,
                block_index = pending.result.block_index,
                "posting pending block again"
            );
            return self.publish(pending).await;
        }
        if self.mempool.is_empty() {
            return Ok(());
        }
        let Some((anchor_output_id, anchor)) = self.anchor.clone() else {
            return Ok(());
        };
        if anchor.state_controller() != Some(&self.committee.address()) {
            trace!(chain_id = %self.chain_id, "not the state controller of the anchor");
            return Ok(());
        }

        let snapshot = self.state.read().clone();
        let task = BlockTask {
            anchor,
            anchor_output_id,
            requests: self.mempool.batch(self.params.max_requests_per_block),
            timestamp: now(),
            validator: self.params.validator,
            l1_params: self.params.l1_params.clone(),
        };
        let result = match run_block(&snapshot, &self.processors, task) {
            Ok(result) => result,
            Err(VmError::Fatal(msg)) => bail!("chain {}: {msg}", self.chain_id),
            Err(e) => {
                warn!(chain_id = %self.chain_id, "block not produced: {e}");
                return Ok(());
            }
        };

        let refused: Vec<RequestId> = result
            .skipped
            .iter()
            .filter(|(_, reason)| !reason.is_retryable())
            .map(|(id, _)| *id)
            .collect();
        self.mempool.remove(&refused);
        for id in &refused {
            self.broadcaster.remove(id);
        }
        if result.receipts.is_empty() {
            return Ok(());
        }

        let tx = match self.committee.sign(result.essence.clone()).await {
            Ok(tx) => tx,
            Err(e) => {
                warn!(chain_id = %self.chain_id, "signing block {}: {e:#}", result.block_index);
                return Ok(());
            }
        };
        let tx_id = tx.id();
        self.own_txs.put(tx_id, ());
        self.publish(PendingBlock { tx, tx_id, result }).await
    }

    async fn publish(&mut self, block: PendingBlock) -> anyhow::Result<()> {
        let tx_id = block.tx_id;
        let res = self
            .conn
            .publish_tx(block.tx.clone(), Some(self.params.publish_timeout))
            .await;
        let e = match res {
            Ok(()) => {
                let next = block
                    .result
                    .next_anchor()
                    .cloned()
                    .context("anchor transaction without anchor output")?;
                return self.commit(block.result, OutputId::new(tx_id, 0), next);
            }
            Err(NodeConnError::Canceled) => return Ok(()),
            Err(e) => e,
        };
        warn!(
            chain_id = %self.chain_id,
            block_index = block.result.block_index,
            "anchor transaction {tx_id}: {e}"
        );
        // Posting again is refused once the block is in, so the ledger's
        // anchor decides what happened.
        self.pending = Some(block);
        match self.conn.current_anchor().await {
            Ok(Some((id, anchor))) => self.on_anchor(id, anchor)?,
            Ok(None) => {}
            Err(e) => debug!(chain_id = %self.chain_id, "reading the anchor: {e}"),
        }
        if matches!(e, NodeConnError::TxConflicting(_)) {
            if let Some(dropped) = self.pending.take() {
                info!(
                    chain_id = %self.chain_id,
                    block_index = dropped.result.block_index,
                    "block dropped, producing it again"
                );
            }
        }
        Ok(())
    }

    fn commit(
        &mut self,
        result: BlockResult,
        anchor_id: OutputId,
        next: AliasOutput,
    ) -> anyhow::Result<()> {
        let tx_id = anchor_id.transaction_id;
        {
            let mut state = self.state.write();
            let commitment = state.commit(&result.mutations);
            ensure!(
                commitment == result.l1_commitment,
                "block {} commits to {commitment}, anchor carries {}",
                result.block_index,
                result.l1_commitment
            );
            self.history.lock().put(result.block_index, state.clone());
        }
        self.anchor = Some((anchor_id, next));

        let processed: Vec<RequestId> = result.receipts.iter().map(|r| r.request.id()).collect();
        self.mempool.remove(&processed);
        for id in &processed {
            self.broadcaster.remove(id);
        }
        self.mempool.prune(&*self.state.read())?;
        info!(
            chain_id = %self.chain_id,
            block_index = result.block_index,
            requests = processed.len(),
            %tx_id,
            "block committed"
        );
        if let Some((state_controller, _)) = result.rotation {
            info!(chain_id = %self.chain_id, %state_controller, "state control rotated");
        }
        for receipt in result.receipts {
            // No receiver is fine.
            let _ = self.processed.send(receipt);
        }
        Ok(())
    }
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
