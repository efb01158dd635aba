//! The chains a node knows about, and the tasks of the active ones.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use chain_vm::blocklog::RequestReceipt;
use chain_vm::{ChainId, Hname, RequestId};
use kv_state::{Dict, KvReader, KvWriter, StateDb};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::chain::{spawn_chain, ChainHandle, Committee};
use crate::config::NodeConfig;
use crate::l1::L1Client;
use crate::mempool::{AdmissionError, AdmissionResult, Submission};
use crate::offledger::PeerSender;

/// What the node remembers about a chain.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ChainRecord {
    /// The chain.
    pub chain_id: ChainId,
    /// Whether the node runs it.
    pub active: bool,
}

struct RunningChain {
    handle: ChainHandle,
    task: JoinHandle<anyhow::Result<()>>,
}

/// Every chain of the node. Records are kept for deactivated chains too,
/// so that they can be brought back.
pub struct Chains<C> {
    client: Arc<C>,
    config: NodeConfig,
    records: Mutex<Dict>,
    running: Mutex<HashMap<ChainId, RunningChain>>,
    cancel: CancellationToken,
}

impl<C> Chains<C>
where
    C: L1Client + Send + Sync + 'static,
{
    /// No chains yet, all talking to the ledger through `client`.
    pub fn new(client: Arc<C>, config: NodeConfig) -> Self {
        Self {
            client,
            config,
            records: Mutex::new(Dict::new()),
            running: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Every known chain.
    pub fn records(&self) -> anyhow::Result<Vec<ChainRecord>> {
        self.records
            .lock()
            .entries(&[])
            .into_iter()
            .map(|(_, v)| serde_json::from_slice(&v).context("corrupt chain record"))
            .collect()
    }

    /// The record of `chain_id`, if the node knows the chain.
    pub fn record(&self, chain_id: &ChainId) -> anyhow::Result<Option<ChainRecord>> {
        self.records
            .lock()
            .get(chain_id.as_bytes())
            .map(|v| serde_json::from_slice(&v).context("corrupt chain record"))
            .transpose()
    }

    fn put_record(&self, record: ChainRecord) -> anyhow::Result<()> {
        let value = serde_json::to_vec(&record)?;
        self.records
            .lock()
            .set(record.chain_id.as_bytes(), &value);
        Ok(())
    }

    /// Starts the task of `chain_id` on `state`. A chain already running is
    /// left alone.
    pub fn activate<K, P>(
        &self,
        chain_id: ChainId,
        state: StateDb,
        committee: K,
        peer_sender: P,
    ) -> anyhow::Result<ChainHandle>
    where
        K: Committee + Send + Sync + 'static,
        P: PeerSender + Send + 'static,
    {
        let mut running = self.running.lock();
        if let Some(chain) = running.get(&chain_id) {
            if chain.handle.is_running() {
                return Ok(chain.handle.clone());
            }
        }
        self.put_record(ChainRecord {
            chain_id,
            active: true,
        })?;
        let (handle, task) = spawn_chain(
            self.client.clone(),
            chain_id,
            state,
            committee,
            peer_sender,
            &self.config,
            self.cancel.child_token(),
        );
        running.insert(
            chain_id,
            RunningChain {
                handle: handle.clone(),
                task,
            },
        );
        info!(%chain_id, "chain activated");
        Ok(handle)
    }

    /// Stops the task of `chain_id` and waits for it to end.
    pub async fn deactivate(&self, chain_id: &ChainId) -> anyhow::Result<()> {
        if self.record(chain_id)?.is_some() {
            self.put_record(ChainRecord {
                chain_id: *chain_id,
                active: false,
            })?;
        }
        let chain = self.running.lock().remove(chain_id);
        if let Some(chain) = chain {
            chain.handle.stop();
            chain.task.await??;
            info!(%chain_id, "chain deactivated");
        }
        Ok(())
    }

    /// Handle of `chain_id` while it runs.
    pub fn get(&self, chain_id: &ChainId) -> Option<ChainHandle> {
        self.running
            .lock()
            .get(chain_id)
            .map(|chain| chain.handle.clone())
    }

    /// See [`ChainHandle::submit_off_ledger`].
    pub async fn submit_off_ledger(
        &self,
        chain_id: &ChainId,
        bytes: &[u8],
    ) -> AdmissionResult<Submission> {
        match self.get(chain_id) {
            Some(chain) => chain.submit_off_ledger(bytes).await,
            None => Err(AdmissionError::UnknownChain(*chain_id)),
        }
    }

    /// See [`ChainHandle::call_view`].
    pub fn call_view(
        &self,
        chain_id: &ChainId,
        contract: Hname,
        function: Hname,
        params: Dict,
    ) -> anyhow::Result<Dict> {
        let chain = self
            .get(chain_id)
            .with_context(|| format!("chain {chain_id} is not active"))?;
        Ok(chain.call_view(contract, function, params)?)
    }

    /// See [`ChainHandle::wait_request_processed`].
    pub async fn wait_request_processed(
        &self,
        chain_id: &ChainId,
        id: RequestId,
        timeout: Duration,
    ) -> anyhow::Result<RequestReceipt> {
        let chain = self
            .get(chain_id)
            .with_context(|| format!("chain {chain_id} is not active"))?;
        chain.wait_request_processed(id, timeout).await
    }

    /// Stops every chain and waits for them.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.cancel.cancel();
        let chains: Vec<_> = self.running.lock().drain().collect();
        for (chain_id, chain) in chains {
            if let Err(e) = chain.task.await? {
                warn!(%chain_id, "chain ended with an error: {e:#}");
            }
        }
        Ok(())
    }
}
