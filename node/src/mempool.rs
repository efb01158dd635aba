//! Requests waiting for a block.
//!
//! Outputs coming from the ledger and signed requests coming from clients
//! are checked against the committed state of the chain before they enter
//! the pool. What is admitted stays until a committed block processes it or
//! the VM refuses it for good.

use std::collections::BTreeMap;

use anchor_ledger::{Address, Output, OutputId};
use chain_vm::blocklog as bl;
use chain_vm::contracts::{governance, partition};
use chain_vm::gas::MIN_GAS_PER_REQUEST;
use chain_vm::request::sort_batch;
use chain_vm::{
    accounts, AgentId, ChainId, CoreContract, OffLedgerRequest, OnLedgerRequest, Request,
    RequestId, VmError,
};
use kv_state::KvReader;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, trace};

use crate::config::DustPolicy;

/// Result of handing a request to a chain.
pub type AdmissionResult<T> = Result<T, AdmissionError>;

/// Why a request is not taken in.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum AdmissionError {
    /// The signature does not verify against the sender.
    #[error("invalid signature")]
    InvalidSignature,

    /// The chain is not running on this node.
    #[error("unknown chain {0}")]
    UnknownChain(ChainId),

    /// The sender already used the nonce, in a block or in another pending
    /// request.
    #[error("nonce {nonce} of {sender} already used")]
    DuplicateNonce { sender: AgentId, nonce: u64 },

    #[error("request of {0} bytes is too large")]
    Oversized(usize),

    /// The bytes do not decode to a request.
    #[error("malformed request: {0}")]
    Malformed(String),

    /// The request offers no gas at all.
    #[error("zero gas budget")]
    ZeroGasBudget,

    /// A committed block already has a receipt for it.
    #[error("request {0} already processed")]
    AlreadyProcessed(RequestId),

    /// The output cannot be consumed by the chain as a request.
    #[error("output {0} is not a request to the chain")]
    NotARequest(OutputId),

    /// The output does not pay for the smallest request.
    #[error("output {0} is dust")]
    Dust(OutputId),

    /// The committed state could not be read.
    #[error("chain state: {0}")]
    State(#[from] VmError),
}

/// Outcome of a submission that was not refused.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Submission {
    /// New to the pool.
    Accepted,
    /// The same request is already known.
    Duplicated,
}

/// The requests of one chain that are waiting for a block.
#[derive(Debug)]
pub struct Mempool {
    chain_id: ChainId,
    dust_policy: DustPolicy,
    on_ledger: BTreeMap<OutputId, OnLedgerRequest>,
    off_ledger: BTreeMap<(AgentId, u64), OffLedgerRequest>,
}

impl Mempool {
    /// An empty pool of `chain_id`.
    pub fn new(chain_id: ChainId, dust_policy: DustPolicy) -> Self {
        Self {
            chain_id,
            dust_policy,
            on_ledger: BTreeMap::new(),
            off_ledger: BTreeMap::new(),
        }
    }

    /// Number of waiting requests.
    pub fn len(&self) -> usize {
        self.on_ledger.len() + self.off_ledger.len()
    }

    /// Whether nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `id` is waiting.
    pub fn contains(&self, id: &RequestId) -> bool {
        self.on_ledger.contains_key(&id.0) || self.off_ledger.values().any(|r| r.id() == *id)
    }

    /// Takes in an output sent to the chain address.
    pub fn add_on_ledger<S: KvReader + ?Sized>(
        &mut self,
        state: &S,
        output_id: OutputId,
        output: Output,
    ) -> AdmissionResult<Submission> {
        let conditions = output.unlock_conditions();
        if conditions.address() != Some(&Address::Alias(self.chain_id))
            || conditions.storage_deposit_return().is_some()
        {
            return Err(AdmissionError::NotARequest(output_id));
        }
        if self.on_ledger.contains_key(&output_id) {
            return Ok(Submission::Duplicated);
        }
        let request = OnLedgerRequest::from_output(output_id, output)
            .map_err(|_| AdmissionError::NotARequest(output_id))?;
        let id = RequestId(output_id);
        if bl::is_request_processed(&partition(state, CoreContract::Blocklog.hname()), &id)? {
            return Err(AdmissionError::AlreadyProcessed(id));
        }
        if self.dust_policy == DustPolicy::Reject && is_dust(state, &request)? {
            return Err(AdmissionError::Dust(output_id));
        }
        trace!(chain_id = %self.chain_id, request_id = %id, "on-ledger request admitted");
        self.on_ledger.insert(output_id, request);
        Ok(Submission::Accepted)
    }

    /// Takes in a signed request.
    pub fn add_off_ledger<S: KvReader + ?Sized>(
        &mut self,
        state: &S,
        request: OffLedgerRequest,
    ) -> AdmissionResult<Submission> {
        if request.chain_id != self.chain_id {
            return Err(AdmissionError::UnknownChain(request.chain_id));
        }
        request
            .verify_signature()
            .map_err(|_| AdmissionError::InvalidSignature)?;
        if request.gas_budget == 0 {
            return Err(AdmissionError::ZeroGasBudget);
        }
        let id = request.id();
        if bl::is_request_processed(&partition(state, CoreContract::Blocklog.hname()), &id)? {
            return Err(AdmissionError::AlreadyProcessed(id));
        }
        let sender = request.sender();
        let nonce = request.nonce;
        if let Some(pending) = self.off_ledger.get(&(sender, nonce)) {
            return match pending.id() == id {
                true => Ok(Submission::Duplicated),
                false => Err(AdmissionError::DuplicateNonce { sender, nonce }),
            };
        }
        accounts::check_nonce(
            &partition(state, CoreContract::Accounts.hname()),
            &sender,
            nonce,
        )
        .map_err(|_| AdmissionError::DuplicateNonce { sender, nonce })?;
        trace!(chain_id = %self.chain_id, request_id = %id, "off-ledger request admitted");
        self.off_ledger.insert((sender, nonce), request);
        Ok(Submission::Accepted)
    }

    /// Up to `max` requests in execution order: on-ledger requests by
    /// output id, then off-ledger requests by sender and nonce.
    pub fn batch(&self, max: usize) -> Vec<Request> {
        let mut ret: Vec<Request> = self
            .on_ledger
            .values()
            .cloned()
            .map(Request::OnLedger)
            .chain(self.off_ledger.values().cloned().map(Request::OffLedger))
            .take(max)
            .collect();
        sort_batch(&mut ret);
        ret
    }

    /// Drops the given requests.
    pub fn remove<'a>(&mut self, ids: impl IntoIterator<Item = &'a RequestId>) {
        for id in ids {
            if self.on_ledger.remove(&id.0).is_none() {
                self.off_ledger.retain(|_, r| r.id() != *id);
            }
        }
    }

    /// Drops what the state shows as processed, and off-ledger requests
    /// whose nonce can no longer be used.
    pub fn prune<S: KvReader + ?Sized>(&mut self, state: &S) -> AdmissionResult<()> {
        let log = partition(state, CoreContract::Blocklog.hname());
        let acc = partition(state, CoreContract::Accounts.hname());
        let before = self.len();
        let mut processed = Vec::new();
        for id in self.on_ledger.keys() {
            if bl::is_request_processed(&log, &RequestId(*id))? {
                processed.push(*id);
            }
        }
        for id in processed {
            self.on_ledger.remove(&id);
        }
        self.off_ledger
            .retain(|(sender, nonce), _| accounts::check_nonce(&acc, sender, *nonce).is_ok());
        if before != self.len() {
            debug!(chain_id = %self.chain_id, pruned = before - self.len(), "mempool pruned");
        }
        Ok(())
    }
}

fn is_dust<S: KvReader + ?Sized>(state: &S, request: &OnLedgerRequest) -> AdmissionResult<bool> {
    if request.nft().is_some() || !request.output().native_tokens().is_empty() {
        return Ok(false);
    }
    let policy = governance::fee_policy(&partition(state, CoreContract::Governance.hname()))?;
    Ok(request.output().amount() < policy.fee_from_gas(MIN_GAS_PER_REQUEST))
}
