//! Execution of one request of a batch.
//!
//! Three overlays are stacked for every request: the block overlay holds
//! what earlier requests did, the request overlay takes the consumed
//! output, the nonce, the fee and the receipt, and the execution overlay
//! takes what the called contract writes. Only the execution overlay is
//! dropped when the request fails.

use anchor_ledger::FungibleTokens;
use kv_state::{BufferedKvStore, KvReader, KvStore, Mutations};
use tracing::debug;

use super::SkipReason;
use crate::accounts::{self, NftRecord};
use crate::agent::AgentId;
use crate::blocklog::{self as bl, RequestReceipt};
use crate::contracts::{partition, partition_mut, CoreContract};
use crate::error::{VmError, VmResult};
use crate::gas::{BurnCode, GasFeePolicy, GasLimits, MIN_GAS_PER_REQUEST};
use crate::request::{Request, RequestId};
use crate::sandbox::{BlockEnv, Sandbox};
use crate::txbuilder::AnchorTxBuilder;

// Bytes a request asks the chain to store.
fn written_bytes(muts: &Mutations) -> u64 {
    let sets: usize = muts.sets().map(|(k, v)| k.len() + v.len()).sum();
    let dels: usize = muts.dels().map(Vec::len).sum();
    (sets + dels) as u64
}

pub(super) struct RequestRunner<'a> {
    env: &'a BlockEnv<'a>,
    pub(super) txb: AnchorTxBuilder,
    fee_policy: GasFeePolicy,
    gas_limits: GasLimits,
    validator: Option<AgentId>,
    pub(super) receipts: Vec<RequestReceipt>,
    pub(super) skipped: Vec<(RequestId, SkipReason)>,
    pub(super) gas_burned: u64,
    pub(super) gas_fee_charged: u64,
}

impl<'a> RequestRunner<'a> {
    pub(super) fn new(
        env: &'a BlockEnv<'a>,
        txb: AnchorTxBuilder,
        fee_policy: GasFeePolicy,
        gas_limits: GasLimits,
        validator: Option<AgentId>,
    ) -> Self {
        Self {
            env,
            txb,
            fee_policy,
            gas_limits,
            validator,
            receipts: Vec::new(),
            skipped: Vec::new(),
            gas_burned: 0,
            gas_fee_charged: 0,
        }
    }

    fn skip(&mut self, id: RequestId, reason: SkipReason) {
        debug!(request_id = %id, %reason, "request skipped");
        self.skipped.push((id, reason));
    }

    fn check_processable<S: KvReader + ?Sized>(
        &self,
        state: &S,
        request: &Request,
    ) -> VmResult<Option<SkipReason>> {
        let blocklog = partition(state, CoreContract::Blocklog.hname());
        if bl::is_request_processed(&blocklog, &request.id())? {
            return Ok(Some(SkipReason::AlreadyProcessed));
        }
        let Request::OffLedger(r) = request else {
            return Ok(None);
        };
        if r.verify_signature().is_err() {
            return Ok(Some(SkipReason::InvalidSignature));
        }
        if r.chain_id != self.env.chain_id {
            return Ok(Some(SkipReason::WrongChain(r.chain_id)));
        }
        if r.gas_budget == 0 {
            return Ok(Some(SkipReason::ZeroGasBudget));
        }
        let acc = partition(state, CoreContract::Accounts.hname());
        Ok(accounts::check_nonce(&acc, &r.sender(), r.nonce)
            .err()
            .map(|e| SkipReason::InvalidNonce(e.to_string())))
    }

    // Takes in what the request carries and returns the account paying for
    // it.
    fn admit<S: KvStore + ?Sized>(
        &mut self,
        state: &mut S,
        request: &Request,
    ) -> VmResult<Result<AgentId, SkipReason>> {
        let payer = match request.sender_account() {
            AgentId::Nil => AgentId::common_account(self.env.chain_id),
            sender => sender,
        };
        let mut acc = partition_mut(state, CoreContract::Accounts.hname());
        match request {
            Request::OnLedger(r) => {
                let adjustment = match self.txb.consume(r) {
                    Ok(a) => a,
                    Err(e) => return Ok(Err(SkipReason::Limit(e))),
                };
                let credited = accounts::credit(&mut acc, &payer, &r.fungible_tokens())
                    .and_then(|()| accounts::adjust_base_tokens(&mut acc, &payer, adjustment));
                match credited {
                    Ok(()) => {}
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => return Ok(Err(SkipReason::Rejected(e.to_string()))),
                }
                if let Some(nft) = r.nft() {
                    accounts::credit_nft(
                        &mut acc,
                        &NftRecord {
                            id: nft.id,
                            issuer: nft.issuer,
                            metadata: nft.metadata,
                            owner: payer,
                        },
                    );
                }
            }
            Request::OffLedger(r) => accounts::save_nonce(&mut acc, &payer, r.nonce)?,
        }
        Ok(Ok(payer))
    }

    fn gas_budget<S: KvReader + ?Sized>(
        &self,
        state: &S,
        payer: &AgentId,
        request: &Request,
    ) -> VmResult<u64> {
        let acc = partition(state, CoreContract::Accounts.hname());
        let balance = accounts::base_tokens(&acc, payer)?;
        Ok(request
            .gas_budget()
            .min(self.gas_limits.max_gas_per_request)
            .min(self.fee_policy.gas_budget_from_tokens(balance))
            .min(self.gas_limits.max_gas_per_block - self.gas_burned))
    }

    // Moves the fee from the payer to the validator and the common account.
    // The fee never exceeds what the payer holds.
    fn charge_fee<S: KvStore + ?Sized>(
        &self,
        state: &mut S,
        payer: &AgentId,
        gas_burned: u64,
    ) -> VmResult<u64> {
        let mut acc = partition_mut(state, CoreContract::Accounts.hname());
        let balance = accounts::base_tokens(&acc, payer)?;
        let fee = self.fee_policy.fee_from_gas(gas_burned).min(balance);
        if fee == 0 {
            return Ok(0);
        }
        accounts::debit(&mut acc, payer, &FungibleTokens::with_base_tokens(fee))?;
        let common = AgentId::common_account(self.env.chain_id);
        let (to_validator, to_common) = match self.validator {
            Some(_) => self.fee_policy.split_fee(fee),
            None => (0, fee),
        };
        if let Some(validator) = self.validator.filter(|_| to_validator > 0) {
            accounts::credit(
                &mut acc,
                &validator,
                &FungibleTokens::with_base_tokens(to_validator),
            )?;
        }
        if to_common > 0 {
            accounts::credit(&mut acc, &common, &FungibleTokens::with_base_tokens(to_common))?;
        }
        Ok(fee)
    }

    /// Runs `request` on top of `block`. Only fatal errors are returned;
    /// everything else ends up in the receipt or in the skipped list.
    pub(super) fn run<R: KvReader>(
        &mut self,
        block: &mut BufferedKvStore<R>,
        request: Request,
    ) -> VmResult<()> {
        let id = request.id();
        if let Some(reason) = self.check_processable(&*block, &request)? {
            self.skip(id, reason);
            return Ok(());
        }
        if self.gas_burned >= self.gas_limits.max_gas_per_block {
            self.skip(id, SkipReason::BlockGasLimit);
            return Ok(());
        }

        let before = self.txb.snapshot();
        let mut req = BufferedKvStore::new(&*block);
        let payer = match self.admit(&mut req, &request)? {
            Ok(payer) => payer,
            Err(reason) => {
                self.txb.restore(before);
                self.skip(id, reason);
                return Ok(());
            }
        };
        let budget = self.gas_budget(&req, &payer, &request)?;

        let admitted = self.txb.snapshot();
        let mut exec = BufferedKvStore::new(&req);
        let mut sandbox = Sandbox::new(&mut exec, &mut self.txb, self.env, &request, budget);
        let result = sandbox.run_request();
        let (mut gas, events) = sandbox.finish();
        let result = result.and_then(|_| match exec.mutations().is_empty() {
            true => Ok(()),
            false => gas.burn(BurnCode::StorageWrite, written_bytes(exec.mutations())),
        });
        let error = match result {
            Ok(()) => {
                let muts = exec.into_mutations();
                req.absorb(muts);
                None
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                drop(exec);
                self.txb.restore(admitted);
                debug!(request_id = %id, error = %e, "request failed");
                Some(e)
            }
        };

        let gas_burned = gas.burned().max(MIN_GAS_PER_REQUEST.min(budget));
        let fee = self.charge_fee(&mut req, &payer, gas_burned)?;
        let request_index = self.receipts.len() as u16;
        let receipt = RequestReceipt {
            request,
            error: error.as_ref().map(VmError::to_unresolved),
            gas_budget: budget,
            gas_burned,
            gas_fee_charged: fee,
            block_index: self.env.block_index,
            request_index,
        };
        let mut log = partition_mut(&mut req, CoreContract::Blocklog.hname());
        bl::save_receipt(&mut log, &receipt)?;
        if error.is_none() {
            bl::save_events(&mut log, self.env.block_index, request_index, &events);
        }
        drop(log);
        let muts = req.into_mutations();
        block.absorb(muts);

        debug!(
            request_id = %id,
            request_index,
            gas_burned,
            fee,
            gas = %gas.log(),
            "request processed"
        );
        self.gas_burned += gas_burned;
        self.gas_fee_charged += fee;
        self.receipts.push(receipt);
        Ok(())
    }
}
