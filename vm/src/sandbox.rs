//! What a contract sees while it runs.
//!
//! A [`Sandbox`] is created for every request. It owns the gas meter and the
//! event list of the request and keeps a stack of call frames, one per
//! contract call in progress. Views get a [`ViewContext`] instead, which can
//! only read.

use std::fmt;

use anchor_ledger::{
    make_basic_output, Address, Feature, Features, FungibleTokens, L1Params, NftId, NftOutput,
    Output, SendOptions, UnlockCondition, UnlockConditions,
};
use ethereum_types::H256;
use kv_state::{Dict, KvReader, KvStore, SubRealm};
use tracing::debug;

use crate::accounts;
use crate::agent::{AgentId, ChainId};
use crate::contracts::{
    partition, partition_mut, root, CoreContract, EntryPoint, Processors, FUNC_INIT,
};
use crate::error::{VmError, VmResult};
use crate::gas::{BurnCode, GasMeter};
use crate::hname::Hname;
use crate::request::{Allowance, Request};
use crate::txbuilder::AnchorTxBuilder;

/// Deepest chain of nested contract calls.
pub const MAX_CALL_DEPTH: usize = 32;

/// Facts about the block being produced.
#[derive(Clone, Copy, Debug)]
pub struct BlockEnv<'a> {
    /// The chain.
    pub chain_id: ChainId,
    /// Index of the block.
    pub block_index: u32,
    /// Seconds since the epoch; never below the previous block's.
    pub timestamp: u64,
    /// Protocol parameters of the ledger.
    pub l1_params: &'a L1Params,
    /// Programs the node can run.
    pub processors: &'a Processors,
}

#[derive(Clone, Debug, Default)]
struct CallFrame {
    contract: Hname,
    caller: AgentId,
    params: Dict,
    allowance: Allowance,
}

/// The full sandbox of a request.
pub struct Sandbox<'a> {
    state: &'a mut dyn KvStore,
    txb: &'a mut AnchorTxBuilder,
    env: &'a BlockEnv<'a>,
    request: &'a Request,
    gas: GasMeter,
    events: Vec<String>,
    current: CallFrame,
    stack: Vec<CallFrame>,
}

impl fmt::Debug for Sandbox<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox")
            .field("request", &self.request.id())
            .field("contract", &self.current.contract)
            .field("depth", &self.stack.len())
            .field("gas", &self.gas)
            .finish()
    }
}

impl<'a> Sandbox<'a> {
    pub(crate) fn new(
        state: &'a mut dyn KvStore,
        txb: &'a mut AnchorTxBuilder,
        env: &'a BlockEnv<'a>,
        request: &'a Request,
        gas_budget: u64,
    ) -> Self {
        Self {
            state,
            txb,
            env,
            request,
            gas: GasMeter::new(gas_budget),
            events: Vec::new(),
            current: CallFrame {
                caller: request.sender_account(),
                ..Default::default()
            },
            stack: Vec::new(),
        }
    }

    /// Calls the target of the request on behalf of its sender.
    pub(crate) fn run_request(&mut self) -> VmResult<Dict> {
        let target = self.request.call_target();
        self.call_as(
            self.request.sender_account(),
            target.contract,
            target.entry_point,
            self.request.params(),
            self.request.allowance(),
        )
    }

    /// Gas meter and events, once the request is done.
    pub(crate) fn finish(self) -> (GasMeter, Vec<String>) {
        (self.gas, self.events)
    }

    /// The chain.
    pub fn chain_id(&self) -> ChainId {
        self.env.chain_id
    }

    /// Index of the block being produced.
    pub fn block_index(&self) -> u32 {
        self.env.block_index
    }

    /// Timestamp of the block.
    pub fn timestamp(&self) -> u64 {
        self.env.timestamp
    }

    /// Protocol parameters of the ledger.
    pub fn l1_params(&self) -> &L1Params {
        self.env.l1_params
    }

    /// The request being executed.
    pub fn request(&self) -> &Request {
        self.request
    }

    /// The contract being executed.
    pub fn contract(&self) -> Hname {
        self.current.contract
    }

    /// The account of the contract being executed.
    pub fn contract_agent(&self) -> AgentId {
        AgentId::Contract {
            chain_id: self.env.chain_id,
            hname: self.current.contract,
        }
    }

    /// Who called the current entry point: the request sender or a contract.
    pub fn caller(&self) -> AgentId {
        self.current.caller
    }

    /// Parameters of the current call.
    pub fn params(&self) -> &Dict {
        &self.current.params
    }

    /// What is left of the allowance granted by the caller.
    pub fn allowance(&self) -> &Allowance {
        &self.current.allowance
    }

    /// Tokens carried by an on-ledger request, already credited to the
    /// sender's account.
    pub fn incoming_transfer(&self) -> Option<FungibleTokens> {
        self.request.fungible_tokens()
    }

    /// Partition of the current contract.
    pub fn state(&mut self) -> SubRealm<&mut (dyn KvStore + 'a)> {
        partition_mut(&mut *self.state, self.current.contract)
    }

    /// Partition of the current contract, read-only.
    pub fn state_reader(&self) -> SubRealm<&(dyn KvStore + 'a)> {
        partition(&*self.state, self.current.contract)
    }

    /// Partition of another contract. Reserved to core contracts.
    pub(crate) fn partition_mut(
        &mut self,
        contract: CoreContract,
    ) -> SubRealm<&mut (dyn KvStore + 'a)> {
        partition_mut(&mut *self.state, contract.hname())
    }

    /// Partition of another contract, read-only.
    pub(crate) fn partition(&self, contract: CoreContract) -> SubRealm<&(dyn KvStore + 'a)> {
        partition(&*self.state, contract.hname())
    }

    /// The anchor transaction of the block.
    pub(crate) fn txb(&mut self) -> &mut AnchorTxBuilder {
        &mut *self.txb
    }

    /// Budget of the request.
    pub fn gas_budget(&self) -> u64 {
        self.gas.budget()
    }

    /// Gas burned so far.
    pub fn gas_burned(&self) -> u64 {
        self.gas.burned()
    }

    /// Burns `gas` on behalf of the contract.
    pub fn burn_gas(&mut self, gas: u64) -> VmResult<()> {
        self.gas.burn(BurnCode::Utility, gas)
    }

    /// Burns the cost of `code` for size `x`.
    pub fn burn(&mut self, code: BurnCode, x: u64) -> VmResult<()> {
        self.gas.burn(code, x)
    }

    /// Emits an event, stored with the receipt.
    pub fn event(&mut self, msg: impl Into<String>) -> VmResult<()> {
        let msg = msg.into();
        self.burn(BurnCode::EmitEvent, msg.len() as u64)?;
        self.events.push(format!("[{}] {msg}", self.current.contract));
        Ok(())
    }

    /// Fails the call with `msg` unless `cond` holds.
    pub fn require(&self, cond: bool, msg: &str) -> VmResult<()> {
        match cond {
            true => Ok(()),
            false => Err(VmError::Generic(msg.to_string())),
        }
    }

    /// Fails unless the caller is `agent`.
    pub fn require_caller(&self, agent: &AgentId) -> VmResult<()> {
        match &self.current.caller == agent {
            true => Ok(()),
            false => Err(VmError::Unauthorized),
        }
    }

    /// Fungible balance of `agent` on the chain.
    pub fn balance(&mut self, agent: &AgentId) -> VmResult<FungibleTokens> {
        self.burn(BurnCode::GetBalance, 0)?;
        accounts::balances(&self.partition(CoreContract::Accounts), agent)
    }

    /// Moves what is left of the allowance from the caller to `target`.
    pub fn transfer_allowance_to(&mut self, target: &AgentId) -> VmResult<Allowance> {
        self.burn(BurnCode::TransferAllowance, 0)?;
        let allowance = std::mem::take(&mut self.current.allowance);
        let from = self.current.caller;
        let mut acc = self.partition_mut(CoreContract::Accounts);
        accounts::move_between(&mut acc, &from, target, &allowance.assets)?;
        for id in &allowance.nfts {
            accounts::move_nft(&mut acc, &from, target, id)?;
        }
        Ok(allowance)
    }

    /// Moves what is left of the allowance to the current contract.
    pub fn take_allowance(&mut self) -> VmResult<Allowance> {
        let me = self.contract_agent();
        self.transfer_allowance_to(&me)
    }

    // Debits an output about to be posted from the current contract and
    // mirrors the storage deposit change of the builder.
    fn post_output(&mut self, output: Output) -> VmResult<()> {
        let me = self.contract_agent();
        let spent = FungibleTokens {
            base_tokens: output.amount(),
            native_tokens: output.native_tokens().clone(),
        };
        accounts::debit(&mut self.partition_mut(CoreContract::Accounts), &me, &spent)?;
        let adjustment = self.txb.add_output(output)?;
        accounts::adjust_base_tokens(
            &mut self.partition_mut(CoreContract::Accounts),
            &me,
            adjustment,
        )
    }

    /// Sends `tokens` from the account of the current contract to an L1
    /// address. The amount is raised to the storage deposit; an expiration
    /// returns the output to the chain.
    pub fn send(
        &mut self,
        target: Address,
        tokens: &FungibleTokens,
        metadata: Option<Vec<u8>>,
        mut options: SendOptions,
    ) -> VmResult<()> {
        self.burn(BurnCode::SendL1Request, 0)?;
        let chain = Address::Alias(self.env.chain_id);
        if let Some((_, unix_time)) = options.expiration {
            options.expiration = Some((chain, unix_time));
        }
        let out = make_basic_output(
            target,
            Some(chain),
            tokens,
            metadata,
            options,
            &self.env.l1_params.rent,
            true,
        );
        debug!(
            target = %target,
            amount = out.amount,
            native_tokens = out.native_tokens.len(),
            "sending"
        );
        self.post_output(out.into())
    }

    /// Sends an NFT owned by the current contract to an L1 address.
    pub fn send_nft(
        &mut self,
        target: Address,
        id: NftId,
        metadata: Option<Vec<u8>>,
    ) -> VmResult<()> {
        self.burn(BurnCode::SendL1Request, 0)?;
        let me = self.contract_agent();
        let record =
            accounts::debit_nft(&mut self.partition_mut(CoreContract::Accounts), &me, &id)?;
        let mut features =
            Features::new().with(Feature::Sender(Address::Alias(self.env.chain_id)));
        if let Some(m) = metadata.filter(|m| !m.is_empty()) {
            features.upsert(Feature::Metadata(m));
        }
        let mut immutable_features = Features::new();
        if let Some(issuer) = record.issuer {
            immutable_features.upsert(Feature::Issuer(issuer));
        }
        if !record.metadata.is_empty() {
            immutable_features.upsert(Feature::Metadata(record.metadata));
        }
        let mut out = NftOutput {
            nft_id: id,
            unlock_conditions: UnlockConditions::new().with(UnlockCondition::Address(target)),
            features,
            immutable_features,
            ..Default::default()
        };
        out.amount = self
            .env
            .l1_params
            .rent
            .min_storage_deposit(&out.clone().into());
        self.post_output(out.into())
    }

    /// Deploys the program `program_hash` under `name` and calls its `init`
    /// entry point with `init_params`.
    pub fn deploy(
        &mut self,
        program_hash: H256,
        name: &str,
        description: &str,
        init_params: Dict,
    ) -> VmResult<Hname> {
        self.burn(BurnCode::DeployContract, 0)?;
        let processors = self.env.processors;
        let processor = processors
            .get(&program_hash)
            .ok_or_else(|| VmError::InvalidParam(format!("unknown program {program_hash:?}")))?;
        let hname = Hname::from_name(name);
        let record = root::ContractRecord {
            program_hash,
            name: name.to_string(),
            description: description.to_string(),
            deployer: self.current.caller,
        };
        root::register_contract(&mut self.partition_mut(CoreContract::Root), hname, &record)?;
        debug!(contract = name, %hname, program = processor.name(), "deployed");
        let init = Hname::from_name(FUNC_INIT);
        if processor.entry_point(init).is_some() {
            let me = self.contract_agent();
            self.call_as(me, hname, init, init_params, None)?;
        }
        Ok(hname)
    }

    /// Calls another contract on behalf of the current one. `allowance` is
    /// taken from the current contract's account.
    pub fn call(
        &mut self,
        contract: Hname,
        entry_point: Hname,
        params: Dict,
        allowance: Option<Allowance>,
    ) -> VmResult<Dict> {
        self.burn(BurnCode::CallContract, 0)?;
        let me = self.contract_agent();
        self.call_as(me, contract, entry_point, params, allowance)
    }

    pub(crate) fn call_as(
        &mut self,
        caller: AgentId,
        contract: Hname,
        entry_point: Hname,
        params: Dict,
        allowance: Option<Allowance>,
    ) -> VmResult<Dict> {
        let processors = self.env.processors;
        let ep = processors
            .resolve(&*self.state, contract)?
            .entry_point(entry_point)
            .ok_or(VmError::EntryPointNotFound {
                contract,
                entry_point,
            })?;
        if self.stack.len() >= MAX_CALL_DEPTH {
            return Err(VmError::Generic("call depth exceeded".into()));
        }
        let frame = CallFrame {
            contract,
            caller,
            params,
            allowance: allowance.unwrap_or_default(),
        };
        self.stack.push(std::mem::replace(&mut self.current, frame));
        let ret = match ep {
            EntryPoint::Func(f) => f(self),
            EntryPoint::View(v) => {
                let state: &dyn KvReader = &self.state;
                v(&ViewContext::new(
                    state,
                    self.env.chain_id,
                    processors,
                    contract,
                    self.current.params.clone(),
                ))
            }
        };
        if let Some(prev) = self.stack.pop() {
            self.current = prev;
        }
        ret
    }

    /// Makes the next anchor use `state_controller`. Only governance may
    /// rotate.
    pub fn rotate_state_controller(&mut self, state_controller: Address) -> VmResult<()> {
        if self.current.contract != CoreContract::Governance.hname() {
            return Err(VmError::Unauthorized);
        }
        let governor = *self
            .txb
            .anchor()
            .governor()
            .ok_or_else(|| VmError::Fatal("anchor without governor".into()))?;
        self.txb.rotate_to(state_controller, governor);
        Ok(())
    }
}

/// Read-only context of a view.
pub struct ViewContext<'a> {
    state: &'a dyn KvReader,
    chain_id: ChainId,
    processors: &'a Processors,
    contract: Hname,
    params: Dict,
}

impl fmt::Debug for ViewContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewContext")
            .field("chain_id", &self.chain_id)
            .field("contract", &self.contract)
            .finish()
    }
}

impl<'a> ViewContext<'a> {
    /// A view of `contract` over the whole chain `state`.
    pub fn new(
        state: &'a dyn KvReader,
        chain_id: ChainId,
        processors: &'a Processors,
        contract: Hname,
        params: Dict,
    ) -> Self {
        Self {
            state,
            chain_id,
            processors,
            contract,
            params,
        }
    }

    /// The chain.
    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    /// The contract whose view runs.
    pub fn contract(&self) -> Hname {
        self.contract
    }

    /// Parameters of the call.
    pub fn params(&self) -> &Dict {
        &self.params
    }

    /// Partition of the current contract.
    pub fn state_reader(&self) -> SubRealm<&'a dyn KvReader> {
        partition(self.state, self.contract)
    }

    /// Partition of another contract. Reserved to core contracts.
    pub(crate) fn partition(&self, contract: CoreContract) -> SubRealm<&'a dyn KvReader> {
        partition(self.state, contract.hname())
    }

    /// Calls a view of another contract.
    pub fn call(&self, contract: Hname, entry_point: Hname, params: Dict) -> VmResult<Dict> {
        call_view(self.state, self.chain_id, self.processors, contract, entry_point, params)
    }
}

/// Calls a view against `state`. Mutating entry points are refused.
pub fn call_view(
    state: &dyn KvReader,
    chain_id: ChainId,
    processors: &Processors,
    contract: Hname,
    entry_point: Hname,
    params: Dict,
) -> VmResult<Dict> {
    let ep = processors
        .resolve(state, contract)?
        .entry_point(entry_point)
        .ok_or(VmError::EntryPointNotFound {
            contract,
            entry_point,
        })?;
    match ep {
        EntryPoint::View(v) => v(&ViewContext::new(state, chain_id, processors, contract, params)),
        EntryPoint::Func(_) => Err(VmError::Unauthorized),
    }
}
