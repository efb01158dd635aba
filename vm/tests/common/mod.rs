#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Once;

use anchor_ledger::{
    make_basic_output, Address, AliasOutput, BasicOutput, Ed25519Address, FungibleTokens,
    L1Params, Output, OutputId, Packable, SendOptions, TransactionId, UnlockCondition,
    UnlockConditions,
};
use chain_vm::accounts::NftRecord;
use chain_vm::blocklog::{self as bl, RequestReceipt};
use chain_vm::contracts::{accounts, partition, CoreContract, Processors};
use chain_vm::origin::{origin_transaction_essence, sign_origin_transaction};
use chain_vm::request::{Allowance, CallTarget, RequestMetadata};
use chain_vm::{
    call_view, chain_id_of, origin_state, run_block, sign_anchor_transaction, AgentId,
    BlockResult, BlockTask, ChainId, GasFeePolicy, GasLimits, Hname, OffLedgerRequest,
    OnLedgerRequest, OriginParams, Request, VmResult,
};
use ed25519_dalek::SigningKey;
use kv_state::{Dict, StateDb};

pub const ANCHOR_AMOUNT: u64 = 10_000_000;
pub const WALLET_FUNDS: u64 = 100_000_000;
pub const GENESIS_TIME: u64 = 1_700_000_000;

static INIT: Once = Once::new();

pub fn init_logger() {
    INIT.call_once(|| {
        let _ = pretty_env_logger::try_init();
    });
}

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

pub fn hn(name: &str) -> Hname {
    Hname::from_name(name)
}

/// A chain living only in memory: the committed state plus the anchor it is
/// anchored to, moved forward by every produced block.
pub struct TestChain {
    pub db: StateDb,
    pub anchor: AliasOutput,
    pub anchor_output_id: OutputId,
    pub chain_id: ChainId,
    pub l1_params: L1Params,
    pub processors: Processors,
    pub owner: SigningKey,
    pub state_controller: SigningKey,
    pub validator: Option<AgentId>,
    pub timestamp: u64,
    nonces: HashMap<[u8; 32], u64>,
    next_output: u32,
}

impl TestChain {
    pub fn new() -> Self {
        Self::with(L1Params::default(), GasFeePolicy::default(), GasLimits::default())
    }

    pub fn with(l1_params: L1Params, fee_policy: GasFeePolicy, gas_limits: GasLimits) -> Self {
        init_logger();
        let owner = key(1);
        let state_controller = key(2);
        let params = OriginParams {
            owner: agent_of(&owner),
            state_controller: address_of(&state_controller),
            governor: address_of(&owner),
            fee_policy,
            gas_limits,
            timestamp: GENESIS_TIME,
        };
        let wallet = address_of(&owner);
        let funds = Output::Basic(BasicOutput {
            amount: WALLET_FUNDS,
            unlock_conditions: UnlockConditions::new().with(UnlockCondition::Address(wallet)),
            ..Default::default()
        });
        let inputs = vec![(OutputId::new(TransactionId([0xee; 32]), 0), funds)];
        let essence =
            origin_transaction_essence(&params, &l1_params, ANCHOR_AMOUNT, wallet, &inputs)
                .unwrap();
        let origin = sign_origin_transaction(essence, &owner);
        let chain_id = chain_id_of(&origin);
        let (db, commitment) = origin_state(&params, &l1_params, ANCHOR_AMOUNT).unwrap();
        let anchor = origin.essence.outputs[0].as_alias().unwrap().clone();
        assert_eq!(anchor.state_metadata, commitment.to_bytes());

        Self {
            db,
            anchor,
            anchor_output_id: OutputId::new(origin.id(), 0),
            chain_id,
            l1_params,
            processors: Processors::new(),
            owner,
            state_controller,
            validator: None,
            timestamp: GENESIS_TIME + 1,
            nonces: HashMap::new(),
            next_output: 0,
        }
    }

    pub fn chain_address(&self) -> Address {
        Address::Alias(self.chain_id)
    }

    pub fn common_account(&self) -> AgentId {
        AgentId::common_account(self.chain_id)
    }

    fn next_output_id(&mut self) -> OutputId {
        self.next_output += 1;
        let mut tx = [0x77; 32];
        tx[..4].copy_from_slice(&self.next_output.to_le_bytes());
        OutputId::new(TransactionId(tx), 0)
    }

    /// An output sent to the chain by `sender`, carrying `tokens` and an
    /// optional call.
    pub fn on_ledger(
        &mut self,
        sender: Option<&SigningKey>,
        tokens: &FungibleTokens,
        metadata: Option<RequestMetadata>,
    ) -> Request {
        let out = make_basic_output(
            self.chain_address(),
            sender.map(address_of),
            tokens,
            metadata.map(|m| m.to_bytes()),
            SendOptions::default(),
            &self.l1_params.rent,
            true,
        );
        let id = self.next_output_id();
        Request::OnLedger(OnLedgerRequest::from_output(id, out.into()).unwrap())
    }

    pub fn deposit(&mut self, sender: &SigningKey, base_tokens: u64) -> Request {
        self.on_ledger(
            Some(sender),
            &FungibleTokens::with_base_tokens(base_tokens),
            None,
        )
    }

    /// A signed off-ledger call with the next nonce of `sender`.
    pub fn off_ledger(
        &mut self,
        sender: &SigningKey,
        contract: Hname,
        entry_point: &str,
        params: Dict,
        gas_budget: u64,
    ) -> OffLedgerRequest {
        let nonce = self
            .nonces
            .entry(sender.verifying_key().to_bytes())
            .or_insert(0);
        let req = OffLedgerRequest::new(
            self.chain_id,
            CallTarget::new(contract, hn(entry_point)),
            params,
            *nonce,
            gas_budget,
        );
        *nonce += 1;
        req
    }

    pub fn call(
        &mut self,
        sender: &SigningKey,
        contract: Hname,
        entry_point: &str,
        params: Dict,
        gas_budget: u64,
    ) -> Request {
        Request::OffLedger(
            self.off_ledger(sender, contract, entry_point, params, gas_budget)
                .sign(sender),
        )
    }

    pub fn call_with_allowance(
        &mut self,
        sender: &SigningKey,
        contract: Hname,
        entry_point: &str,
        params: Dict,
        allowance: Allowance,
        gas_budget: u64,
    ) -> Request {
        Request::OffLedger(
            self.off_ledger(sender, contract, entry_point, params, gas_budget)
                .with_allowance(allowance)
                .sign(sender),
        )
    }

    pub fn task(&self, requests: Vec<Request>) -> BlockTask {
        BlockTask {
            anchor: self.anchor.clone(),
            anchor_output_id: self.anchor_output_id,
            requests,
            timestamp: self.timestamp,
            validator: self.validator,
            l1_params: self.l1_params.clone(),
        }
    }

    /// Produces the next block and commits it as if its anchor transaction
    /// was confirmed.
    pub fn run(&mut self, requests: Vec<Request>) -> BlockResult {
        let result = run_block(&self.db, &self.processors, self.task(requests)).unwrap();
        self.commit(&result);
        result
    }

    pub fn commit(&mut self, result: &BlockResult) {
        let commitment = self.db.commit(&result.mutations);
        assert_eq!(commitment, result.l1_commitment);
        let tx = sign_anchor_transaction(result.essence.clone(), &self.state_controller);
        self.anchor = result.next_anchor().unwrap().clone();
        self.anchor_output_id = OutputId::new(tx.id(), 0);
        self.timestamp += 1;
    }

    pub fn view(&self, contract: Hname, entry_point: &str, params: Dict) -> VmResult<Dict> {
        call_view(
            &self.db,
            self.chain_id,
            &self.processors,
            contract,
            hn(entry_point),
            params,
        )
    }

    pub fn balance(&self, agent: &AgentId) -> FungibleTokens {
        let ret = self
            .view(
                CoreContract::Accounts.hname(),
                accounts::VIEW_BALANCE,
                Dict::new().with(accounts::PARAM_AGENT_ID, agent.to_bytes()),
            )
            .unwrap();
        accounts::decode_balance(&ret).unwrap()
    }

    pub fn base_tokens(&self, agent: &AgentId) -> u64 {
        self.balance(agent).base_tokens
    }

    pub fn total_assets(&self) -> FungibleTokens {
        let ret = self
            .view(
                CoreContract::Accounts.hname(),
                accounts::VIEW_TOTAL_ASSETS,
                Dict::new(),
            )
            .unwrap();
        accounts::decode_balance(&ret).unwrap()
    }

    pub fn receipt(&self, request: &Request) -> RequestReceipt {
        bl::get_request_receipt(
            &partition(&self.db, CoreContract::Blocklog.hname()),
            &request.id(),
        )
        .unwrap()
        .unwrap()
    }

    pub fn nft(&self, id: &anchor_ledger::NftId) -> Option<NftRecord> {
        chain_vm::accounts::nft_record(&partition(&self.db, CoreContract::Accounts.hname()), id)
            .unwrap()
    }
}
