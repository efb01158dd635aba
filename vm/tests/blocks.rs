mod common;

use anchor_ledger::{AliasId, L1Params, OutputId, Packable};
use chain_vm::blocklog as bl;
use chain_vm::contracts::{accounts, errors, inccounter, param_with, partition, root};
use chain_vm::request::CallTarget;
use chain_vm::txbuilder::{StorageDepositAssumption, TxBuilderError};
use chain_vm::{
    CoreContract, GasFeePolicy, GasLimits, OffLedgerRequest, Request, SkipReason, VmError,
};
use common::*;
use kv_state::codec::{decode_u64, encode_i64, encode_u64};
use kv_state::Dict;

fn anchor_backs_l2(chain: &TestChain) {
    let sd = StorageDepositAssumption::new(&chain.l1_params.rent);
    assert_eq!(
        chain.anchor.amount,
        chain.total_assets().base_tokens + sd.anchor_output
    );
}

fn next_nonce(chain: &TestChain, agent: &chain_vm::AgentId) -> u64 {
    let ret = chain
        .view(
            CoreContract::Accounts.hname(),
            accounts::VIEW_GET_ACCOUNT_NONCE,
            Dict::new().with(accounts::PARAM_AGENT_ID, agent.to_bytes()),
        )
        .unwrap();
    param_with(&ret, accounts::PARAM_ACCOUNT_NONCE, decode_u64).unwrap()
}

fn deploy_counter(chain: &mut TestChain, initial: i64) {
    let owner = chain.owner.clone();
    let req = chain.call(
        &owner,
        CoreContract::Root.hname(),
        root::FUNC_DEPLOY_CONTRACT,
        Dict::new()
            .with(root::PARAM_PROGRAM_HASH, inccounter::program_hash().as_bytes())
            .with(root::PARAM_NAME, inccounter::NAME)
            .with(inccounter::PARAM_COUNTER, encode_i64(initial)),
        1_000_000,
    );
    let result = chain.run(vec![req.clone()]);
    assert!(result.receipts[0].is_ok(), "{:?}", result.receipts[0].error);
}

fn counter(chain: &TestChain) -> i64 {
    let ret = chain
        .view(hn(inccounter::NAME), inccounter::VIEW_GET_COUNTER, Dict::new())
        .unwrap();
    inccounter::decode_counter(&ret).unwrap()
}

#[test]
fn deposit_is_credited_minus_fee() {
    let mut chain = TestChain::new();
    let alice = key(10);
    let before = chain.anchor.amount;

    let req = chain.deposit(&alice, 1_000_000);
    let result = chain.run(vec![req.clone()]);

    assert_eq!(result.block_index, 1);
    assert!(result.skipped.is_empty());
    assert_eq!(result.receipts.len(), 1);
    let receipt = &result.receipts[0];
    assert!(receipt.is_ok());
    assert_eq!(receipt.gas_fee_charged, 10_000);
    let stored = chain.receipt(&req);
    assert_eq!(stored.block_index, 1);
    assert_eq!(stored.gas_fee_charged, receipt.gas_fee_charged);

    assert_eq!(chain.base_tokens(&agent_of(&alice)), 990_000);
    assert_eq!(chain.base_tokens(&chain.common_account()), 10_000);
    assert_eq!(chain.anchor.amount, before + 1_000_000);
    assert_eq!(chain.anchor.alias_id, chain.chain_id);
    assert_eq!(chain.anchor.state_index, 1);
    anchor_backs_l2(&chain);
}

#[test]
fn block_consumes_anchor_and_requests() {
    let mut chain = TestChain::new();
    let alice = key(10);
    let anchor_id = chain.anchor_output_id;
    let a = chain.deposit(&alice, 1_000_000);
    let b = chain.deposit(&alice, 2_000_000);
    let result = chain.run(vec![a.clone(), b.clone()]);

    let inputs = &result.essence.inputs;
    assert_eq!(inputs[0], anchor_id);
    assert!(inputs.contains(&a.id().0));
    assert!(inputs.contains(&b.id().0));
    assert_eq!(result.essence.outputs.len(), 1);

    let log = partition(&chain.db, CoreContract::Blocklog.hname());
    let info = bl::get_block_info(&log, 1).unwrap().unwrap();
    assert_eq!(info.total_requests, 2);
    assert_eq!(info.successful_requests, 2);
    assert_eq!(info.previous_anchor, anchor_id);
    assert_eq!(info.gas_fee_charged, 20_000);
}

#[test]
fn off_ledger_call_moves_the_nonce() {
    let mut chain = TestChain::new();
    let alice = key(10);
    let dep = chain.deposit(&alice, 1_000_000);
    chain.run(vec![dep]);
    assert_eq!(next_nonce(&chain, &agent_of(&alice)), 0);

    let call = chain.call(
        &alice,
        CoreContract::Accounts.hname(),
        accounts::FUNC_DEPOSIT,
        Dict::new(),
        100_000,
    );
    let result = chain.run(vec![call]);
    assert!(result.receipts[0].is_ok());
    assert_eq!(next_nonce(&chain, &agent_of(&alice)), 1);
    assert_eq!(chain.base_tokens(&agent_of(&alice)), 980_000);
    anchor_backs_l2(&chain);
}

#[test]
fn unprocessable_requests_are_skipped() {
    let mut chain = TestChain::new();
    let alice = key(10);
    let dep = chain.deposit(&alice, 1_000_000);
    let first = chain.call(
        &alice,
        CoreContract::Accounts.hname(),
        accounts::FUNC_DEPOSIT,
        Dict::new(),
        100_000,
    );
    chain.run(vec![dep.clone(), first.clone()]);

    let reused_nonce = Request::OffLedger(
        OffLedgerRequest::new(
            chain.chain_id,
            CallTarget::new(
                CoreContract::Accounts.hname(),
                hn(accounts::FUNC_DEPOSIT),
            ),
            Dict::new().with("x", encode_u64(1)),
            0,
            100_000,
        )
        .sign(&alice),
    );
    let mut tampered = chain.off_ledger(
        &alice,
        CoreContract::Accounts.hname(),
        accounts::FUNC_DEPOSIT,
        Dict::new(),
        100_000,
    );
    tampered = tampered.sign(&alice);
    tampered.gas_budget = 200_000;
    let other_chain = Request::OffLedger(
        OffLedgerRequest::new(
            AliasId::from_output_id(&OutputId::default()),
            CallTarget::new(
                CoreContract::Accounts.hname(),
                hn(accounts::FUNC_DEPOSIT),
            ),
            Dict::new(),
            1,
            100_000,
        )
        .sign(&alice),
    );
    let no_budget = Request::OffLedger(
        OffLedgerRequest::new(
            chain.chain_id,
            CallTarget::new(
                CoreContract::Accounts.hname(),
                hn(accounts::FUNC_DEPOSIT),
            ),
            Dict::new(),
            1,
            0,
        )
        .sign(&alice),
    );

    let result = chain.run(vec![
        dep.clone(),
        first.clone(),
        reused_nonce.clone(),
        Request::OffLedger(tampered.clone()),
        other_chain.clone(),
        no_budget.clone(),
    ]);
    assert!(result.receipts.is_empty());
    let reasons: Vec<_> = result.skipped.iter().map(|(_, r)| r.clone()).collect();
    assert_eq!(reasons[0], SkipReason::AlreadyProcessed);
    assert_eq!(reasons[1], SkipReason::AlreadyProcessed);
    assert!(matches!(reasons[2], SkipReason::InvalidNonce(_)));
    assert_eq!(reasons[3], SkipReason::InvalidSignature);
    assert!(matches!(reasons[4], SkipReason::WrongChain(_)));
    assert_eq!(reasons[5], SkipReason::ZeroGasBudget);
    assert!(reasons.iter().all(|r| !r.is_retryable()));
    assert_eq!(result.skipped[0].0, dep.id());
    assert_eq!(next_nonce(&chain, &agent_of(&alice)), 1);
}

#[test]
fn gas_budget_caps_the_fee() {
    let mut chain = TestChain::new();
    deploy_counter(&mut chain, 5);
    let alice = key(10);
    let dep = chain.deposit(&alice, 1_000_000);
    chain.run(vec![dep]);
    let before = chain.base_tokens(&agent_of(&alice));

    let req = chain.call(
        &alice,
        hn(inccounter::NAME),
        inccounter::FUNC_SPEND_GAS,
        Dict::new().with(inccounter::PARAM_GAS, encode_u64(5000)),
        1000,
    );
    let result = chain.run(vec![req.clone()]);
    let receipt = &result.receipts[0];
    assert_eq!(
        receipt.error,
        Some(VmError::GasLimitExceeded.to_unresolved())
    );
    assert_eq!(receipt.gas_budget, 1000);
    assert_eq!(receipt.gas_burned, 1000);
    assert_eq!(receipt.gas_fee_charged, 1000);
    assert_eq!(chain.base_tokens(&agent_of(&alice)), before - 1000);
    assert_eq!(next_nonce(&chain, &agent_of(&alice)), 1);
    anchor_backs_l2(&chain);
}

#[test]
fn counter_program_runs_and_fails_cleanly() {
    let mut chain = TestChain::new();
    deploy_counter(&mut chain, 5);
    assert_eq!(counter(&chain), 5);
    let log = partition(&chain.db, CoreContract::Blocklog.hname());
    assert!(bl::get_events_for_block(&log, 1)
        .iter()
        .any(|e| e.ends_with("counter = 5")));

    let alice = key(10);
    let dep = chain.deposit(&alice, 1_000_000);
    let inc = chain.call(
        &alice,
        hn(inccounter::NAME),
        inccounter::FUNC_INCREMENT,
        Dict::new(),
        100_000,
    );
    let fail = chain.call(
        &alice,
        hn(inccounter::NAME),
        inccounter::FUNC_FAIL,
        Dict::new(),
        100_000,
    );
    let result = chain.run(vec![dep, inc, fail.clone()]);
    assert!(result.receipts[1].is_ok());
    assert_eq!(counter(&chain), 6);

    let receipt = chain.receipt(&fail);
    let err = receipt.error.clone().unwrap();
    assert_eq!(
        errors::resolve_error(&chain.db, &err).unwrap(),
        "counter refused at 6"
    );
    assert!(receipt.gas_fee_charged > 0);
    let log = partition(&chain.db, CoreContract::Blocklog.hname());
    assert!(bl::get_events_for_request(&log, &fail.id())
        .unwrap()
        .is_empty());
    assert_eq!(next_nonce(&chain, &agent_of(&alice)), 2);
}

#[test]
fn only_the_owner_deploys() {
    let mut chain = TestChain::new();
    let alice = key(10);
    let dep = chain.deposit(&alice, 1_000_000);
    let req = chain.call(
        &alice,
        CoreContract::Root.hname(),
        root::FUNC_DEPLOY_CONTRACT,
        Dict::new()
            .with(root::PARAM_PROGRAM_HASH, inccounter::program_hash().as_bytes())
            .with(root::PARAM_NAME, inccounter::NAME),
        1_000_000,
    );
    let result = chain.run(vec![dep, req]);
    assert_eq!(
        result.receipts[1].error,
        Some(VmError::Unauthorized.to_unresolved())
    );
    assert!(chain
        .view(hn(inccounter::NAME), inccounter::VIEW_GET_COUNTER, Dict::new())
        .is_err());
}

#[test]
fn full_inputs_leave_requests_for_the_next_block() {
    let l1 = L1Params {
        max_inputs: 4,
        ..Default::default()
    };
    let mut chain = TestChain::with(l1, GasFeePolicy::default(), GasLimits::default());
    let alice = key(10);
    let reqs: Vec<_> = (0..5).map(|_| chain.deposit(&alice, 1_000_000)).collect();

    let result = chain.run(reqs.clone());
    assert_eq!(result.receipts.len(), 3);
    assert_eq!(result.essence.inputs.len(), 4);
    assert_eq!(result.skipped.len(), 2);
    for (id, reason) in &result.skipped {
        assert_eq!(*reason, SkipReason::Limit(TxBuilderError::InputLimitExceeded));
        assert!(reason.is_retryable());
        assert!(reqs[3..].iter().any(|r| r.id() == *id));
    }

    let result = chain.run(reqs[3..].to_vec());
    assert_eq!(result.receipts.len(), 2);
    assert!(result.skipped.is_empty());
    assert_eq!(chain.base_tokens(&agent_of(&alice)), 5 * 990_000);
    anchor_backs_l2(&chain);
}

#[test]
fn block_gas_limit_defers_requests() {
    let limits = GasLimits {
        max_gas_per_block: 25_000,
        ..Default::default()
    };
    let mut chain = TestChain::with(L1Params::default(), GasFeePolicy::default(), limits);
    let alice = key(10);
    let reqs: Vec<_> = (0..4).map(|_| chain.deposit(&alice, 1_000_000)).collect();
    let result = chain.run(reqs);
    assert_eq!(result.receipts.len(), 3);
    assert_eq!(result.receipts[2].gas_burned, 5_000);
    assert_eq!(result.skipped.len(), 1);
    assert_eq!(result.skipped[0].1, SkipReason::BlockGasLimit);
}

#[test]
fn stale_anchor_is_fatal() {
    let mut chain = TestChain::new();
    let alice = key(10);
    let stale = chain.task(vec![]);
    let dep = chain.deposit(&alice, 1_000_000);
    chain.run(vec![dep]);
    let err = chain_vm::run_block(&chain.db, &chain.processors, stale).unwrap_err();
    assert!(err.is_fatal());
}

#[test]
fn timestamps_never_go_back() {
    let mut chain = TestChain::new();
    chain.run(vec![]);
    chain.timestamp = GENESIS_TIME - 100;
    let result = chain.run(vec![]);
    assert_eq!(result.timestamp, GENESIS_TIME + 1);
}
