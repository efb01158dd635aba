mod common;

use anchor_ledger::{
    AliasId, FoundryId, FungibleTokens, Output, OutputId, Packable, TokenId, TransactionId,
};
use chain_vm::contracts::{accounts, param_packed};
use chain_vm::request::Allowance;
use chain_vm::txbuilder::StorageDepositAssumption;
use chain_vm::CoreContract;
use common::*;
use ethereum_types::U256;
use kv_state::codec::{encode_bool, encode_u256, encode_u32};
use kv_state::Dict;

fn foreign_token() -> TokenId {
    let issuer = AliasId::from_output_id(&OutputId::new(TransactionId([0x42; 32]), 0));
    FoundryId::build(&issuer, 1, 0)
}

fn assert_anchor_backs_l2(chain: &TestChain) {
    let sd = StorageDepositAssumption::new(&chain.l1_params.rent);
    assert_eq!(
        chain.anchor.amount,
        chain.total_assets().base_tokens + sd.anchor_output
    );
}

fn foundries_of(chain: &TestChain, agent: &chain_vm::AgentId) -> Dict {
    chain
        .view(
            CoreContract::Accounts.hname(),
            accounts::VIEW_ACCOUNT_FOUNDRIES,
            Dict::new().with(accounts::PARAM_AGENT_ID, agent.to_bytes()),
        )
        .unwrap()
}

fn foundry_token(chain: &TestChain, serial_number: u32) -> TokenId {
    let ret = chain
        .view(
            CoreContract::Accounts.hname(),
            accounts::VIEW_FOUNDRY_OUTPUT,
            Dict::new().with(accounts::PARAM_FOUNDRY_SN, encode_u32(serial_number)),
        )
        .unwrap();
    let out: Output = param_packed(&ret, accounts::PARAM_FOUNDRY_OUTPUT).unwrap();
    out.as_foundry().unwrap().token_id().unwrap()
}

#[test]
fn native_tokens_are_held_in_an_internal_output() {
    let mut chain = TestChain::new();
    let sd = StorageDepositAssumption::new(&chain.l1_params.rent);
    let alice = key(10);
    let token = foreign_token();

    let tokens = FungibleTokens::with_base_tokens(5_000_000).add_native_token(token, 100.into());
    let req = chain.on_ledger(Some(&alice), &tokens, None);
    let result = chain.run(vec![req]);
    assert!(result.receipts[0].is_ok());

    let outputs = &result.essence.outputs;
    assert_eq!(outputs.len(), 2);
    assert_eq!(outputs[1].native_tokens().get(&token), U256::from(100));
    assert_eq!(outputs[1].amount(), sd.native_token_output);

    let balance = chain.balance(&agent_of(&alice));
    assert_eq!(balance.native_tokens.get(&token), U256::from(100));
    assert_eq!(
        balance.base_tokens,
        5_000_000 - sd.native_token_output - 10_000
    );
    assert_eq!(chain.total_assets().native_tokens.get(&token), U256::from(100));
    assert_anchor_backs_l2(&chain);
}

#[test]
fn withdrawing_native_tokens_consumes_the_internal_output() {
    let mut chain = TestChain::new();
    let alice = key(10);
    let token = foreign_token();
    let tokens = FungibleTokens::with_base_tokens(5_000_000).add_native_token(token, 100.into());
    let req = chain.on_ledger(Some(&alice), &tokens, None);
    chain.run(vec![req]);
    let before = chain.base_tokens(&agent_of(&alice));

    let allowance = Allowance {
        assets: FungibleTokens::with_base_tokens(1_000_000).add_native_token(token, 100.into()),
        nfts: Vec::new(),
    };
    let req = chain.call_with_allowance(
        &alice,
        CoreContract::Accounts.hname(),
        accounts::FUNC_WITHDRAW,
        Dict::new(),
        allowance,
        1_000_000,
    );
    let result = chain.run(vec![req]);
    let receipt = &result.receipts[0];
    assert!(receipt.is_ok(), "{:?}", receipt.error);

    assert_eq!(result.essence.inputs.len(), 2);
    let sent: Vec<_> = result.essence.outputs[1..]
        .iter()
        .filter(|o| o.native_tokens().get(&token) == U256::from(100))
        .collect();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].amount(), 1_000_000);
    assert_eq!(result.essence.outputs.len(), 2);

    let balance = chain.balance(&agent_of(&alice));
    assert!(balance.native_tokens.is_empty());
    assert_eq!(
        balance.base_tokens,
        before - 1_000_000 - receipt.gas_fee_charged
    );
    assert_anchor_backs_l2(&chain);
}

#[test]
fn withdrawing_more_than_held_fails() {
    let mut chain = TestChain::new();
    let alice = key(10);
    let dep = chain.deposit(&alice, 2_000_000);
    chain.run(vec![dep]);
    let before = chain.base_tokens(&agent_of(&alice));

    let req = chain.call_with_allowance(
        &alice,
        CoreContract::Accounts.hname(),
        accounts::FUNC_WITHDRAW,
        Dict::new(),
        Allowance::base_tokens(5_000_000),
        1_000_000,
    );
    let result = chain.run(vec![req]);
    let receipt = &result.receipts[0];
    assert!(!receipt.is_ok());
    assert_eq!(result.essence.outputs.len(), 1);
    assert_eq!(
        chain.base_tokens(&agent_of(&alice)),
        before - receipt.gas_fee_charged
    );
    assert_anchor_backs_l2(&chain);
}

#[test]
fn foundry_lifecycle() {
    let mut chain = TestChain::new();
    let alice = key(10);
    let agent = agent_of(&alice);
    let dep = chain.deposit(&alice, 10_000_000);
    chain.run(vec![dep]);

    let create = chain.call(
        &alice,
        CoreContract::Accounts.hname(),
        accounts::FUNC_FOUNDRY_CREATE_NEW,
        Dict::new().with(accounts::PARAM_MAX_SUPPLY, encode_u256(&U256::from(1000))),
        1_000_000,
    );
    let result = chain.run(vec![create]);
    assert!(result.receipts[0].is_ok(), "{:?}", result.receipts[0].error);
    assert_eq!(result.essence.outputs.len(), 2);
    assert!(result.essence.outputs[1].as_foundry().is_some());
    assert!(foundries_of(&chain, &agent).get_ref(&encode_u32(1)).is_some());
    let token = foundry_token(&chain, 1);
    assert_anchor_backs_l2(&chain);

    let mint = chain.call(
        &alice,
        CoreContract::Accounts.hname(),
        accounts::FUNC_FOUNDRY_MODIFY_SUPPLY,
        Dict::new()
            .with(accounts::PARAM_FOUNDRY_SN, encode_u32(1))
            .with(accounts::PARAM_SUPPLY_DELTA, encode_u256(&U256::from(500))),
        1_000_000,
    );
    let result = chain.run(vec![mint]);
    assert!(result.receipts[0].is_ok(), "{:?}", result.receipts[0].error);
    assert_eq!(result.essence.inputs.len(), 2);
    assert_eq!(result.essence.outputs.len(), 3);
    assert_eq!(
        chain.balance(&agent).native_tokens.get(&token),
        U256::from(500)
    );
    assert_anchor_backs_l2(&chain);

    let over = chain.call(
        &alice,
        CoreContract::Accounts.hname(),
        accounts::FUNC_FOUNDRY_MODIFY_SUPPLY,
        Dict::new()
            .with(accounts::PARAM_FOUNDRY_SN, encode_u32(1))
            .with(accounts::PARAM_SUPPLY_DELTA, encode_u256(&U256::from(501))),
        1_000_000,
    );
    let melt = chain.call(
        &alice,
        CoreContract::Accounts.hname(),
        accounts::FUNC_FOUNDRY_MODIFY_SUPPLY,
        Dict::new()
            .with(accounts::PARAM_FOUNDRY_SN, encode_u32(1))
            .with(accounts::PARAM_SUPPLY_DELTA, encode_u256(&U256::from(500)))
            .with(accounts::PARAM_DESTROY_TOKENS, encode_bool(true)),
        1_000_000,
    );
    let destroy = chain.call(
        &alice,
        CoreContract::Accounts.hname(),
        accounts::FUNC_FOUNDRY_DESTROY,
        Dict::new().with(accounts::PARAM_FOUNDRY_SN, encode_u32(1)),
        1_000_000,
    );
    let result = chain.run(vec![over, melt, destroy]);
    assert!(!result.receipts[0].is_ok());
    assert!(result.receipts[1].is_ok(), "{:?}", result.receipts[1].error);
    assert!(result.receipts[2].is_ok(), "{:?}", result.receipts[2].error);
    assert_eq!(result.essence.inputs.len(), 3);
    assert_eq!(result.essence.outputs.len(), 1);
    assert!(chain.balance(&agent).native_tokens.is_empty());
    assert!(foundries_of(&chain, &agent).is_empty());
    assert_anchor_backs_l2(&chain);
}

#[test]
fn only_the_foundry_owner_mints() {
    let mut chain = TestChain::new();
    let alice = key(10);
    let bob = key(11);
    let a = chain.deposit(&alice, 10_000_000);
    let b = chain.deposit(&bob, 10_000_000);
    chain.run(vec![a, b]);
    let create = chain.call(
        &alice,
        CoreContract::Accounts.hname(),
        accounts::FUNC_FOUNDRY_CREATE_NEW,
        Dict::new(),
        1_000_000,
    );
    chain.run(vec![create]);

    let mint = chain.call(
        &bob,
        CoreContract::Accounts.hname(),
        accounts::FUNC_FOUNDRY_MODIFY_SUPPLY,
        Dict::new()
            .with(accounts::PARAM_FOUNDRY_SN, encode_u32(1))
            .with(accounts::PARAM_SUPPLY_DELTA, encode_u256(&U256::from(10))),
        1_000_000,
    );
    let result = chain.run(vec![mint]);
    assert_eq!(
        result.receipts[0].error,
        Some(chain_vm::VmError::Unauthorized.to_unresolved())
    );
    assert_eq!(result.essence.outputs.len(), 1);
}
