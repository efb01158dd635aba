mod common;

use anchor_ledger::{L1Params, Packable};
use chain_vm::blocklog as bl;
use chain_vm::contracts::{governance, partition};
use chain_vm::gas::Ratio32;
use chain_vm::{CoreContract, GasFeePolicy, GasLimits, VmError};
use common::*;
use kv_state::Dict;

fn controller_param(to: &ed25519_dalek::SigningKey) -> Dict {
    Dict::new().with(governance::PARAM_STATE_CONTROLLER, address_of(to).to_bytes())
}

#[test]
fn rotation_moves_the_next_anchor() {
    let mut chain = TestChain::new();
    let owner = chain.owner.clone();
    let next = key(30);

    let allow = chain.call(
        &owner,
        CoreContract::Governance.hname(),
        governance::FUNC_ADD_ALLOWED_STATE_CONTROLLER,
        controller_param(&next),
        1_000_000,
    );
    let rotate = chain.call(
        &owner,
        CoreContract::Governance.hname(),
        governance::FUNC_ROTATE_STATE_CONTROLLER,
        controller_param(&next),
        1_000_000,
    );
    let result = chain.run(vec![allow, rotate]);
    assert!(result.receipts.iter().all(|r| r.is_ok()));
    assert_eq!(
        result.rotation,
        Some((address_of(&next), address_of(&owner)))
    );
    assert_eq!(chain.anchor.state_controller(), Some(&address_of(&next)));
    assert_eq!(chain.anchor.governor(), Some(&address_of(&owner)));
    assert_eq!(chain.anchor.alias_id, chain.chain_id);

    let log = partition(&chain.db, CoreContract::Blocklog.hname());
    let ctrl = bl::get_control_addresses(&log).unwrap().unwrap();
    assert_eq!(ctrl.state_controller, address_of(&next));
    assert_eq!(ctrl.since_block_index, 2);

    chain.state_controller = next.clone();
    let alice = key(10);
    let dep = chain.deposit(&alice, 1_000_000);
    let result = chain.run(vec![dep]);
    assert!(result.rotation.is_none());
    assert_eq!(chain.anchor.state_controller(), Some(&address_of(&next)));
}

#[test]
fn rotation_requires_an_allowed_address() {
    let mut chain = TestChain::new();
    let owner = chain.owner.clone();
    let alice = key(10);
    let dep = chain.deposit(&alice, 1_000_000);
    chain.run(vec![dep]);

    let unlisted = chain.call(
        &owner,
        CoreContract::Governance.hname(),
        governance::FUNC_ROTATE_STATE_CONTROLLER,
        controller_param(&key(30)),
        1_000_000,
    );
    let by_stranger = chain.call(
        &alice,
        CoreContract::Governance.hname(),
        governance::FUNC_ADD_ALLOWED_STATE_CONTROLLER,
        controller_param(&key(30)),
        1_000_000,
    );
    let result = chain.run(vec![unlisted, by_stranger]);
    assert!(!result.receipts[0].is_ok());
    assert_eq!(
        result.receipts[1].error,
        Some(VmError::Unauthorized.to_unresolved())
    );
    assert!(result.rotation.is_none());
    assert_eq!(
        chain.anchor.state_controller(),
        Some(&address_of(&chain.state_controller))
    );
}

#[test]
fn ownership_is_handed_over_in_two_steps() {
    let mut chain = TestChain::new();
    let owner = chain.owner.clone();
    let bob = key(11);
    let dep = chain.deposit(&bob, 1_000_000);
    let delegate = chain.call(
        &owner,
        CoreContract::Governance.hname(),
        governance::FUNC_DELEGATE_CHAIN_OWNERSHIP,
        Dict::new().with(governance::PARAM_CHAIN_OWNER, agent_of(&bob).to_bytes()),
        1_000_000,
    );
    chain.run(vec![dep, delegate]);

    let get_owner = |chain: &TestChain| {
        let ret = chain
            .view(
                CoreContract::Governance.hname(),
                governance::VIEW_GET_CHAIN_OWNER,
                Dict::new(),
            )
            .unwrap();
        chain_vm::AgentId::from_bytes(ret.get_ref(governance::PARAM_CHAIN_OWNER.as_bytes()).unwrap())
            .unwrap()
    };
    assert_eq!(get_owner(&chain), agent_of(&owner));

    let claim = chain.call(
        &bob,
        CoreContract::Governance.hname(),
        governance::FUNC_CLAIM_CHAIN_OWNERSHIP,
        Dict::new(),
        1_000_000,
    );
    let result = chain.run(vec![claim]);
    assert!(result.receipts[0].is_ok());
    assert_eq!(get_owner(&chain), agent_of(&bob));
}

#[test]
fn validator_takes_its_share_of_fees() {
    let policy = GasFeePolicy {
        validator_fee_share: 20,
        ..Default::default()
    };
    let mut chain = TestChain::with(L1Params::default(), policy, GasLimits::default());
    let validator = agent_of(&key(20));
    chain.validator = Some(validator);
    let alice = key(10);
    let dep = chain.deposit(&alice, 1_000_000);
    chain.run(vec![dep]);

    assert_eq!(chain.base_tokens(&validator), 2_000);
    assert_eq!(chain.base_tokens(&chain.common_account()), 8_000);
    assert_eq!(chain.base_tokens(&agent_of(&alice)), 990_000);
}

#[test]
fn gas_price_scales_the_fee() {
    let policy = GasFeePolicy {
        gas_per_token: Ratio32 { a: 10, b: 1 },
        ..Default::default()
    };
    let mut chain = TestChain::with(L1Params::default(), policy, GasLimits::default());
    let alice = key(10);
    let dep = chain.deposit(&alice, 1_000_000);
    let result = chain.run(vec![dep]);
    assert_eq!(result.receipts[0].gas_burned, 10_000);
    assert_eq!(result.receipts[0].gas_fee_charged, 1_000);
    assert_eq!(chain.base_tokens(&agent_of(&alice)), 999_000);
}
