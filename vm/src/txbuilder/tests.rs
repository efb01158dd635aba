use std::collections::BTreeMap;

use anchor_ledger::{
    make_basic_output, Ed25519Address, FoundryId, FungibleTokens, NftOutput, SendOptions,
    TransactionId,
};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::*;
use crate::testing_utils::common_setup;

const INITIAL_BASE_TOKENS: u64 = 10_000_000;

fn owner() -> Address {
    Address::Ed25519(Ed25519Address([4; 32]))
}

fn chain_id() -> AliasId {
    AliasId([2; 32])
}

fn token(n: u32) -> TokenId {
    FoundryId::build(&AliasId([9; 32]), n, 0)
}

fn anchor() -> (AliasOutput, OutputId) {
    let out = AliasOutput {
        amount: INITIAL_BASE_TOKENS,
        alias_id: chain_id(),
        state_index: 3,
        state_metadata: vec![0; 32],
        unlock_conditions: UnlockConditions::new()
            .with(UnlockCondition::StateControllerAddress(owner()))
            .with(UnlockCondition::GovernorAddress(owner())),
        features: Features::new().with(Feature::Sender(Address::Alias(chain_id()))),
        ..Default::default()
    };
    (out, OutputId::new(TransactionId([1; 32]), 0))
}

#[derive(Debug, Default)]
struct TestLoader {
    tokens: BTreeMap<TokenId, (BasicOutput, OutputId)>,
    nfts: BTreeMap<NftId, (NftOutput, OutputId)>,
}

impl OutputLoader for TestLoader {
    fn load_native_token_output(&self, id: &TokenId) -> Option<(BasicOutput, OutputId)> {
        self.tokens.get(id).cloned()
    }

    fn load_foundry(&self, _serial_number: u32) -> Option<(FoundryOutput, OutputId)> {
        None
    }

    fn load_nft(&self, id: &NftId) -> Option<(NftOutput, OutputId)> {
        self.nfts.get(id).cloned()
    }
}

fn anchor_input() -> Output {
    Output::Alias(anchor().0)
}

fn builder_with(params: L1Params, loader: TestLoader) -> AnchorTxBuilder {
    common_setup();
    let (out, id) = anchor();
    let sd = StorageDepositAssumption::new(&params.rent);
    AnchorTxBuilder::new(out, id, params, sd, Arc::new(loader)).unwrap()
}

fn builder() -> AnchorTxBuilder {
    builder_with(L1Params::default(), TestLoader::default())
}

fn request(n: u16, tokens: &FungibleTokens) -> OnLedgerRequest {
    let out = make_basic_output(
        Address::Alias(chain_id()),
        Some(owner()),
        tokens,
        None,
        SendOptions::default(),
        &RentStructure::default(),
        true,
    );
    OnLedgerRequest::from_output(OutputId::new(TransactionId([7; 32]), n), out.into()).unwrap()
}

fn payment(tokens: &FungibleTokens) -> Output {
    make_basic_output(
        owner(),
        Some(Address::Alias(chain_id())),
        tokens,
        None,
        SendOptions::default(),
        &RentStructure::default(),
        true,
    )
    .into()
}

fn commitment() -> L1Commitment {
    L1Commitment(ethereum_types::H256::repeat_byte(0xcc))
}

fn assert_balanced(essence: &TransactionEssence, inputs: &[Output]) {
    let base_in: u128 = inputs.iter().map(|o| o.amount() as u128).sum();
    assert_eq!(base_in, essence.output_base_tokens());
    let mut tokens_in = BTreeMap::<TokenId, U256>::new();
    for nt in inputs.iter().flat_map(|o| o.native_tokens().iter()) {
        *tokens_in.entry(nt.id).or_default() += nt.amount;
    }
    assert_eq!(tokens_in, essence.output_native_tokens());
}

#[test]
fn empty_block_moves_only_the_anchor() {
    let txb = builder();
    let (ins, outs) = txb.totals().unwrap();
    assert_eq!(
        ins.base_tokens_in_l2_accounts,
        INITIAL_BASE_TOKENS - txb.storage_deposit_assumption().anchor_output
    );
    assert_eq!(ins, outs);

    let (essence, _) = txb.build_essence(&commitment()).unwrap();
    assert_eq!(essence.inputs, vec![anchor().1]);
    assert_eq!(essence.outputs.len(), 1);
    let next = essence.outputs[0].as_alias().unwrap();
    assert_eq!(next.amount, INITIAL_BASE_TOKENS);
    assert_eq!(next.state_index, 4);
    assert_eq!(next.alias_id, chain_id());
    assert_eq!(next.state_metadata, commitment().to_bytes());
    assert_eq!(next.features.sender(), Some(&Address::Alias(chain_id())));
    assert_balanced(&essence, &[anchor_input()]);
}

#[test]
fn alias_id_of_a_fresh_anchor_comes_from_its_output_id() {
    let (mut out, id) = anchor();
    out.alias_id = AliasId::null();
    let params = L1Params::default();
    let sd = StorageDepositAssumption::new(&params.rent);
    let txb = AnchorTxBuilder::new(out, id, params, sd, Arc::new(NoOutputs)).unwrap();
    let (essence, _) = txb.build_essence(&commitment()).unwrap();
    assert_eq!(
        essence.outputs[0].as_alias().unwrap().alias_id,
        AliasId::from_output_id(&id)
    );
}

#[test]
fn consumed_base_tokens_join_the_pool() {
    let mut txb = builder();
    let req = request(0, &FungibleTokens::with_base_tokens(1_000_000));
    assert_eq!(txb.consume(&req).unwrap(), 0);
    assert_eq!(
        txb.total_base_tokens_in_l2_accounts(),
        INITIAL_BASE_TOKENS - txb.storage_deposit_assumption().anchor_output + 1_000_000
    );
    let (essence, _) = txb.build_essence(&commitment()).unwrap();
    assert_eq!(essence.inputs.len(), 2);
    assert_eq!(essence.inputs[1], req.output_id());
    assert_eq!(essence.outputs.len(), 1);
    assert_balanced(&essence, &[anchor_input(), req.output().clone()]);
}

#[test]
fn native_tokens_get_an_internal_output() {
    let mut txb = builder();
    let sd = *txb.storage_deposit_assumption();
    let req = request(
        0,
        &FungibleTokens::with_base_tokens(0).add_native_token(token(1), U256::from(100)),
    );
    let adjustment = txb.consume(&req).unwrap();
    assert_eq!(adjustment, -(sd.native_token_output as i64));
    assert_eq!(txb.native_token_balance(&token(1)), Some(U256::from(100)));

    let (_, outs) = txb.totals().unwrap();
    assert_eq!(
        outs.base_tokens_in_storage_deposits,
        sd.anchor_output + sd.native_token_output
    );

    let (essence, _) = txb.build_essence(&commitment()).unwrap();
    assert_eq!(essence.outputs.len(), 2);
    let internal = essence.outputs[1].as_basic().unwrap();
    assert_eq!(internal.native_tokens.get(&token(1)), U256::from(100));
    assert_eq!(internal.amount, sd.native_token_output);
    assert_eq!(
        internal.unlock_conditions.address(),
        Some(&Address::Alias(chain_id()))
    );
    assert_balanced(&essence, &[anchor_input(), req.output().clone()]);

    let changes = txb.changed_internal_outputs();
    assert_eq!(changes.native_tokens.len(), 1);
    assert_eq!(changes.native_tokens[0].1.as_ref().unwrap().1, 1);
}

#[test]
fn sending_the_whole_balance_removes_the_internal_output() {
    let mut loader = TestLoader::default();
    let sd = StorageDepositAssumption::new(&RentStructure::default());
    let held = BasicOutput {
        amount: sd.native_token_output,
        native_tokens: FungibleTokens::default()
            .add_native_token(token(1), U256::from(100))
            .native_tokens,
        unlock_conditions: UnlockConditions::new()
            .with(UnlockCondition::Address(Address::Alias(chain_id()))),
        ..Default::default()
    };
    let held_id = OutputId::new(TransactionId([5; 32]), 1);
    loader.tokens.insert(token(1), (held.clone(), held_id));
    let mut txb = builder_with(L1Params::default(), loader);
    let pool_before = txb.total_base_tokens_in_l2_accounts();

    let out = payment(&FungibleTokens::default().add_native_token(token(1), U256::from(100)));
    let sent = out.amount();
    let adjustment = txb.add_output(out.clone()).unwrap();
    assert_eq!(adjustment, sd.native_token_output as i64);
    assert_eq!(
        txb.total_base_tokens_in_l2_accounts(),
        pool_before - sent + sd.native_token_output
    );

    let (essence, _) = txb.build_essence(&commitment()).unwrap();
    assert_eq!(essence.inputs, vec![anchor().1, held_id]);
    assert_eq!(essence.outputs.len(), 2);
    assert_eq!(essence.outputs[1], out);
    assert_balanced(&essence, &[anchor_input(), Output::Basic(held)]);

    let changes = txb.changed_internal_outputs();
    assert_eq!(changes.native_tokens, vec![(token(1), None)]);
}

#[test]
fn spending_more_than_held_fails() {
    let mut txb = builder();
    let out = payment(&FungibleTokens::default().add_native_token(token(1), U256::from(1)));
    assert_eq!(
        txb.add_output(out),
        Err(TxBuilderError::NotEnoughNativeTokensBalance)
    );

    let mut txb = builder();
    let out = payment(&FungibleTokens::with_base_tokens(INITIAL_BASE_TOKENS));
    assert_eq!(
        txb.add_output(out),
        Err(TxBuilderError::NotEnoughBaseTokensBalance)
    );
}

#[test]
fn outputs_below_their_storage_deposit_are_refused() {
    let mut txb = builder();
    let mut out = payment(&FungibleTokens::with_base_tokens(0));
    out.set_amount(1);
    assert!(matches!(
        txb.add_output(out),
        Err(TxBuilderError::InsufficientStorageDeposit { available: 1, .. })
    ));
}

#[test]
fn input_limit_counts_the_anchor() {
    let mut txb = builder();
    let max = L1Params::default().max_inputs;
    for i in 0..max - 1 {
        txb.consume(&request(i as u16, &FungibleTokens::default()))
            .unwrap();
    }
    assert!(txb.inputs_are_full());
    let before = txb.total_base_tokens_in_l2_accounts();
    assert_eq!(
        txb.consume(&request(max as u16, &FungibleTokens::default())),
        Err(TxBuilderError::InputLimitExceeded)
    );
    assert_eq!(txb.num_consumed(), max - 1);
    assert_eq!(txb.total_base_tokens_in_l2_accounts(), before);

    let (essence, _) = txb.build_essence(&commitment()).unwrap();
    assert_eq!(essence.inputs.len(), max);
}

#[test]
fn output_limit_counts_the_anchor() {
    let mut txb = builder();
    let max = L1Params::default().max_outputs;
    for _ in 0..max - 1 {
        txb.add_output(payment(&FungibleTokens::default())).unwrap();
    }
    assert_eq!(
        txb.add_output(payment(&FungibleTokens::default())),
        Err(TxBuilderError::OutputLimitExceeded)
    );
    let (essence, _) = txb.build_essence(&commitment()).unwrap();
    assert_eq!(essence.outputs.len(), max);
}

#[test]
fn distinct_native_tokens_are_capped() {
    let params = L1Params {
        max_native_tokens_per_tx: 2,
        ..Default::default()
    };
    let mut txb = builder_with(params, TestLoader::default());
    for n in 0..2 {
        let tokens = FungibleTokens::default().add_native_token(token(n), U256::one());
        txb.consume(&request(n as u16, &tokens)).unwrap();
    }
    let tokens = FungibleTokens::default().add_native_token(token(2), U256::one());
    assert_eq!(
        txb.consume(&request(2, &tokens)),
        Err(TxBuilderError::TotalNativeTokensLimitExceeded)
    );
}

#[test]
fn foundry_lifecycle() {
    let mut txb = builder();
    let sd = *txb.storage_deposit_assumption();
    let pool = txb.total_base_tokens_in_l2_accounts();

    let scheme = SimpleTokenScheme {
        maximum_supply: U256::from(1000),
        ..Default::default()
    };
    let (sn, deposit) = txb.create_foundry(scheme, None).unwrap();
    assert_eq!(sn, 1);
    assert!(deposit >= sd.foundry_output);
    assert_eq!(txb.total_base_tokens_in_l2_accounts(), pool - deposit);

    let token_id = FoundryId::build(&chain_id(), sn, 0);
    let adjustment = txb
        .modify_foundry_supply(sn, SupplyChange::Mint(U256::from(100)))
        .unwrap();
    assert_eq!(adjustment, -(sd.native_token_output as i64));
    assert_eq!(txb.native_token_balance(&token_id), Some(U256::from(100)));
    assert_eq!(
        txb.modify_foundry_supply(sn, SupplyChange::Mint(U256::from(901))),
        Err(TxBuilderError::SupplyOutOfBounds)
    );
    txb.balanced_check().unwrap();

    let (essence, _) = txb.build_essence(&commitment()).unwrap();
    assert_eq!(essence.outputs.len(), 3);
    assert_eq!(essence.outputs[0].as_alias().unwrap().foundry_counter, 1);
    let foundry = essence.outputs[2].as_foundry().unwrap();
    assert_eq!(foundry.token_scheme.minted_tokens, U256::from(100));

    // Melting everything gives the token deposit back; destroying gives
    // back the foundry deposit.
    let adjustment = txb
        .modify_foundry_supply(sn, SupplyChange::Melt(U256::from(100)))
        .unwrap();
    assert_eq!(adjustment, sd.native_token_output as i64);
    assert_eq!(txb.destroy_foundry(sn).unwrap(), deposit);
    assert_eq!(txb.total_base_tokens_in_l2_accounts(), pool);

    let (essence, _) = txb.build_essence(&commitment()).unwrap();
    assert_eq!(essence.outputs.len(), 1);
    // The serial number stays used.
    assert_eq!(essence.outputs[0].as_alias().unwrap().foundry_counter, 1);
}

#[test]
fn nft_is_kept_then_sent() {
    let mut txb = builder();
    let sd = *txb.storage_deposit_assumption();
    let nft = NftOutput {
        amount: 100_000,
        unlock_conditions: UnlockConditions::new()
            .with(UnlockCondition::Address(Address::Alias(chain_id()))),
        immutable_features: Features::new().with(Feature::Issuer(owner())),
        ..Default::default()
    };
    let nft_output_id = OutputId::new(TransactionId([8; 32]), 0);
    let req = OnLedgerRequest::from_output(nft_output_id, nft.clone().into()).unwrap();
    let nft_id = NftId::from_output_id(&nft_output_id);

    let adjustment = txb.consume(&req).unwrap();
    assert!(adjustment <= -(sd.nft_output as i64));
    assert!(txb.holds_nft(&nft_id));

    let snapshot = txb.snapshot();
    let (essence, _) = txb.build_essence(&commitment()).unwrap();
    assert_eq!(essence.outputs.len(), 2);
    let kept = essence.outputs[1].as_nft().unwrap();
    assert_eq!(kept.nft_id, nft_id);
    assert_eq!(kept.immutable_features.issuer(), Some(&owner()));
    assert_balanced(&essence, &[anchor_input(), Output::Nft(nft.clone())]);

    let sent = NftOutput {
        nft_id,
        unlock_conditions: UnlockConditions::new().with(UnlockCondition::Address(owner())),
        ..kept.clone()
    };
    txb.add_output(sent.clone().into()).unwrap();
    assert!(!txb.holds_nft(&nft_id));
    let (essence, _) = txb.build_essence(&commitment()).unwrap();
    assert_eq!(essence.outputs.len(), 2);
    assert_eq!(essence.outputs[1], Output::Nft(sent));
    assert_balanced(&essence, &[anchor_input(), Output::Nft(nft)]);

    txb.restore(snapshot);
    assert!(txb.holds_nft(&nft_id));
}

#[test]
fn snapshot_and_restore() {
    let mut txb = builder();
    txb.consume(&request(0, &FungibleTokens::with_base_tokens(500_000)))
        .unwrap();
    let snapshot = txb.snapshot();
    let (ins, outs) = txb.totals().unwrap();

    txb.consume(&request(1, &FungibleTokens::default().add_native_token(token(1), U256::one())))
        .unwrap();
    txb.add_output(payment(&FungibleTokens::with_base_tokens(100_000)))
        .unwrap();
    assert_ne!(txb.totals().unwrap().1, outs);

    txb.restore(snapshot);
    assert_eq!(txb.totals().unwrap(), (ins, outs));
    assert_eq!(txb.num_consumed(), 1);
}

fn random_tokens(rng: &mut StdRng, max_base_tokens: u64) -> FungibleTokens {
    let tokens = FungibleTokens::with_base_tokens(rng.gen_range(0..max_base_tokens));
    if rng.gen_bool(0.5) {
        tokens.add_native_token(token(rng.gen_range(0..4)), U256::from(rng.gen_range(1..1000u64)))
    } else {
        tokens
    }
}

#[test]
fn random_operations_keep_the_builder_balanced() {
    let mut rng = StdRng::seed_from_u64(0x7b);
    let (mut succeeded, mut failed) = (0, 0);
    for _ in 0..20 {
        let mut txb = builder();
        let mut foundries: Vec<u32> = Vec::new();
        let mut next_request = 0u16;
        for _ in 0..40 {
            let snapshot = txb.snapshot();
            let totals = txb.totals().unwrap();
            let posted = txb.posted.clone();
            let consumed = txb.num_consumed();

            let serial_number = match foundries.len() {
                0 => rng.gen_range(1..3),
                n => foundries[rng.gen_range(0..n)],
            };
            let res = match rng.gen_range(0..5) {
                0 => {
                    next_request += 1;
                    let tokens = random_tokens(&mut rng, 2_000_000);
                    txb.consume(&request(next_request, &tokens)).map(drop)
                }
                1 => {
                    let tokens = random_tokens(&mut rng, 3_000_000);
                    txb.add_output(payment(&tokens)).map(drop)
                }
                2 => {
                    let scheme = SimpleTokenScheme {
                        maximum_supply: U256::from(rng.gen_range(1..10_000u64)),
                        ..Default::default()
                    };
                    txb.create_foundry(scheme, None)
                        .map(|(sn, _)| foundries.push(sn))
                }
                3 => {
                    let amount = U256::from(rng.gen_range(1..2_000u64));
                    let change = if rng.gen_bool(0.6) {
                        SupplyChange::Mint(amount)
                    } else {
                        SupplyChange::Melt(amount)
                    };
                    txb.modify_foundry_supply(serial_number, change).map(drop)
                }
                _ => txb
                    .destroy_foundry(serial_number)
                    .map(|_| foundries.retain(|sn| *sn != serial_number)),
            };

            match res {
                Ok(()) => {
                    succeeded += 1;
                    txb.balanced_check().unwrap();
                }
                Err(_) => {
                    failed += 1;
                    txb.restore(snapshot);
                    assert_eq!(txb.totals().unwrap(), totals);
                    assert_eq!(txb.posted, posted);
                    assert_eq!(txb.num_consumed(), consumed);
                }
            }
        }
    }
    assert!(succeeded > 0 && failed > 0, "{succeeded} ok, {failed} failed");
}

#[test]
fn rotation_changes_only_the_controllers() {
    let mut txb = builder();
    let next = Address::Ed25519(Ed25519Address([6; 32]));
    txb.rotate_to(next, owner());
    let (essence, _) = txb.build_essence(&commitment()).unwrap();
    let anchor = essence.outputs[0].as_alias().unwrap();
    assert_eq!(anchor.state_controller(), Some(&next));
    assert_eq!(anchor.governor(), Some(&owner()));
    assert_eq!(anchor.alias_id, chain_id());
}

#[test]
fn storage_deposit_assumption_bytes() {
    let sd = StorageDepositAssumption::new(&RentStructure::default());
    assert!(sd.anchor_output > 0 && sd.native_token_output > 0);
    assert_eq!(StorageDepositAssumption::from_bytes(&sd.to_bytes()).unwrap(), sd);
}
