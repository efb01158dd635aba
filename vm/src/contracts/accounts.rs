//! The `accounts` contract: deposits, withdrawals and native token
//! foundries on top of the L2 ledger in [`crate::accounts`].

use anchor_ledger::{FungibleTokens, NftId, Packable, SendOptions, SimpleTokenScheme};
use ethereum_types::U256;
use kv_state::codec::{decode_bool, decode_u256, decode_u32, encode_u32, encode_u64};
use kv_state::Dict;

use super::{param_or, param_packed, param_with, CoreContract, Processor};
use crate::accounts as l2;
use crate::agent::AgentId;
use crate::error::{VmError, VmResult};
use crate::sandbox::{Sandbox, ViewContext};
use crate::txbuilder::SupplyChange;

/// Keeps what the request brought in the sender's account.
pub const FUNC_DEPOSIT: &str = "deposit";
/// Sends the allowance to the caller's L1 address.
pub const FUNC_WITHDRAW: &str = "withdraw";
/// Moves the allowance to another account on the chain.
pub const FUNC_TRANSFER_ALLOWANCE_TO: &str = "transfer_allowance_to";
/// Creates a foundry owned by the caller.
pub const FUNC_FOUNDRY_CREATE_NEW: &str = "foundry_create_new";
/// Mints or melts tokens of a foundry owned by the caller.
pub const FUNC_FOUNDRY_MODIFY_SUPPLY: &str = "foundry_modify_supply";
/// Destroys an empty foundry owned by the caller.
pub const FUNC_FOUNDRY_DESTROY: &str = "foundry_destroy";
/// Fungible balance of an account.
pub const VIEW_BALANCE: &str = "balance";
/// Sum over every account.
pub const VIEW_TOTAL_ASSETS: &str = "total_assets";
/// NFTs of an account.
pub const VIEW_ACCOUNT_NFTS: &str = "account_nfts";
/// Foundries of an account.
pub const VIEW_ACCOUNT_FOUNDRIES: &str = "account_foundries";
/// Record of an NFT held by the chain.
pub const VIEW_NFT_DATA: &str = "nft_data";
/// Next off-ledger nonce of an account.
pub const VIEW_GET_ACCOUNT_NONCE: &str = "get_account_nonce";
/// Current output of a foundry.
pub const VIEW_FOUNDRY_OUTPUT: &str = "foundry_output";

/// Packed [`AgentId`].
pub const PARAM_AGENT_ID: &str = "a";
/// Packed [`FungibleTokens`].
pub const PARAM_FUNGIBLE_TOKENS: &str = "ft";
/// Maximum supply of a new foundry, 256 bits.
pub const PARAM_MAX_SUPPLY: &str = "ms";
/// Serial number of a foundry.
pub const PARAM_FOUNDRY_SN: &str = "s";
/// Amount to mint or melt.
pub const PARAM_SUPPLY_DELTA: &str = "d";
/// Melt instead of mint.
pub const PARAM_DESTROY_TOKENS: &str = "y";
/// Packed [`NftId`].
pub const PARAM_NFT_ID: &str = "z";
/// Packed [`l2::NftRecord`].
pub const PARAM_NFT_DATA: &str = "e";
/// Nonce, 8 bytes.
pub const PARAM_ACCOUNT_NONCE: &str = "n";
/// Packed foundry output.
pub const PARAM_FOUNDRY_OUTPUT: &str = "b";

fn deposit(_ctx: &mut Sandbox<'_>) -> VmResult<Dict> {
    Ok(Dict::new())
}

fn withdraw(ctx: &mut Sandbox<'_>) -> VmResult<Dict> {
    let caller = ctx.caller();
    let target = caller.address().ok_or_else(|| {
        VmError::InvalidParam(format!("{caller} has no L1 address to withdraw to"))
    })?;
    let allowance = ctx.take_allowance()?;
    ctx.require(!allowance.is_empty(), "nothing to withdraw")?;
    if !allowance.assets.is_empty() {
        ctx.send(target, &allowance.assets, None, SendOptions::default())?;
    }
    for id in allowance.nfts {
        ctx.send_nft(target, id, None)?;
    }
    Ok(Dict::new())
}

fn transfer_allowance_to(ctx: &mut Sandbox<'_>) -> VmResult<Dict> {
    let target: AgentId = param_packed(ctx.params(), PARAM_AGENT_ID)?;
    ctx.transfer_allowance_to(&target)?;
    Ok(Dict::new())
}

fn foundry_create_new(ctx: &mut Sandbox<'_>) -> VmResult<Dict> {
    let maximum_supply = param_or(ctx.params(), PARAM_MAX_SUPPLY, U256::MAX, decode_u256)?;
    let scheme = SimpleTokenScheme {
        maximum_supply,
        ..Default::default()
    };
    let (serial_number, deposit) = ctx.txb().create_foundry(scheme, None)?;
    let caller = ctx.caller();
    let mut acc = ctx.partition_mut(CoreContract::Accounts);
    l2::debit(&mut acc, &caller, &FungibleTokens::with_base_tokens(deposit))?;
    l2::add_foundry(&mut acc, &caller, serial_number);
    drop(acc);
    ctx.event(format!("foundry {serial_number} created by {caller}"))?;
    Ok(Dict::new().with(PARAM_FOUNDRY_SN, encode_u32(serial_number)))
}

fn require_foundry_owner(ctx: &Sandbox<'_>, serial_number: u32) -> VmResult<()> {
    let owns = l2::has_foundry(
        &ctx.partition(CoreContract::Accounts),
        &ctx.caller(),
        serial_number,
    );
    match owns {
        true => Ok(()),
        false => Err(VmError::Unauthorized),
    }
}

fn foundry_modify_supply(ctx: &mut Sandbox<'_>) -> VmResult<Dict> {
    let serial_number = param_with(ctx.params(), PARAM_FOUNDRY_SN, decode_u32)?;
    let delta = param_with(ctx.params(), PARAM_SUPPLY_DELTA, decode_u256)?;
    let melt = param_or(ctx.params(), PARAM_DESTROY_TOKENS, false, decode_bool)?;
    require_foundry_owner(ctx, serial_number)?;
    if delta.is_zero() {
        return Ok(Dict::new());
    }
    let caller = ctx.caller();
    let token_id = ctx
        .txb()
        .foundry_output(serial_number)?
        .token_id()
        .ok_or_else(|| VmError::Fatal(format!("foundry {serial_number} without token id")))?;
    let tokens = FungibleTokens::default().add_native_token(token_id, delta);

    let adjustment = match melt {
        true => {
            l2::debit(&mut ctx.partition_mut(CoreContract::Accounts), &caller, &tokens)?;
            ctx.txb()
                .modify_foundry_supply(serial_number, SupplyChange::Melt(delta))?
        }
        false => {
            let adjustment = ctx
                .txb()
                .modify_foundry_supply(serial_number, SupplyChange::Mint(delta))?;
            l2::credit(&mut ctx.partition_mut(CoreContract::Accounts), &caller, &tokens)?;
            adjustment
        }
    };
    l2::adjust_base_tokens(
        &mut ctx.partition_mut(CoreContract::Accounts),
        &caller,
        adjustment,
    )?;
    Ok(Dict::new())
}

fn foundry_destroy(ctx: &mut Sandbox<'_>) -> VmResult<Dict> {
    let serial_number = param_with(ctx.params(), PARAM_FOUNDRY_SN, decode_u32)?;
    require_foundry_owner(ctx, serial_number)?;
    let refund = ctx.txb().destroy_foundry(serial_number)?;
    let caller = ctx.caller();
    let mut acc = ctx.partition_mut(CoreContract::Accounts);
    l2::credit(&mut acc, &caller, &FungibleTokens::with_base_tokens(refund))?;
    l2::remove_foundry(&mut acc, &caller, serial_number);
    drop(acc);
    ctx.event(format!("foundry {serial_number} destroyed"))?;
    Ok(Dict::new())
}

fn view_balance(ctx: &ViewContext<'_>) -> VmResult<Dict> {
    let agent: AgentId = param_packed(ctx.params(), PARAM_AGENT_ID)?;
    let balance = l2::balances(&ctx.state_reader(), &agent)?;
    Ok(Dict::new().with(PARAM_FUNGIBLE_TOKENS, balance.to_bytes()))
}

fn view_total_assets(ctx: &ViewContext<'_>) -> VmResult<Dict> {
    let total = l2::total_assets(&ctx.state_reader())?;
    Ok(Dict::new().with(PARAM_FUNGIBLE_TOKENS, total.to_bytes()))
}

fn view_account_nfts(ctx: &ViewContext<'_>) -> VmResult<Dict> {
    let agent: AgentId = param_packed(ctx.params(), PARAM_AGENT_ID)?;
    Ok(l2::nfts_of(&ctx.state_reader(), &agent)?
        .into_iter()
        .enumerate()
        .map(|(i, id)| (encode_u32(i as u32), id.to_bytes()))
        .collect())
}

fn view_account_foundries(ctx: &ViewContext<'_>) -> VmResult<Dict> {
    let agent: AgentId = param_packed(ctx.params(), PARAM_AGENT_ID)?;
    Ok(l2::foundries_of(&ctx.state_reader(), &agent)?
        .into_iter()
        .map(|sn| (encode_u32(sn), Vec::new()))
        .collect())
}

fn view_nft_data(ctx: &ViewContext<'_>) -> VmResult<Dict> {
    let id: NftId = param_packed(ctx.params(), PARAM_NFT_ID)?;
    let record = l2::nft_record(&ctx.state_reader(), &id)?
        .ok_or_else(|| VmError::InvalidParam(format!("unknown NFT {id}")))?;
    Ok(Dict::new().with(PARAM_NFT_DATA, record.to_bytes()))
}

fn view_get_account_nonce(ctx: &ViewContext<'_>) -> VmResult<Dict> {
    let agent: AgentId = param_packed(ctx.params(), PARAM_AGENT_ID)?;
    let nonce = l2::next_nonce(&ctx.state_reader(), &agent)?;
    Ok(Dict::new().with(PARAM_ACCOUNT_NONCE, encode_u64(nonce)))
}

fn view_foundry_output(ctx: &ViewContext<'_>) -> VmResult<Dict> {
    let serial_number = param_with(ctx.params(), PARAM_FOUNDRY_SN, decode_u32)?;
    let record = l2::foundry_output(&ctx.state_reader(), serial_number)?
        .ok_or_else(|| VmError::InvalidParam(format!("unknown foundry {serial_number}")))?;
    Ok(Dict::new().with(PARAM_FOUNDRY_OUTPUT, record.output.to_bytes()))
}

/// Reads the result of the `balance` and `total_assets` views.
pub fn decode_balance(result: &Dict) -> VmResult<FungibleTokens> {
    param_packed(result, PARAM_FUNGIBLE_TOKENS)
}

pub(crate) fn processor() -> Processor {
    Processor::new(CoreContract::Accounts.name(), "Chain account ledger")
        .func(FUNC_DEPOSIT, deposit)
        .func(FUNC_WITHDRAW, withdraw)
        .func(FUNC_TRANSFER_ALLOWANCE_TO, transfer_allowance_to)
        .func(FUNC_FOUNDRY_CREATE_NEW, foundry_create_new)
        .func(FUNC_FOUNDRY_MODIFY_SUPPLY, foundry_modify_supply)
        .func(FUNC_FOUNDRY_DESTROY, foundry_destroy)
        .view(VIEW_BALANCE, view_balance)
        .view(VIEW_TOTAL_ASSETS, view_total_assets)
        .view(VIEW_ACCOUNT_NFTS, view_account_nfts)
        .view(VIEW_ACCOUNT_FOUNDRIES, view_account_foundries)
        .view(VIEW_NFT_DATA, view_nft_data)
        .view(VIEW_GET_ACCOUNT_NONCE, view_get_account_nonce)
        .view(VIEW_FOUNDRY_OUTPUT, view_foundry_output)
}
