//! The `governance` contract: chain owner, gas pricing and the addresses
//! allowed to control the anchor.

use anchor_ledger::{Address, Packable};
use kv_state::codec::encode_u32;
use kv_state::kv::key_join;
use kv_state::{Dict, KvReader, KvStore, KvWriter};
use tracing::info;

use super::{param, param_packed, CoreContract, Processor};
use crate::agent::AgentId;
use crate::error::{VmError, VmResult};
use crate::gas::{GasFeePolicy, GasLimits};
use crate::sandbox::{Sandbox, ViewContext};

/// Replaces the fee policy.
pub const FUNC_SET_FEE_POLICY: &str = "set_fee_policy";
/// Replaces the gas limits.
pub const FUNC_SET_GAS_LIMITS: &str = "set_gas_limits";
/// Names the next owner, who must claim.
pub const FUNC_DELEGATE_CHAIN_OWNERSHIP: &str = "delegate_chain_ownership";
/// Takes over a delegated ownership.
pub const FUNC_CLAIM_CHAIN_OWNERSHIP: &str = "claim_chain_ownership";
/// Allows an address to become state controller.
pub const FUNC_ADD_ALLOWED_STATE_CONTROLLER: &str = "add_allowed_state_controller_address";
/// Withdraws the permission.
pub const FUNC_REMOVE_ALLOWED_STATE_CONTROLLER: &str = "remove_allowed_state_controller_address";
/// Hands the anchor to another committee from the next block on.
pub const FUNC_ROTATE_STATE_CONTROLLER: &str = "rotate_state_controller";
/// The chain owner.
pub const VIEW_GET_CHAIN_OWNER: &str = "get_chain_owner";
/// The fee policy.
pub const VIEW_GET_FEE_POLICY: &str = "get_fee_policy";
/// The gas limits.
pub const VIEW_GET_GAS_LIMITS: &str = "get_gas_limits";
/// Addresses allowed as state controller.
pub const VIEW_GET_ALLOWED_STATE_CONTROLLERS: &str = "get_allowed_state_controller_addresses";
/// Chain id, owner, fee policy and gas limits at once.
pub const VIEW_GET_CHAIN_INFO: &str = "get_chain_info";

/// Packed [`AgentId`] of an owner.
pub const PARAM_CHAIN_OWNER: &str = "o";
/// Packed [`Address`].
pub const PARAM_STATE_CONTROLLER: &str = "a";
/// Stored form of a [`GasFeePolicy`].
pub const PARAM_FEE_POLICY: &str = "fp";
/// Stored form of [`GasLimits`].
pub const PARAM_GAS_LIMITS: &str = "gl";
/// Chain id bytes.
pub const PARAM_CHAIN_ID: &str = "c";

const KEY_OWNER: &[u8] = b"o";
const KEY_OWNER_DELEGATED: &[u8] = b"d";
const KEY_FEE_POLICY: &[u8] = b"f";
const KEY_GAS_LIMITS: &[u8] = b"g";
const KEY_ALLOWED_STATE_CONTROLLERS: &[u8] = b"a";

/// Stores the settings of a new chain.
pub fn init_state<S: KvStore + ?Sized>(
    state: &mut S,
    owner: &AgentId,
    fee_policy: &GasFeePolicy,
    gas_limits: &GasLimits,
) {
    state.set(KEY_OWNER, &owner.to_bytes());
    state.set(KEY_FEE_POLICY, &fee_policy.to_bytes());
    state.set(KEY_GAS_LIMITS, &gas_limits.to_bytes());
}

/// The chain owner.
pub fn chain_owner<S: KvReader + ?Sized>(state: &S) -> VmResult<AgentId> {
    let raw = state
        .get(KEY_OWNER)
        .ok_or_else(|| VmError::Fatal("chain owner not set".into()))?;
    Ok(AgentId::from_bytes(&raw)?)
}

/// The fee policy; the default one before origin.
pub fn fee_policy<S: KvReader + ?Sized>(state: &S) -> VmResult<GasFeePolicy> {
    match state.get(KEY_FEE_POLICY) {
        Some(b) => Ok(GasFeePolicy::from_bytes(&b)?),
        None => Ok(GasFeePolicy::default()),
    }
}

/// The gas limits; the default ones before origin.
pub fn gas_limits<S: KvReader + ?Sized>(state: &S) -> VmResult<GasLimits> {
    match state.get(KEY_GAS_LIMITS) {
        Some(b) => Ok(GasLimits::from_bytes(&b)?),
        None => Ok(GasLimits::default()),
    }
}

fn allowed_key(addr: &Address) -> Vec<u8> {
    key_join(&[KEY_ALLOWED_STATE_CONTROLLERS, &addr.to_bytes()])
}

/// Addresses allowed as state controller, in byte order.
pub fn allowed_state_controllers<S: KvReader + ?Sized>(state: &S) -> VmResult<Vec<Address>> {
    let mut ret = Vec::new();
    for (k, _) in state.entries(KEY_ALLOWED_STATE_CONTROLLERS) {
        ret.push(Address::from_bytes(&k[KEY_ALLOWED_STATE_CONTROLLERS.len()..])?);
    }
    Ok(ret)
}

fn require_owner(ctx: &Sandbox<'_>) -> VmResult<()> {
    let owner = chain_owner(&ctx.state_reader())?;
    ctx.require_caller(&owner)
}

fn set_fee_policy(ctx: &mut Sandbox<'_>) -> VmResult<Dict> {
    require_owner(ctx)?;
    let raw = param(ctx.params(), PARAM_FEE_POLICY)?;
    let policy = GasFeePolicy::from_bytes(&raw)
        .map_err(|e| VmError::InvalidParam(format!("{PARAM_FEE_POLICY}: {e}")))?;
    ctx.state().set(KEY_FEE_POLICY, &policy.to_bytes());
    Ok(Dict::new())
}

fn set_gas_limits(ctx: &mut Sandbox<'_>) -> VmResult<Dict> {
    require_owner(ctx)?;
    let raw = param(ctx.params(), PARAM_GAS_LIMITS)?;
    let limits = GasLimits::from_bytes(&raw)
        .map_err(|e| VmError::InvalidParam(format!("{PARAM_GAS_LIMITS}: {e}")))?;
    ctx.require(
        limits.max_gas_per_request > 0 && limits.max_gas_per_request <= limits.max_gas_per_block,
        "gas limits out of range",
    )?;
    ctx.state().set(KEY_GAS_LIMITS, &limits.to_bytes());
    Ok(Dict::new())
}

fn delegate_chain_ownership(ctx: &mut Sandbox<'_>) -> VmResult<Dict> {
    require_owner(ctx)?;
    let next: AgentId = param_packed(ctx.params(), PARAM_CHAIN_OWNER)?;
    ctx.state().set(KEY_OWNER_DELEGATED, &next.to_bytes());
    Ok(Dict::new())
}

fn claim_chain_ownership(ctx: &mut Sandbox<'_>) -> VmResult<Dict> {
    let delegated = ctx
        .state_reader()
        .get(KEY_OWNER_DELEGATED)
        .map(|b| AgentId::from_bytes(&b))
        .transpose()?
        .ok_or(VmError::Unauthorized)?;
    ctx.require_caller(&delegated)?;
    let mut state = ctx.state();
    state.set(KEY_OWNER, &delegated.to_bytes());
    state.del(KEY_OWNER_DELEGATED);
    drop(state);
    ctx.event(format!("chain owner is now {delegated}"))?;
    Ok(Dict::new())
}

fn add_allowed_state_controller(ctx: &mut Sandbox<'_>) -> VmResult<Dict> {
    require_owner(ctx)?;
    let addr: Address = param_packed(ctx.params(), PARAM_STATE_CONTROLLER)?;
    ctx.state().set(&allowed_key(&addr), &[]);
    Ok(Dict::new())
}

fn remove_allowed_state_controller(ctx: &mut Sandbox<'_>) -> VmResult<Dict> {
    require_owner(ctx)?;
    let addr: Address = param_packed(ctx.params(), PARAM_STATE_CONTROLLER)?;
    ctx.state().del(&allowed_key(&addr));
    Ok(Dict::new())
}

fn rotate_state_controller(ctx: &mut Sandbox<'_>) -> VmResult<Dict> {
    require_owner(ctx)?;
    let addr: Address = param_packed(ctx.params(), PARAM_STATE_CONTROLLER)?;
    if !ctx.state_reader().has(&allowed_key(&addr)) {
        return Err(VmError::InvalidParam(format!(
            "{addr} is not an allowed state controller"
        )));
    }
    ctx.rotate_state_controller(addr)?;
    info!(
        state_controller = %addr,
        block_index = ctx.block_index(),
        "rotating state controller"
    );
    ctx.event(format!("rotate to {addr}"))?;
    Ok(Dict::new())
}

fn view_get_chain_owner(ctx: &ViewContext<'_>) -> VmResult<Dict> {
    Ok(Dict::new().with(PARAM_CHAIN_OWNER, chain_owner(&ctx.state_reader())?.to_bytes()))
}

fn view_get_fee_policy(ctx: &ViewContext<'_>) -> VmResult<Dict> {
    Ok(Dict::new().with(PARAM_FEE_POLICY, fee_policy(&ctx.state_reader())?.to_bytes()))
}

fn view_get_gas_limits(ctx: &ViewContext<'_>) -> VmResult<Dict> {
    Ok(Dict::new().with(PARAM_GAS_LIMITS, gas_limits(&ctx.state_reader())?.to_bytes()))
}

fn view_get_allowed_state_controllers(ctx: &ViewContext<'_>) -> VmResult<Dict> {
    Ok(allowed_state_controllers(&ctx.state_reader())?
        .into_iter()
        .enumerate()
        .map(|(i, a)| (encode_u32(i as u32), a.to_bytes()))
        .collect())
}

fn view_get_chain_info(ctx: &ViewContext<'_>) -> VmResult<Dict> {
    let state = ctx.state_reader();
    Ok(Dict::new()
        .with(PARAM_CHAIN_ID, ctx.chain_id().as_bytes())
        .with(PARAM_CHAIN_OWNER, chain_owner(&state)?.to_bytes())
        .with(PARAM_FEE_POLICY, fee_policy(&state)?.to_bytes())
        .with(PARAM_GAS_LIMITS, gas_limits(&state)?.to_bytes()))
}

pub(crate) fn processor() -> Processor {
    Processor::new(CoreContract::Governance.name(), "Governance contract")
        .func(FUNC_SET_FEE_POLICY, set_fee_policy)
        .func(FUNC_SET_GAS_LIMITS, set_gas_limits)
        .func(FUNC_DELEGATE_CHAIN_OWNERSHIP, delegate_chain_ownership)
        .func(FUNC_CLAIM_CHAIN_OWNERSHIP, claim_chain_ownership)
        .func(FUNC_ADD_ALLOWED_STATE_CONTROLLER, add_allowed_state_controller)
        .func(FUNC_REMOVE_ALLOWED_STATE_CONTROLLER, remove_allowed_state_controller)
        .func(FUNC_ROTATE_STATE_CONTROLLER, rotate_state_controller)
        .view(VIEW_GET_CHAIN_OWNER, view_get_chain_owner)
        .view(VIEW_GET_FEE_POLICY, view_get_fee_policy)
        .view(VIEW_GET_GAS_LIMITS, view_get_gas_limits)
        .view(VIEW_GET_ALLOWED_STATE_CONTROLLERS, view_get_allowed_state_controllers)
        .view(VIEW_GET_CHAIN_INFO, view_get_chain_info)
}
