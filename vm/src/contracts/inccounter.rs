//! `inccounter`: a small user program keeping a counter. Deployable on any
//! chain; used to exercise deployment, gas and error handling.

use ethereum_types::H256;
use kv_state::codec::{decode_i64, decode_or, decode_u64, encode_i64};
use kv_state::{Dict, KvReader, KvWriter};
use log::debug;

use super::{errors, param_or, param_with, Processor};
use crate::error::{VmError, VmResult};
use crate::sandbox::{Sandbox, ViewContext};
use crate::vmerror::{UnresolvedVmError, VmErrorCode};

/// Name the program is registered under.
pub const NAME: &str = "inccounter";

/// Adds to the counter.
pub const FUNC_INCREMENT: &str = "increment";
/// Burns the requested amount of gas.
pub const FUNC_SPEND_GAS: &str = "spend_gas";
/// Always fails with a registered error.
pub const FUNC_FAIL: &str = "fail";
/// The counter.
pub const VIEW_GET_COUNTER: &str = "get_counter";

/// Counter value or increment, 8 bytes.
pub const PARAM_COUNTER: &str = "counter";
/// Gas to burn.
pub const PARAM_GAS: &str = "gas";

const KEY_COUNTER: &[u8] = b"counter";
const KEY_FAIL_CODE: &[u8] = b"error";

/// Template of the error returned by `fail`.
pub const FAIL_TEMPLATE: &str = "counter refused at %v";

fn counter<S: KvReader + ?Sized>(state: &S) -> VmResult<i64> {
    Ok(decode_or(state.get(KEY_COUNTER), 0, decode_i64)?)
}

fn init(ctx: &mut Sandbox<'_>) -> VmResult<Dict> {
    let value = param_or(ctx.params(), PARAM_COUNTER, 0, decode_i64)?;
    let code = errors::register_error(ctx, FAIL_TEMPLATE)?;
    let mut state = ctx.state();
    state.set(KEY_COUNTER, &encode_i64(value));
    state.set(KEY_FAIL_CODE, &code.to_bytes());
    drop(state);
    ctx.event(format!("counter = {value}"))?;
    Ok(Dict::new())
}

fn increment(ctx: &mut Sandbox<'_>) -> VmResult<Dict> {
    let inc = param_or(ctx.params(), PARAM_COUNTER, 1, decode_i64)?;
    let value = counter(&ctx.state_reader())?;
    debug!("increasing counter {value} by {inc}");
    let next = value
        .checked_add(inc)
        .ok_or_else(|| VmError::Generic("counter overflow".into()))?;
    ctx.state().set(KEY_COUNTER, &encode_i64(next));
    Ok(Dict::new().with(PARAM_COUNTER, encode_i64(next)))
}

fn spend_gas(ctx: &mut Sandbox<'_>) -> VmResult<Dict> {
    let gas = param_with(ctx.params(), PARAM_GAS, decode_u64)?;
    ctx.burn_gas(gas)?;
    Ok(Dict::new())
}

fn fail(ctx: &mut Sandbox<'_>) -> VmResult<Dict> {
    let state = ctx.state_reader();
    let raw = state
        .get(KEY_FAIL_CODE)
        .ok_or_else(|| VmError::Generic("inccounter not initialized".into()))?;
    let code = VmErrorCode::from_bytes(&raw)?;
    let value = counter(&state)?;
    Err(VmError::Custom(UnresolvedVmError::new(
        code,
        vec![value.to_string()],
    )))
}

fn view_get_counter(ctx: &ViewContext<'_>) -> VmResult<Dict> {
    Ok(Dict::new().with(PARAM_COUNTER, encode_i64(counter(&ctx.state_reader())?)))
}

/// Reads the result of `get_counter`.
pub fn decode_counter(result: &Dict) -> VmResult<i64> {
    param_with(result, PARAM_COUNTER, decode_i64)
}

/// Program hash to deploy the counter with.
pub fn program_hash() -> H256 {
    processor().program_hash()
}

pub(crate) fn processor() -> Processor {
    Processor::new(NAME, "Increment counter")
        .func(super::FUNC_INIT, init)
        .func(FUNC_INCREMENT, increment)
        .func(FUNC_SPEND_GAS, spend_gas)
        .func(FUNC_FAIL, fail)
        .view(VIEW_GET_COUNTER, view_get_counter)
}
