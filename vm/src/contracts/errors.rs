//! The `errors` contract: message templates registered by contracts.
//!
//! A contract registers a template once and gets back a [`VmErrorCode`];
//! failing with [`VmError::Custom`] then stores only the code and the
//! parameters in the receipt.

use kv_state::codec::{decode_or, decode_string, decode_u16, encode_u16};
use kv_state::kv::key_join;
use kv_state::{Dict, KvReader, KvWriter};

use super::{param_with, partition, CoreContract, Processor};
use crate::agent::AgentId;
use crate::error::{VmError, VmResult};
use crate::hname::Hname;
use crate::sandbox::{Sandbox, ViewContext};
use crate::vmerror::{UnresolvedVmError, VmErrorCode};

/// Registers a template for the calling contract.
pub const FUNC_REGISTER_ERROR: &str = "register_error";
/// The template of a code.
pub const VIEW_GET_ERROR_MESSAGE_FORMAT: &str = "get_error_message_format";

/// The template text.
pub const PARAM_ERROR_MESSAGE_FORMAT: &str = "m";
/// Six-byte error code.
pub const PARAM_ERROR_CODE: &str = "c";

/// Longest template accepted.
pub const MAX_TEMPLATE_LEN: usize = 1024;

const KEY_TEMPLATES: &[u8] = b"t";
const KEY_COUNTERS: &[u8] = b"n";

fn template_key(code: &VmErrorCode) -> Vec<u8> {
    key_join(&[KEY_TEMPLATES, &code.to_bytes()])
}

/// Stores `template` for `contract`. Registering the same text twice
/// yields the same code.
pub fn register_template<S: KvReader + KvWriter + ?Sized>(
    state: &mut S,
    contract: Hname,
    template: &str,
) -> VmResult<VmErrorCode> {
    let prefix = key_join(&[KEY_TEMPLATES, &contract.to_bytes()]);
    for (k, v) in state.entries(&prefix) {
        if v == template.as_bytes() {
            return Ok(VmErrorCode {
                contract,
                id: decode_u16(&k[prefix.len()..])?,
            });
        }
    }
    let counter_key = key_join(&[KEY_COUNTERS, &contract.to_bytes()]);
    let id = decode_or(state.get(&counter_key), 0, decode_u16)?;
    let next = id
        .checked_add(1)
        .ok_or_else(|| VmError::Generic(format!("contract {contract} has too many errors")))?;
    state.set(&counter_key, &encode_u16(next));
    let code = VmErrorCode { contract, id };
    state.set(&template_key(&code), template.as_bytes());
    Ok(code)
}

/// The template registered under `code`.
pub fn get_template<S: KvReader + ?Sized>(state: &S, code: &VmErrorCode) -> Option<String> {
    state
        .get(&template_key(code))
        .map(|b| String::from_utf8_lossy(&b).into_owned())
}

/// The message of a receipt error, looking contract templates up in the
/// whole chain `state`.
pub fn resolve_error<S: KvReader + ?Sized>(state: &S, err: &UnresolvedVmError) -> VmResult<String> {
    if let Some(msg) = err.resolve_core() {
        return Ok(msg);
    }
    let template = get_template(&partition(state, CoreContract::Errors.hname()), &err.code)
        .ok_or_else(|| VmError::InvalidParam(format!("unknown error code {}", err.code)))?;
    Ok(err.resolve_with(&template))
}

/// Registers `template` on behalf of the current contract.
pub fn register_error(ctx: &mut Sandbox<'_>, template: &str) -> VmResult<VmErrorCode> {
    let ret = ctx.call(
        CoreContract::Errors.hname(),
        Hname::from_name(FUNC_REGISTER_ERROR),
        Dict::new().with(PARAM_ERROR_MESSAGE_FORMAT, template),
        None,
    )?;
    decode_code(&ret)
}

fn decode_code(result: &Dict) -> VmResult<VmErrorCode> {
    param_with(result, PARAM_ERROR_CODE, VmErrorCode::from_bytes)
}

fn func_register_error(ctx: &mut Sandbox<'_>) -> VmResult<Dict> {
    let AgentId::Contract { chain_id, hname } = ctx.caller() else {
        return Err(VmError::Unauthorized);
    };
    if chain_id != ctx.chain_id() {
        return Err(VmError::Unauthorized);
    }
    let template = param_with(ctx.params(), PARAM_ERROR_MESSAGE_FORMAT, decode_string)?;
    ctx.require(
        !template.is_empty() && template.len() <= MAX_TEMPLATE_LEN,
        "error template length out of range",
    )?;
    let code = register_template(&mut ctx.state(), hname, &template)?;
    Ok(Dict::new().with(PARAM_ERROR_CODE, code.to_bytes()))
}

fn view_get_error_message_format(ctx: &ViewContext<'_>) -> VmResult<Dict> {
    let code = decode_code(ctx.params())?;
    let template = match code.contract.is_nil() {
        true => crate::vmerror::core_template(&code).map(str::to_string),
        false => get_template(&ctx.state_reader(), &code),
    }
    .ok_or_else(|| VmError::InvalidParam(format!("unknown error code {code}")))?;
    Ok(Dict::new().with(PARAM_ERROR_MESSAGE_FORMAT, template))
}

pub(crate) fn processor() -> Processor {
    Processor::new(CoreContract::Errors.name(), "Error templates")
        .func(FUNC_REGISTER_ERROR, func_register_error)
        .view(VIEW_GET_ERROR_MESSAGE_FORMAT, view_get_error_message_format)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn templates_are_numbered_per_contract() {
        let mut state = Dict::new();
        let a = Hname::from_name("a");
        let b = Hname::from_name("b");
        let first = register_template(&mut state, a, "too small: %v").unwrap();
        let second = register_template(&mut state, a, "too big: %v").unwrap();
        assert_eq!((first.id, second.id), (0, 1));
        assert_eq!(register_template(&mut state, a, "too small: %v").unwrap(), first);
        assert_eq!(register_template(&mut state, b, "other").unwrap().id, 0);
        assert_eq!(get_template(&state, &second).unwrap(), "too big: %v");
    }

    #[test]
    fn receipt_errors_resolve_against_the_chain() {
        let contract = Hname::from_name("inccounter");
        let mut chain = Dict::new();
        let code = register_template(
            &mut crate::contracts::partition_mut(&mut chain, CoreContract::Errors.hname()),
            contract,
            "counter at %v",
        )
        .unwrap();
        let err = UnresolvedVmError::new(code, vec!["7".into()]);
        assert_eq!(resolve_error(&chain, &err).unwrap(), "counter at 7");

        let core = VmError::Unauthorized.to_unresolved();
        assert_eq!(resolve_error(&chain, &core).unwrap(), "unauthorized access");

        let unknown = UnresolvedVmError::new(VmErrorCode { contract, id: 9 }, vec![]);
        assert!(resolve_error(&chain, &unknown).is_err());
    }
}
