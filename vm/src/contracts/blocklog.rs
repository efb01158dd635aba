//! The `blocklog` contract: read access to the log kept in
//! [`crate::blocklog`]. Only the VM writes to it.

use anchor_ledger::Packable;
use kv_state::codec::{decode_u32, encode_bool, encode_u32};
use kv_state::{Dict, KvDecodeError};

use super::{param_packed, param_with, CoreContract, Processor};
use crate::blocklog as bl;
use crate::error::{VmError, VmResult};
use crate::request::RequestId;
use crate::sandbox::ViewContext;

/// Info of a block; the latest when no index is given.
pub const VIEW_GET_BLOCK_INFO: &str = "get_block_info";
/// Receipt of a request.
pub const VIEW_GET_REQUEST_RECEIPT: &str = "get_request_receipt";
/// Receipts of a block.
pub const VIEW_GET_REQUEST_RECEIPTS_FOR_BLOCK: &str = "get_request_receipts_for_block";
/// Whether a request was processed.
pub const VIEW_IS_REQUEST_PROCESSED: &str = "is_request_processed";
/// Events of a request.
pub const VIEW_GET_EVENTS_FOR_REQUEST: &str = "get_events_for_request";
/// Events of a block.
pub const VIEW_GET_EVENTS_FOR_BLOCK: &str = "get_events_for_block";
/// Current controllers of the anchor.
pub const VIEW_CONTROL_ADDRESSES: &str = "control_addresses";

/// Index of a block.
pub const PARAM_BLOCK_INDEX: &str = "n";
/// Packed [`bl::BlockInfo`].
pub const PARAM_BLOCK_INFO: &str = "i";
/// Packed [`RequestId`].
pub const PARAM_REQUEST_ID: &str = "u";
/// Packed [`bl::RequestReceipt`].
pub const PARAM_RECEIPT: &str = "d";
/// Whether the request was processed.
pub const PARAM_REQUEST_PROCESSED: &str = "p";
/// Packed [`bl::ControlAddresses`].
pub const PARAM_CONTROL_ADDRESSES: &str = "c";

fn request_id(ctx: &ViewContext<'_>) -> VmResult<RequestId> {
    param_with(ctx.params(), PARAM_REQUEST_ID, |b| {
        RequestId::from_bytes(b).map_err(|_| KvDecodeError::Invalid("request id"))
    })
}

fn view_get_block_info(ctx: &ViewContext<'_>) -> VmResult<Dict> {
    let state = ctx.state_reader();
    let info = match ctx.params().get_ref(PARAM_BLOCK_INDEX.as_bytes()) {
        Some(raw) => bl::get_block_info(&state, decode_u32(raw)?)?,
        None => bl::get_latest_block_info(&state)?,
    }
    .ok_or_else(|| VmError::InvalidParam("block not found".into()))?;
    Ok(Dict::new()
        .with(PARAM_BLOCK_INDEX, encode_u32(info.block_index))
        .with(PARAM_BLOCK_INFO, info.to_bytes()))
}

fn view_get_request_receipt(ctx: &ViewContext<'_>) -> VmResult<Dict> {
    let id = request_id(ctx)?;
    Ok(match bl::get_request_receipt(&ctx.state_reader(), &id)? {
        Some(r) => Dict::new()
            .with(PARAM_BLOCK_INDEX, encode_u32(r.block_index))
            .with(PARAM_RECEIPT, r.to_bytes()),
        None => Dict::new(),
    })
}

fn view_get_request_receipts_for_block(ctx: &ViewContext<'_>) -> VmResult<Dict> {
    let block_index = param_with(ctx.params(), PARAM_BLOCK_INDEX, decode_u32)?;
    Ok(
        bl::get_request_receipts_for_block(&ctx.state_reader(), block_index)?
            .into_iter()
            .map(|r| (r.request_index.to_be_bytes().to_vec(), r.to_bytes()))
            .collect(),
    )
}

fn view_is_request_processed(ctx: &ViewContext<'_>) -> VmResult<Dict> {
    let id = request_id(ctx)?;
    let processed = bl::is_request_processed(&ctx.state_reader(), &id)?;
    Ok(Dict::new().with(PARAM_REQUEST_PROCESSED, encode_bool(processed)))
}

fn events_dict(events: Vec<String>) -> Dict {
    events
        .into_iter()
        .enumerate()
        .map(|(i, e)| ((i as u32).to_be_bytes().to_vec(), e.into_bytes()))
        .collect()
}

fn view_get_events_for_request(ctx: &ViewContext<'_>) -> VmResult<Dict> {
    let id = request_id(ctx)?;
    Ok(events_dict(bl::get_events_for_request(
        &ctx.state_reader(),
        &id,
    )?))
}

fn view_get_events_for_block(ctx: &ViewContext<'_>) -> VmResult<Dict> {
    let block_index = param_with(ctx.params(), PARAM_BLOCK_INDEX, decode_u32)?;
    Ok(events_dict(bl::get_events_for_block(
        &ctx.state_reader(),
        block_index,
    )))
}

fn view_control_addresses(ctx: &ViewContext<'_>) -> VmResult<Dict> {
    let addresses = bl::get_control_addresses(&ctx.state_reader())?
        .ok_or_else(|| VmError::Fatal("control addresses not set".into()))?;
    Ok(Dict::new().with(PARAM_CONTROL_ADDRESSES, addresses.to_bytes()))
}

/// Reads the result of `get_request_receipt`.
pub fn decode_receipt(result: &Dict) -> VmResult<Option<bl::RequestReceipt>> {
    match result.get_ref(PARAM_RECEIPT.as_bytes()) {
        Some(_) => param_packed(result, PARAM_RECEIPT).map(Some),
        None => Ok(None),
    }
}

/// Reads the event list returned by the event views.
pub fn decode_events(result: &Dict) -> Vec<String> {
    result
        .iter()
        .map(|(_, v)| String::from_utf8_lossy(v).into_owned())
        .collect()
}

pub(crate) fn processor() -> Processor {
    Processor::new(CoreContract::Blocklog.name(), "Block log")
        .view(VIEW_GET_BLOCK_INFO, view_get_block_info)
        .view(VIEW_GET_REQUEST_RECEIPT, view_get_request_receipt)
        .view(
            VIEW_GET_REQUEST_RECEIPTS_FOR_BLOCK,
            view_get_request_receipts_for_block,
        )
        .view(VIEW_IS_REQUEST_PROCESSED, view_is_request_processed)
        .view(VIEW_GET_EVENTS_FOR_REQUEST, view_get_events_for_request)
        .view(VIEW_GET_EVENTS_FOR_BLOCK, view_get_events_for_block)
        .view(VIEW_CONTROL_ADDRESSES, view_control_addresses)
}
