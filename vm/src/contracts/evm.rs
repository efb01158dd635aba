//! The `evm` contract: entry points over the emulator in [`crate::evm`].
//!
//! The partition of the contract holds the EVM accounts under
//! [`crate::evm::emulator::STATE_PREFIX`] and the emulated blocks beside
//! them. Base tokens moved into the EVM stay in the account of this
//! contract on the L2 ledger and appear as wei on the EVM side.

use anchor_common::{base_tokens_to_wei, DEFAULT_EVM_CHAIN_ID};
use ethereum_types::{H160, H256};
use kv_state::codec::{decode_or, decode_u16, decode_u64, encode_u16, encode_u256, encode_u64};
use kv_state::{Dict, KvReader, KvStore, KvWriter};
use tracing::debug;

use super::{param, param_with, CoreContract, Processor};
use crate::error::{VmError, VmResult};
use crate::evm::{BlockChainDb, EvmBlock, EvmEmulator, EvmReceipt, EvmTransaction};
use crate::gas::BurnCode;
use crate::sandbox::{Sandbox, ViewContext};

/// Applies an RLP-encoded EVM transaction sent by the caller.
pub const FUNC_SEND_TRANSACTION: &str = "send_transaction";
/// Moves base tokens of the allowance to an EVM account.
pub const FUNC_FUND: &str = "fund";
/// Wei balance of an EVM account.
pub const VIEW_GET_BALANCE: &str = "get_balance";
/// Nonce of an EVM account.
pub const VIEW_GET_NONCE: &str = "get_nonce";
/// Code of an EVM account.
pub const VIEW_GET_CODE: &str = "get_code";
/// A storage slot of an EVM contract.
pub const VIEW_GET_STORAGE_AT: &str = "get_storage_at";
/// Number of the latest minted EVM block.
pub const VIEW_BLOCK_NUMBER: &str = "block_number";
/// A minted block by number.
pub const VIEW_GET_BLOCK_BY_NUMBER: &str = "get_block_by_number";
/// A minted block by hash.
pub const VIEW_GET_BLOCK_BY_HASH: &str = "get_block_by_hash";
/// Receipt of a minted transaction.
pub const VIEW_GET_TRANSACTION_RECEIPT: &str = "get_transaction_receipt";
/// The EVM chain id.
pub const VIEW_GET_CHAIN_ID: &str = "get_chain_id";

/// RLP-encoded transaction.
pub const PARAM_TRANSACTION: &str = "tx";
/// 20-byte EVM address.
pub const PARAM_ADDRESS: &str = "a";
/// 32-byte storage key.
pub const PARAM_KEY: &str = "k";
/// 32-byte hash of a block or transaction.
pub const PARAM_HASH: &str = "h";
/// Block number, 8 bytes.
pub const PARAM_BLOCK_NUMBER: &str = "n";
/// Result value.
pub const PARAM_RESULT: &str = "r";

const KEY_CHAIN_ID: &[u8] = b"i";

/// Stores block 0 of the EVM chain.
pub fn init_state<S: KvStore + ?Sized>(state: &mut S, timestamp: u64) {
    state.set(KEY_CHAIN_ID, &encode_u16(DEFAULT_EVM_CHAIN_ID));
    BlockChainDb::new(state).init(timestamp);
}

/// Mints the EVM block of L2 block `block_index`. Called once per block,
/// after the last request.
pub fn mint_block<S: KvStore + ?Sized>(
    state: &mut S,
    block_index: u32,
    timestamp: u64,
) -> VmResult<EvmBlock> {
    Ok(BlockChainDb::new(state).mint(block_index as u64, timestamp)?)
}

fn address_param(params: &Dict, key: &str) -> VmResult<H160> {
    let raw = param(params, key)?;
    match raw.len() {
        20 => Ok(H160::from_slice(&raw)),
        n => Err(VmError::InvalidParam(format!("{key}: {n} bytes"))),
    }
}

fn hash_param(params: &Dict, key: &str) -> VmResult<H256> {
    let raw = param(params, key)?;
    match raw.len() {
        32 => Ok(H256::from_slice(&raw)),
        n => Err(VmError::InvalidParam(format!("{key}: {n} bytes"))),
    }
}

fn send_transaction(ctx: &mut Sandbox<'_>) -> VmResult<Dict> {
    let raw = param(ctx.params(), PARAM_TRANSACTION)?;
    let tx: EvmTransaction = rlp::decode(&raw)
        .map_err(|e| VmError::InvalidParam(format!("{PARAM_TRANSACTION}: {e}")))?;
    ctx.require(
        tx.gas_limit <= ctx.gas_budget() - ctx.gas_burned(),
        "EVM gas limit above the remaining budget",
    )?;
    let from = ctx.caller().eth_address();
    let (block_number, timestamp) = (ctx.block_index() as u64, ctx.timestamp());
    let receipt =
        EvmEmulator::new(ctx.state()).send_transaction(from, tx, block_number, timestamp)?;
    ctx.burn(BurnCode::EvmGas, receipt.gas_used)?;
    debug!(
        tx = ?receipt.tx_hash,
        gas_used = receipt.gas_used,
        "EVM transaction applied"
    );
    Ok(Dict::new().with(PARAM_RESULT, rlp::encode(&receipt)))
}

fn fund(ctx: &mut Sandbox<'_>) -> VmResult<Dict> {
    let target = match ctx.params().get_ref(PARAM_ADDRESS.as_bytes()) {
        Some(_) => address_param(ctx.params(), PARAM_ADDRESS)?,
        None => ctx.caller().eth_address(),
    };
    let allowance = ctx.take_allowance()?;
    ctx.require(
        allowance.nfts.is_empty() && allowance.assets.native_tokens.is_empty(),
        "only base tokens can be moved to the EVM",
    )?;
    ctx.require(allowance.assets.base_tokens > 0, "nothing to fund")?;
    EvmEmulator::new(ctx.state())
        .state_mut()
        .add_balance(&target, base_tokens_to_wei(allowance.assets.base_tokens))?;
    Ok(Dict::new())
}

fn view_get_balance(ctx: &ViewContext<'_>) -> VmResult<Dict> {
    let addr = address_param(ctx.params(), PARAM_ADDRESS)?;
    let balance = EvmEmulator::new(ctx.state_reader()).state().get_balance(&addr)?;
    Ok(Dict::new().with(PARAM_RESULT, encode_u256(&balance)))
}

fn view_get_nonce(ctx: &ViewContext<'_>) -> VmResult<Dict> {
    let addr = address_param(ctx.params(), PARAM_ADDRESS)?;
    let nonce = EvmEmulator::new(ctx.state_reader()).state().get_nonce(&addr)?;
    Ok(Dict::new().with(PARAM_RESULT, encode_u64(nonce)))
}

fn view_get_code(ctx: &ViewContext<'_>) -> VmResult<Dict> {
    let addr = address_param(ctx.params(), PARAM_ADDRESS)?;
    let code = EvmEmulator::new(ctx.state_reader()).state().get_code(&addr);
    Ok(Dict::new().with(PARAM_RESULT, code))
}

fn view_get_storage_at(ctx: &ViewContext<'_>) -> VmResult<Dict> {
    let addr = address_param(ctx.params(), PARAM_ADDRESS)?;
    let key = hash_param(ctx.params(), PARAM_KEY)?;
    let value = EvmEmulator::new(ctx.state_reader())
        .state()
        .get_state(&addr, &key);
    Ok(Dict::new().with(PARAM_RESULT, value.as_bytes()))
}

fn view_block_number(ctx: &ViewContext<'_>) -> VmResult<Dict> {
    let n = BlockChainDb::new(ctx.state_reader()).block_number()?;
    Ok(Dict::new().with(PARAM_RESULT, encode_u64(n)))
}

fn block_result(block: Option<EvmBlock>) -> Dict {
    match block {
        Some(b) => Dict::new().with(PARAM_RESULT, rlp::encode(&b)),
        None => Dict::new(),
    }
}

fn view_get_block_by_number(ctx: &ViewContext<'_>) -> VmResult<Dict> {
    let n = param_with(ctx.params(), PARAM_BLOCK_NUMBER, decode_u64)?;
    Ok(block_result(
        BlockChainDb::new(ctx.state_reader()).block_by_number(n)?,
    ))
}

fn view_get_block_by_hash(ctx: &ViewContext<'_>) -> VmResult<Dict> {
    let hash = hash_param(ctx.params(), PARAM_HASH)?;
    Ok(block_result(
        BlockChainDb::new(ctx.state_reader()).block_by_hash(&hash)?,
    ))
}

fn view_get_transaction_receipt(ctx: &ViewContext<'_>) -> VmResult<Dict> {
    let hash = hash_param(ctx.params(), PARAM_HASH)?;
    Ok(
        match BlockChainDb::new(ctx.state_reader()).receipt(&hash)? {
            Some(r) => Dict::new().with(PARAM_RESULT, rlp::encode(&r)),
            None => Dict::new(),
        },
    )
}

fn view_get_chain_id(ctx: &ViewContext<'_>) -> VmResult<Dict> {
    let id = decode_or(
        ctx.state_reader().get(KEY_CHAIN_ID),
        DEFAULT_EVM_CHAIN_ID,
        decode_u16,
    )?;
    Ok(Dict::new().with(PARAM_RESULT, encode_u16(id)))
}

/// Reads the receipt returned by `send_transaction` or
/// `get_transaction_receipt`.
pub fn decode_receipt(result: &Dict) -> VmResult<Option<EvmReceipt>> {
    result
        .get_ref(PARAM_RESULT.as_bytes())
        .map(|b| rlp::decode(b).map_err(|e| VmError::InvalidParam(e.to_string())))
        .transpose()
}

pub(crate) fn processor() -> Processor {
    Processor::new(CoreContract::Evm.name(), "EVM emulator")
        .func(FUNC_SEND_TRANSACTION, send_transaction)
        .func(FUNC_FUND, fund)
        .view(VIEW_GET_BALANCE, view_get_balance)
        .view(VIEW_GET_NONCE, view_get_nonce)
        .view(VIEW_GET_CODE, view_get_code)
        .view(VIEW_GET_STORAGE_AT, view_get_storage_at)
        .view(VIEW_BLOCK_NUMBER, view_block_number)
        .view(VIEW_GET_BLOCK_BY_NUMBER, view_get_block_by_number)
        .view(VIEW_GET_BLOCK_BY_HASH, view_get_block_by_hash)
        .view(VIEW_GET_TRANSACTION_RECEIPT, view_get_transaction_receipt)
        .view(VIEW_GET_CHAIN_ID, view_get_chain_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_block_then_minting() {
        let mut state = Dict::new();
        init_state(&mut state, 100);
        let chain = BlockChainDb::new(&state);
        assert_eq!(chain.block_number().unwrap(), 0);

        let block = mint_block(&mut state, 1, 90).unwrap();
        assert_eq!(block.header.number, 1);
        // Block time never goes back.
        assert_eq!(block.header.timestamp, 100);
        assert!(block.transactions.is_empty());
        assert_eq!(BlockChainDb::new(&state).block_number().unwrap(), 1);
    }
}
