//! The log of blocks, request receipts and events of a chain.
//!
//! Layout, relative to the partition of the `blocklog` contract:
//!
//! | key                                   | value                          |
//! |---------------------------------------|--------------------------------|
//! | array `b`                             | [`BlockInfo`] per block        |
//! | `l` ++ request lookup key             | list of `(block, request)`     |
//! | `r` ++ block BE ++ request BE         | [`RequestReceipt`]             |
//! | `e` ++ block BE ++ request BE ++ i BE | event message                  |
//! | array `c`                             | [`ControlAddresses`] history   |
//!
//! The lookup key of a request is a short digest of its id, so several
//! requests may share it; the list is scanned for the exact id.

use anchor_ledger::codec::{read_array, read_u16, read_u32, read_u64, read_u8};
use anchor_ledger::{Address, CodecError, CodecResult, OutputId, Packable, TransactionId};
use bytes::{Buf, BufMut};
use kv_state::collections::KvArray;
use kv_state::kv::key_join;
use kv_state::{KvReader, KvStore, L1Commitment};
use serde::{Deserialize, Serialize};

use crate::error::{VmError, VmResult};
use crate::request::{Request, RequestId};
use crate::vmerror::UnresolvedVmError;

const ARRAY_BLOCKS: &[u8] = b"b";
const ARRAY_CONTROL_ADDRESSES: &[u8] = b"c";
const KEY_LOOKUP: &[u8] = b"l";
const KEY_RECEIPTS: &[u8] = b"r";
const KEY_EVENTS: &[u8] = b"e";

/// What the chain recorded about a block.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct BlockInfo {
    /// Index of the block; equals the state index of its anchor.
    pub block_index: u32,
    /// Seconds since the epoch when the block was produced.
    pub timestamp: u64,
    /// The anchor consumed by the block.
    pub previous_anchor: OutputId,
    /// State commitment carried by that anchor.
    pub previous_l1_commitment: L1Commitment,
    /// Requests in the batch.
    pub total_requests: u16,
    /// Requests that did not fail.
    pub successful_requests: u16,
    /// Off-ledger requests in the batch.
    pub off_ledger_requests: u16,
    /// Gas burned by all requests.
    pub gas_burned: u64,
    /// Fees charged for it.
    pub gas_fee_charged: u64,
}

impl BlockInfo {
    /// The anchor transaction of the previous block.
    pub fn previous_anchor_tx(&self) -> TransactionId {
        self.previous_anchor.transaction_id
    }
}

impl Packable for BlockInfo {
    fn pack<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.block_index);
        buf.put_u64_le(self.timestamp);
        self.previous_anchor.pack(buf);
        buf.put_slice(self.previous_l1_commitment.0.as_bytes());
        buf.put_u16_le(self.total_requests);
        buf.put_u16_le(self.successful_requests);
        buf.put_u16_le(self.off_ledger_requests);
        buf.put_u64_le(self.gas_burned);
        buf.put_u64_le(self.gas_fee_charged);
    }

    fn unpack<B: Buf>(buf: &mut B) -> CodecResult<Self> {
        Ok(Self {
            block_index: read_u32(buf)?,
            timestamp: read_u64(buf)?,
            previous_anchor: OutputId::unpack(buf)?,
            previous_l1_commitment: L1Commitment(read_array::<_, 32>(buf)?.into()),
            total_requests: read_u16(buf)?,
            successful_requests: read_u16(buf)?,
            off_ledger_requests: read_u16(buf)?,
            gas_burned: read_u64(buf)?,
            gas_fee_charged: read_u64(buf)?,
        })
    }
}

/// The outcome of one request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RequestReceipt {
    /// The request.
    pub request: Request,
    /// Why it failed, if it did.
    pub error: Option<UnresolvedVmError>,
    /// Gas the sender allowed.
    pub gas_budget: u64,
    /// Gas burned.
    pub gas_burned: u64,
    /// Fee charged in base tokens.
    pub gas_fee_charged: u64,
    /// Block that processed the request.
    pub block_index: u32,
    /// Position of the request in the batch.
    pub request_index: u16,
}

impl RequestReceipt {
    /// Whether the request succeeded.
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

impl Packable for RequestReceipt {
    fn pack<B: BufMut>(&self, buf: &mut B) {
        self.request.pack(buf);
        match &self.error {
            Some(e) => {
                buf.put_u8(1);
                e.pack(buf);
            }
            None => buf.put_u8(0),
        }
        buf.put_u64_le(self.gas_budget);
        buf.put_u64_le(self.gas_burned);
        buf.put_u64_le(self.gas_fee_charged);
        buf.put_u32_le(self.block_index);
        buf.put_u16_le(self.request_index);
    }

    fn unpack<B: Buf>(buf: &mut B) -> CodecResult<Self> {
        let request = Request::unpack(buf)?;
        let error = match read_u8(buf)? {
            0 => None,
            1 => Some(UnresolvedVmError::unpack(buf)?),
            kind => {
                return Err(CodecError::UnknownKind {
                    what: "receipt error flag",
                    kind,
                })
            }
        };
        Ok(Self {
            request,
            error,
            gas_budget: read_u64(buf)?,
            gas_burned: read_u64(buf)?,
            gas_fee_charged: read_u64(buf)?,
            block_index: read_u32(buf)?,
            request_index: read_u16(buf)?,
        })
    }
}

/// Controllers of the anchor from a block on.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct ControlAddresses {
    /// Signs anchor state transitions.
    pub state_controller: Address,
    /// Governs the alias output.
    pub governor: Address,
    /// First block produced under these controllers.
    pub since_block_index: u32,
}

impl Packable for ControlAddresses {
    fn pack<B: BufMut>(&self, buf: &mut B) {
        self.state_controller.pack(buf);
        self.governor.pack(buf);
        buf.put_u32_le(self.since_block_index);
    }

    fn unpack<B: Buf>(buf: &mut B) -> CodecResult<Self> {
        Ok(Self {
            state_controller: Address::unpack(buf)?,
            governor: Address::unpack(buf)?,
            since_block_index: read_u32(buf)?,
        })
    }
}

fn receipt_key(block_index: u32, request_index: u16) -> Vec<u8> {
    key_join(&[
        KEY_RECEIPTS,
        &block_index.to_be_bytes(),
        &request_index.to_be_bytes(),
    ])
}

fn lookup_key(id: &RequestId) -> Vec<u8> {
    key_join(&[KEY_LOOKUP, &id.lookup_key()])
}

fn read_lookup_list(b: &[u8]) -> VmResult<Vec<(u32, u16)>> {
    if b.len() % 6 != 0 {
        return Err(VmError::Fatal("corrupted request lookup list".into()));
    }
    Ok(b.chunks_exact(6)
        .map(|c| {
            (
                u32::from_be_bytes([c[0], c[1], c[2], c[3]]),
                u16::from_be_bytes([c[4], c[5]]),
            )
        })
        .collect())
}

/// Appends the info of a block. Its index in the array must equal its
/// block index.
pub fn save_block_info<S: KvStore + ?Sized>(state: &mut S, info: &BlockInfo) -> VmResult<()> {
    let mut blocks = KvArray::new(&mut *state, ARRAY_BLOCKS);
    let index = blocks.push(&info.to_bytes())?;
    if index != info.block_index {
        return Err(VmError::Fatal(format!(
            "block info {} stored at index {index}",
            info.block_index
        )));
    }
    Ok(())
}

/// The info of block `block_index`.
pub fn get_block_info<S: KvReader + ?Sized>(
    state: &S,
    block_index: u32,
) -> VmResult<Option<BlockInfo>> {
    KvArray::new(state, ARRAY_BLOCKS)
        .get_at(block_index)?
        .map(|b| BlockInfo::from_bytes(&b))
        .transpose()
        .map_err(Into::into)
}

/// Index of the latest block; `None` before the origin block is logged.
pub fn latest_block_index<S: KvReader + ?Sized>(state: &S) -> VmResult<Option<u32>> {
    Ok(KvArray::new(state, ARRAY_BLOCKS).len()?.checked_sub(1))
}

/// The info of the latest block.
pub fn get_latest_block_info<S: KvReader + ?Sized>(state: &S) -> VmResult<Option<BlockInfo>> {
    match latest_block_index(state)? {
        Some(i) => get_block_info(state, i),
        None => Ok(None),
    }
}

/// Id of the anchor transaction produced by block `block_index`, as known
/// from the block that consumed it.
pub fn anchor_tx_id<S: KvReader + ?Sized>(
    state: &S,
    block_index: u32,
) -> VmResult<Option<TransactionId>> {
    Ok(get_block_info(state, block_index + 1)?.map(|b| b.previous_anchor_tx()))
}

/// Stores the receipt of a request and indexes it by request id.
pub fn save_receipt<S: KvStore + ?Sized>(state: &mut S, receipt: &RequestReceipt) -> VmResult<()> {
    let lk = lookup_key(&receipt.request.id());
    let mut list = state.get(&lk).unwrap_or_default();
    list.extend_from_slice(&receipt.block_index.to_be_bytes());
    list.extend_from_slice(&receipt.request_index.to_be_bytes());
    state.set(&lk, &list);
    state.set(
        &receipt_key(receipt.block_index, receipt.request_index),
        &receipt.to_bytes(),
    );
    Ok(())
}

fn receipt_at<S: KvReader + ?Sized>(
    state: &S,
    block_index: u32,
    request_index: u16,
) -> VmResult<Option<RequestReceipt>> {
    state
        .get(&receipt_key(block_index, request_index))
        .map(|b| RequestReceipt::from_bytes(&b))
        .transpose()
        .map_err(Into::into)
}

/// The receipt of request `id`.
pub fn get_request_receipt<S: KvReader + ?Sized>(
    state: &S,
    id: &RequestId,
) -> VmResult<Option<RequestReceipt>> {
    let Some(list) = state.get(&lookup_key(id)) else {
        return Ok(None);
    };
    for (block_index, request_index) in read_lookup_list(&list)? {
        match receipt_at(state, block_index, request_index)? {
            Some(r) if r.request.id() == *id => return Ok(Some(r)),
            _ => {}
        }
    }
    Ok(None)
}

/// Whether request `id` was processed by some block.
pub fn is_request_processed<S: KvReader + ?Sized>(state: &S, id: &RequestId) -> VmResult<bool> {
    Ok(get_request_receipt(state, id)?.is_some())
}

/// Receipts of block `block_index`, in batch order.
pub fn get_request_receipts_for_block<S: KvReader + ?Sized>(
    state: &S,
    block_index: u32,
) -> VmResult<Vec<RequestReceipt>> {
    state
        .entries(&key_join(&[KEY_RECEIPTS, &block_index.to_be_bytes()]))
        .into_iter()
        .map(|(_, v)| RequestReceipt::from_bytes(&v).map_err(Into::into))
        .collect()
}

/// Stores the events of a request.
pub fn save_events<S: KvStore + ?Sized>(
    state: &mut S,
    block_index: u32,
    request_index: u16,
    events: &[String],
) {
    for (i, msg) in events.iter().enumerate() {
        state.set(
            &key_join(&[
                KEY_EVENTS,
                &block_index.to_be_bytes(),
                &request_index.to_be_bytes(),
                &(i as u16).to_be_bytes(),
            ]),
            msg.as_bytes(),
        );
    }
}

fn events_under<S: KvReader + ?Sized>(state: &S, prefix: &[u8]) -> Vec<String> {
    state
        .entries(prefix)
        .into_iter()
        .map(|(_, v)| String::from_utf8_lossy(&v).into_owned())
        .collect()
}

/// Events emitted by request `id`.
pub fn get_events_for_request<S: KvReader + ?Sized>(
    state: &S,
    id: &RequestId,
) -> VmResult<Vec<String>> {
    let Some(r) = get_request_receipt(state, id)? else {
        return Ok(Vec::new());
    };
    Ok(events_under(
        state,
        &key_join(&[
            KEY_EVENTS,
            &r.block_index.to_be_bytes(),
            &r.request_index.to_be_bytes(),
        ]),
    ))
}

/// Events emitted in block `block_index`, in emission order.
pub fn get_events_for_block<S: KvReader + ?Sized>(state: &S, block_index: u32) -> Vec<String> {
    events_under(state, &key_join(&[KEY_EVENTS, &block_index.to_be_bytes()]))
}

/// Records new controllers of the anchor. Nothing is stored when they do
/// not change.
pub fn save_control_addresses<S: KvStore + ?Sized>(
    state: &mut S,
    addresses: &ControlAddresses,
) -> VmResult<()> {
    if let Some(current) = get_control_addresses(&*state)? {
        if current.state_controller == addresses.state_controller
            && current.governor == addresses.governor
        {
            return Ok(());
        }
    }
    KvArray::new(&mut *state, ARRAY_CONTROL_ADDRESSES).push(&addresses.to_bytes())?;
    Ok(())
}

/// The current controllers of the anchor.
pub fn get_control_addresses<S: KvReader + ?Sized>(
    state: &S,
) -> VmResult<Option<ControlAddresses>> {
    let arr = KvArray::new(state, ARRAY_CONTROL_ADDRESSES);
    let Some(last) = arr.len()?.checked_sub(1) else {
        return Ok(None);
    };
    arr.get_at(last)?
        .map(|b| ControlAddresses::from_bytes(&b))
        .transpose()
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use anchor_ledger::{
        make_basic_output, AliasId, Ed25519Address, FungibleTokens, RentStructure, SendOptions,
    };
    use ethereum_types::H256;
    use kv_state::Dict;

    use super::*;
    use crate::request::OnLedgerRequest;
    use crate::vmerror::core_errors;

    fn request(tx: u8, index: u16) -> Request {
        let target = Address::Alias(AliasId([1; 32]));
        let output = make_basic_output(
            target,
            None,
            &FungibleTokens::with_base_tokens(1_000_000),
            None,
            SendOptions::default(),
            &RentStructure::default(),
            true,
        );
        let id = OutputId::new(TransactionId::from([tx; 32]), index);
        Request::OnLedger(OnLedgerRequest::from_output(id, output.into()).unwrap())
    }

    fn receipt(req: Request, block_index: u32, request_index: u16) -> RequestReceipt {
        RequestReceipt {
            request: req,
            error: None,
            gas_budget: 1000,
            gas_burned: 10,
            gas_fee_charged: 10,
            block_index,
            request_index,
        }
    }

    #[test]
    fn block_infos_are_indexed_by_block() {
        let mut state = Dict::new();
        assert_eq!(latest_block_index(&state).unwrap(), None);
        for i in 0..3u32 {
            let info = BlockInfo {
                block_index: i,
                timestamp: 100 + i as u64,
                previous_anchor: OutputId::new(TransactionId::from([i as u8; 32]), 0),
                previous_l1_commitment: L1Commitment(H256::repeat_byte(i as u8)),
                ..Default::default()
            };
            save_block_info(&mut state, &info).unwrap();
        }
        let latest = get_latest_block_info(&state).unwrap().unwrap();
        assert_eq!(latest.block_index, 2);
        assert_eq!(latest.timestamp, 102);
        assert_eq!(
            anchor_tx_id(&state, 1).unwrap(),
            Some(TransactionId::from([2; 32]))
        );
        assert_eq!(anchor_tx_id(&state, 2).unwrap(), None);

        let wrong = BlockInfo {
            block_index: 7,
            ..Default::default()
        };
        assert!(save_block_info(&mut state, &wrong).unwrap_err().is_fatal());
    }

    #[test]
    fn receipts_and_events() {
        let mut state = Dict::new();
        let a = request(1, 0);
        let b = request(1, 1);
        save_receipt(&mut state, &receipt(a.clone(), 1, 0)).unwrap();
        let mut failed = receipt(b.clone(), 1, 1);
        failed.error = Some(UnresolvedVmError::new(core_errors::UNAUTHORIZED, vec![]));
        save_receipt(&mut state, &failed).unwrap();
        save_events(&mut state, 1, 0, &["first".into(), "second".into()]);
        save_events(&mut state, 1, 1, &["third".into()]);

        assert!(is_request_processed(&state, &a.id()).unwrap());
        assert!(!is_request_processed(&state, &request(2, 0).id()).unwrap());
        assert_eq!(get_request_receipt(&state, &b.id()).unwrap(), Some(failed));

        let block = get_request_receipts_for_block(&state, 1).unwrap();
        assert_eq!(block.len(), 2);
        assert!(block[0].is_ok());
        assert!(!block[1].is_ok());
        assert_eq!(block[1].request_index, 1);

        assert_eq!(
            get_events_for_request(&state, &a.id()).unwrap(),
            vec!["first".to_string(), "second".to_string()]
        );
        assert_eq!(get_events_for_block(&state, 1).len(), 3);
        assert!(get_events_for_block(&state, 2).is_empty());
    }

    #[test]
    fn control_addresses_change_history() {
        let mut state = Dict::new();
        let a = Address::Ed25519(Ed25519Address([1; 32]));
        let b = Address::Ed25519(Ed25519Address([2; 32]));
        let first = ControlAddresses {
            state_controller: a,
            governor: a,
            since_block_index: 0,
        };
        save_control_addresses(&mut state, &first).unwrap();
        save_control_addresses(
            &mut state,
            &ControlAddresses {
                since_block_index: 5,
                ..first
            },
        )
        .unwrap();
        assert_eq!(get_control_addresses(&state).unwrap(), Some(first));

        let rotated = ControlAddresses {
            state_controller: b,
            governor: a,
            since_block_index: 6,
        };
        save_control_addresses(&mut state, &rotated).unwrap();
        assert_eq!(get_control_addresses(&state).unwrap(), Some(rotated));
    }
}
