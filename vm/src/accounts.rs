//! The L2 ledger: balances of every account of the chain.
//!
//! All functions work on the partition of the `accounts` core contract.
//! Besides balances the partition keeps the chain-wide totals, the NFTs and
//! foundries owned by each account, the off-ledger nonces and the records of
//! the internal outputs the chain holds on L1.

use std::collections::BTreeMap;

use anchor_common::OFF_LEDGER_NONCE_STRICT_ORDER_TOLERANCE;
use anchor_ledger::codec::{read_bytes_u16, read_u16, read_u32, read_u8, write_bytes_u16};
use anchor_ledger::{
    Address, BasicOutput, CodecError, CodecResult, FoundryOutput, FungibleTokens, NftId,
    NftOutput, OutputId, Packable, TokenId, TransactionId,
};
use bytes::{Buf, BufMut};
use ethereum_types::U256;
use kv_state::codec::{decode_or, decode_u256, decode_u64, encode_u256, encode_u64};
use kv_state::kv::key_join;
use kv_state::{KvReader, KvStore};
use serde::{Deserialize, Serialize};

use crate::agent::AgentId;
use crate::error::{VmError, VmResult};
use crate::txbuilder::{InternalOutputChanges, OutputLoader};

const KEY_BASE_TOKENS: &[u8] = b"b";
const KEY_NATIVE_TOKENS: &[u8] = b"t";
const KEY_TOTAL_BASE_TOKENS: &[u8] = b"B";
const KEY_TOTAL_NATIVE_TOKENS: &[u8] = b"T";
const KEY_ACCOUNT_NFTS: &[u8] = b"n";
const KEY_NFT_RECORDS: &[u8] = b"N";
const KEY_NONCES: &[u8] = b"o";
const KEY_ACCOUNT_FOUNDRIES: &[u8] = b"F";
const KEY_NATIVE_TOKEN_OUTPUTS: &[u8] = b"i";
const KEY_FOUNDRY_OUTPUTS: &[u8] = b"f";
const KEY_NFT_OUTPUTS: &[u8] = b"j";

fn native_token_key(agent: &AgentId, id: &TokenId) -> Vec<u8> {
    key_join(&[KEY_NATIVE_TOKENS, &agent.to_bytes(), id.as_bytes()])
}

/// Base tokens of `agent`.
pub fn base_tokens<S: KvReader + ?Sized>(state: &S, agent: &AgentId) -> VmResult<u64> {
    let key = key_join(&[KEY_BASE_TOKENS, &agent.to_bytes()]);
    Ok(decode_or(state.get(&key), 0, decode_u64)?)
}

/// Amount of native token `id` held by `agent`.
pub fn native_token_balance<S: KvReader + ?Sized>(
    state: &S,
    agent: &AgentId,
    id: &TokenId,
) -> VmResult<U256> {
    Ok(decode_or(
        state.get(&native_token_key(agent, id)),
        U256::zero(),
        decode_u256,
    )?)
}

/// Everything `agent` holds except NFTs.
pub fn balances<S: KvReader + ?Sized>(state: &S, agent: &AgentId) -> VmResult<FungibleTokens> {
    let mut ret = FungibleTokens::with_base_tokens(base_tokens(state, agent)?);
    let prefix = key_join(&[KEY_NATIVE_TOKENS, &agent.to_bytes()]);
    for (k, v) in state.entries(&prefix) {
        let id = TokenId::from_bytes(&k[prefix.len()..])?;
        ret.native_tokens.add(id, decode_u256(&v)?);
    }
    Ok(ret)
}

/// Sum over all accounts.
pub fn total_assets<S: KvReader + ?Sized>(state: &S) -> VmResult<FungibleTokens> {
    let mut ret = FungibleTokens::with_base_tokens(decode_or(
        state.get(KEY_TOTAL_BASE_TOKENS),
        0,
        decode_u64,
    )?);
    for (k, v) in state.entries(KEY_TOTAL_NATIVE_TOKENS) {
        let id = TokenId::from_bytes(&k[KEY_TOTAL_NATIVE_TOKENS.len()..])?;
        ret.native_tokens.add(id, decode_u256(&v)?);
    }
    Ok(ret)
}

fn set_base<S: KvStore + ?Sized>(state: &mut S, key: &[u8], value: u64) {
    match value {
        0 => state.del(key),
        v => state.set(key, &encode_u64(v)),
    }
}

fn set_u256<S: KvStore + ?Sized>(state: &mut S, key: &[u8], value: U256) {
    match value.is_zero() {
        true => state.del(key),
        false => state.set(key, &encode_u256(&value)),
    }
}

fn add_base<S: KvStore + ?Sized>(state: &mut S, key: &[u8], delta: u64) -> VmResult<()> {
    let current = decode_or(state.get(key), 0, decode_u64)?;
    let next = current
        .checked_add(delta)
        .ok_or_else(|| VmError::Fatal("base token overflow".into()))?;
    set_base(state, key, next);
    Ok(())
}

fn sub_base<S: KvStore + ?Sized>(state: &mut S, key: &[u8], delta: u64) -> VmResult<()> {
    let current = decode_or(state.get(key), 0, decode_u64)?;
    let next = current.checked_sub(delta).ok_or(VmError::NotEnoughFunds)?;
    set_base(state, key, next);
    Ok(())
}

fn add_u256<S: KvStore + ?Sized>(state: &mut S, key: &[u8], delta: U256) -> VmResult<()> {
    let current = decode_or(state.get(key), U256::zero(), decode_u256)?;
    let next = current
        .checked_add(delta)
        .ok_or_else(|| VmError::Fatal("native token overflow".into()))?;
    set_u256(state, key, next);
    Ok(())
}

fn sub_u256<S: KvStore + ?Sized>(state: &mut S, key: &[u8], delta: U256) -> VmResult<()> {
    let current = decode_or(state.get(key), U256::zero(), decode_u256)?;
    let next = current.checked_sub(delta).ok_or(VmError::NotEnoughFunds)?;
    set_u256(state, key, next);
    Ok(())
}

/// Adds `tokens` to the account of `agent` and to the totals.
pub fn credit<S: KvStore + ?Sized>(
    state: &mut S,
    agent: &AgentId,
    tokens: &FungibleTokens,
) -> VmResult<()> {
    if tokens.base_tokens > 0 {
        add_base(
            state,
            &key_join(&[KEY_BASE_TOKENS, &agent.to_bytes()]),
            tokens.base_tokens,
        )?;
        add_base(state, KEY_TOTAL_BASE_TOKENS, tokens.base_tokens)?;
    }
    for nt in tokens.native_tokens.iter() {
        add_u256(state, &native_token_key(agent, &nt.id), nt.amount)?;
        add_u256(
            state,
            &key_join(&[KEY_TOTAL_NATIVE_TOKENS, nt.id.as_bytes()]),
            nt.amount,
        )?;
    }
    Ok(())
}

/// Removes `tokens` from the account of `agent` and from the totals. Fails
/// without changing anything when the account does not hold them.
pub fn debit<S: KvStore + ?Sized>(
    state: &mut S,
    agent: &AgentId,
    tokens: &FungibleTokens,
) -> VmResult<()> {
    let mut held = balances(state, agent)?;
    if !held.spend(tokens) {
        return Err(VmError::NotEnoughFunds);
    }
    if tokens.base_tokens > 0 {
        sub_base(
            state,
            &key_join(&[KEY_BASE_TOKENS, &agent.to_bytes()]),
            tokens.base_tokens,
        )?;
        sub_base(state, KEY_TOTAL_BASE_TOKENS, tokens.base_tokens)?;
    }
    for nt in tokens.native_tokens.iter() {
        sub_u256(state, &native_token_key(agent, &nt.id), nt.amount)?;
        sub_u256(
            state,
            &key_join(&[KEY_TOTAL_NATIVE_TOKENS, nt.id.as_bytes()]),
            nt.amount,
        )?;
    }
    Ok(())
}

/// Moves `tokens` between two accounts.
pub fn move_between<S: KvStore + ?Sized>(
    state: &mut S,
    from: &AgentId,
    to: &AgentId,
    tokens: &FungibleTokens,
) -> VmResult<()> {
    if from == to {
        let mut held = balances(state, from)?;
        return match held.spend(tokens) {
            true => Ok(()),
            false => Err(VmError::NotEnoughFunds),
        };
    }
    debit(state, from, tokens)?;
    credit(state, to, tokens)
}

/// Applies a storage deposit adjustment of the anchor transaction builder
/// to `agent`: negative values are charged, positive ones refunded.
pub fn adjust_base_tokens<S: KvStore + ?Sized>(
    state: &mut S,
    agent: &AgentId,
    adjustment: i64,
) -> VmResult<()> {
    let tokens = FungibleTokens::with_base_tokens(adjustment.unsigned_abs());
    match adjustment {
        0 => Ok(()),
        a if a < 0 => debit(state, agent, &tokens),
        _ => credit(state, agent, &tokens),
    }
}

/// What the chain knows about an NFT it holds.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct NftRecord {
    /// The NFT.
    pub id: NftId,
    /// Who minted it.
    pub issuer: Option<Address>,
    /// Immutable metadata.
    pub metadata: Vec<u8>,
    /// Account owning it on the chain.
    pub owner: AgentId,
}

impl Packable for NftRecord {
    fn pack<B: BufMut>(&self, buf: &mut B) {
        self.id.pack(buf);
        match &self.issuer {
            Some(a) => {
                buf.put_u8(1);
                a.pack(buf);
            }
            None => buf.put_u8(0),
        }
        write_bytes_u16(buf, &self.metadata);
        self.owner.pack(buf);
    }

    fn unpack<B: Buf>(buf: &mut B) -> CodecResult<Self> {
        let id = NftId::unpack(buf)?;
        let issuer = match read_u8(buf)? {
            0 => None,
            1 => Some(Address::unpack(buf)?),
            kind => {
                return Err(CodecError::UnknownKind {
                    what: "issuer flag",
                    kind,
                })
            }
        };
        Ok(Self {
            id,
            issuer,
            metadata: read_bytes_u16(buf)?,
            owner: AgentId::unpack(buf)?,
        })
    }
}

/// Gives the NFT to `record.owner`.
pub fn credit_nft<S: KvStore + ?Sized>(state: &mut S, record: &NftRecord) {
    state.set(
        &key_join(&[KEY_ACCOUNT_NFTS, &record.owner.to_bytes(), record.id.as_bytes()]),
        &[],
    );
    state.set(
        &key_join(&[KEY_NFT_RECORDS, record.id.as_bytes()]),
        &record.to_bytes(),
    );
}

/// Takes the NFT from `agent`, returning its record.
pub fn debit_nft<S: KvStore + ?Sized>(
    state: &mut S,
    agent: &AgentId,
    id: &NftId,
) -> VmResult<NftRecord> {
    let record = nft_record(state, id)?.ok_or(VmError::NotEnoughFunds)?;
    if &record.owner != agent {
        return Err(VmError::NotEnoughFunds);
    }
    state.del(&key_join(&[KEY_ACCOUNT_NFTS, &agent.to_bytes(), id.as_bytes()]));
    state.del(&key_join(&[KEY_NFT_RECORDS, id.as_bytes()]));
    Ok(record)
}

/// Moves an NFT between accounts.
pub fn move_nft<S: KvStore + ?Sized>(
    state: &mut S,
    from: &AgentId,
    to: &AgentId,
    id: &NftId,
) -> VmResult<()> {
    let mut record = debit_nft(state, from, id)?;
    record.owner = *to;
    credit_nft(state, &record);
    Ok(())
}

/// The record of an NFT held by the chain.
pub fn nft_record<S: KvReader + ?Sized>(state: &S, id: &NftId) -> VmResult<Option<NftRecord>> {
    state
        .get(&key_join(&[KEY_NFT_RECORDS, id.as_bytes()]))
        .map(|b| NftRecord::from_bytes(&b))
        .transpose()
        .map_err(Into::into)
}

/// NFTs owned by `agent`, in id order.
pub fn nfts_of<S: KvReader + ?Sized>(state: &S, agent: &AgentId) -> VmResult<Vec<NftId>> {
    let prefix = key_join(&[KEY_ACCOUNT_NFTS, &agent.to_bytes()]);
    let mut ret = Vec::new();
    for (k, _) in state.entries(&prefix) {
        ret.push(NftId::from_bytes(&k[prefix.len()..])?);
    }
    Ok(ret)
}

/// Records `agent` as the owner of a foundry.
pub fn add_foundry<S: KvStore + ?Sized>(state: &mut S, agent: &AgentId, serial_number: u32) {
    state.set(
        &key_join(&[
            KEY_ACCOUNT_FOUNDRIES,
            &agent.to_bytes(),
            &serial_number.to_be_bytes(),
        ]),
        &[],
    );
}

/// Forgets the owner of a foundry.
pub fn remove_foundry<S: KvStore + ?Sized>(state: &mut S, agent: &AgentId, serial_number: u32) {
    state.del(&key_join(&[
        KEY_ACCOUNT_FOUNDRIES,
        &agent.to_bytes(),
        &serial_number.to_be_bytes(),
    ]));
}

/// Whether `agent` owns the foundry.
pub fn has_foundry<S: KvReader + ?Sized>(state: &S, agent: &AgentId, serial_number: u32) -> bool {
    state.has(&key_join(&[
        KEY_ACCOUNT_FOUNDRIES,
        &agent.to_bytes(),
        &serial_number.to_be_bytes(),
    ]))
}

/// Serial numbers of the foundries owned by `agent`, in order.
pub fn foundries_of<S: KvReader + ?Sized>(state: &S, agent: &AgentId) -> VmResult<Vec<u32>> {
    let prefix = key_join(&[KEY_ACCOUNT_FOUNDRIES, &agent.to_bytes()]);
    let mut ret = Vec::new();
    for (k, _) in state.entries(&prefix) {
        ret.push(parse_serial_number(&k[prefix.len()..])?);
    }
    Ok(ret)
}

fn parse_serial_number(b: &[u8]) -> CodecResult<u32> {
    let raw: [u8; 4] = b
        .try_into()
        .map_err(|_| CodecError::Invalid(format!("foundry key of {} bytes", b.len())))?;
    Ok(u32::from_be_bytes(raw))
}

fn nonce_key(agent: &AgentId) -> Vec<u8> {
    key_join(&[KEY_NONCES, &agent.to_bytes()])
}

/// The lowest nonce `agent` may use next.
pub fn next_nonce<S: KvReader + ?Sized>(state: &S, agent: &AgentId) -> VmResult<u64> {
    Ok(decode_or(state.get(&nonce_key(agent)), 0, decode_u64)?)
}

/// Refuses nonces already used or skipped over, and nonces too far ahead.
pub fn check_nonce<S: KvReader + ?Sized>(state: &S, agent: &AgentId, nonce: u64) -> VmResult<()> {
    let next = next_nonce(state, agent)?;
    if nonce < next {
        return Err(VmError::InvalidParam(format!(
            "nonce {nonce} already used, next is {next}"
        )));
    }
    if nonce - next >= OFF_LEDGER_NONCE_STRICT_ORDER_TOLERANCE {
        return Err(VmError::InvalidParam(format!(
            "nonce {nonce} too far ahead of {next}"
        )));
    }
    Ok(())
}

/// Marks `nonce` of `agent` as used.
pub fn save_nonce<S: KvStore + ?Sized>(state: &mut S, agent: &AgentId, nonce: u64) -> VmResult<()> {
    let next = next_nonce(state, agent)?.max(nonce.saturating_add(1));
    state.set(&nonce_key(agent), &encode_u64(next));
    Ok(())
}

/// An internal output and where the chain produced it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OutputRecord<T> {
    /// The output.
    pub output: T,
    /// Block whose anchor transaction produced it.
    pub block_index: u32,
    /// Index in that transaction.
    pub output_index: u16,
}

impl<T: Packable> Packable for OutputRecord<T> {
    fn pack<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.block_index);
        buf.put_u16_le(self.output_index);
        self.output.pack(buf);
    }

    fn unpack<B: Buf>(buf: &mut B) -> CodecResult<Self> {
        let block_index = read_u32(buf)?;
        let output_index = read_u16(buf)?;
        Ok(Self {
            output: T::unpack(buf)?,
            block_index,
            output_index,
        })
    }
}

fn save_records<S, K, T>(
    state: &mut S,
    prefix: &[u8],
    changes: &[(K, Option<(T, u16)>)],
    key: impl Fn(&K) -> Vec<u8>,
    block_index: u32,
) where
    S: KvStore + ?Sized,
    T: Packable + Clone,
{
    for (id, change) in changes {
        let k = key_join(&[prefix, &key(id)]);
        match change {
            Some((output, output_index)) => state.set(
                &k,
                &OutputRecord {
                    output: output.clone(),
                    block_index,
                    output_index: *output_index,
                }
                .to_bytes(),
            ),
            None => state.del(&k),
        }
    }
}

/// Stores where the internal outputs changed by block `block_index` live.
pub fn save_internal_outputs<S: KvStore + ?Sized>(
    state: &mut S,
    changes: &InternalOutputChanges,
    block_index: u32,
) {
    save_records(
        state,
        KEY_NATIVE_TOKEN_OUTPUTS,
        &changes.native_tokens,
        |id| id.as_bytes().to_vec(),
        block_index,
    );
    save_records(
        state,
        KEY_FOUNDRY_OUTPUTS,
        &changes.foundries,
        |sn| sn.to_be_bytes().to_vec(),
        block_index,
    );
    save_records(
        state,
        KEY_NFT_OUTPUTS,
        &changes.nfts,
        |id| id.as_bytes().to_vec(),
        block_index,
    );
}

/// The stored foundry output with serial number `serial_number`.
pub fn foundry_output<S: KvReader + ?Sized>(
    state: &S,
    serial_number: u32,
) -> VmResult<Option<OutputRecord<FoundryOutput>>> {
    state
        .get(&key_join(&[KEY_FOUNDRY_OUTPUTS, &serial_number.to_be_bytes()]))
        .map(|b| OutputRecord::from_bytes(&b))
        .transpose()
        .map_err(Into::into)
}

/// Internal outputs of the chain as of the start of a block, with their
/// output ids resolved.
#[derive(Clone, Debug, Default)]
pub struct InternalOutputs {
    native_tokens: BTreeMap<TokenId, (BasicOutput, OutputId)>,
    foundries: BTreeMap<u32, (FoundryOutput, OutputId)>,
    nfts: BTreeMap<NftId, (NftOutput, OutputId)>,
}

fn load_records<S, K, T>(
    state: &S,
    prefix: &[u8],
    parse_key: impl Fn(&[u8]) -> CodecResult<K>,
    tx_of_block: &impl Fn(u32) -> Option<TransactionId>,
) -> VmResult<BTreeMap<K, (T, OutputId)>>
where
    S: KvReader + ?Sized,
    K: Ord,
    T: Packable,
{
    let mut ret = BTreeMap::new();
    for (k, v) in state.entries(prefix) {
        let rec = OutputRecord::<T>::from_bytes(&v)?;
        let tx = tx_of_block(rec.block_index).ok_or_else(|| {
            VmError::Fatal(format!(
                "anchor transaction of block {} unknown",
                rec.block_index
            ))
        })?;
        ret.insert(
            parse_key(&k[prefix.len()..])?,
            (rec.output, OutputId::new(tx, rec.output_index)),
        );
    }
    Ok(ret)
}

impl InternalOutputs {
    /// Reads every record. `tx_of_block` gives the id of the anchor
    /// transaction of a block.
    pub fn load<S: KvReader + ?Sized>(
        state: &S,
        tx_of_block: impl Fn(u32) -> Option<TransactionId>,
    ) -> VmResult<Self> {
        Ok(Self {
            native_tokens: load_records(
                state,
                KEY_NATIVE_TOKEN_OUTPUTS,
                TokenId::from_bytes,
                &tx_of_block,
            )?,
            foundries: load_records(
                state,
                KEY_FOUNDRY_OUTPUTS,
                parse_serial_number,
                &tx_of_block,
            )?,
            nfts: load_records(state, KEY_NFT_OUTPUTS, NftId::from_bytes, &tx_of_block)?,
        })
    }
}

impl OutputLoader for InternalOutputs {
    fn load_native_token_output(&self, id: &TokenId) -> Option<(BasicOutput, OutputId)> {
        self.native_tokens.get(id).cloned()
    }

    fn load_foundry(&self, serial_number: u32) -> Option<(FoundryOutput, OutputId)> {
        self.foundries.get(&serial_number).cloned()
    }

    fn load_nft(&self, id: &NftId) -> Option<(NftOutput, OutputId)> {
        self.nfts.get(id).cloned()
    }
}
