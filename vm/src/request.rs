//! On-ledger and off-ledger requests behind one interface.
//!
//! An on-ledger request is an output sent to the chain address; its id is
//! the id of that output. An off-ledger request is a signed message; its id
//! is derived from the hash of its bytes without the signature, so that it
//! can be compared with on-ledger ids in the blocklog.

use std::fmt;

use anchor_ledger::codec::{read_array, read_u32, read_u64, read_u8};
use anchor_ledger::{
    Address, CodecError, CodecResult, Ed25519Address, FungibleTokens, NftId, Output, OutputId,
    Packable, TransactionId,
};
use bytes::{Buf, BufMut};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use keccak_hash::keccak;
use kv_state::Dict;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::agent::{AgentId, ChainId};
use crate::contracts::{accounts, CoreContract};
use crate::hname::Hname;

/// Why a request cannot be used.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum RequestError {
    /// Only basic and NFT outputs can be requests.
    #[error("output {0} of this kind cannot be a request")]
    NotARequestOutput(OutputId),

    /// The signature does not match the request.
    #[error("invalid signature")]
    InvalidSignature,

    /// The bytes are not a request.
    #[error("malformed request: {0}")]
    Malformed(#[from] CodecError),
}

/// The id of a request.
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize)]
pub struct RequestId(pub OutputId);

impl RequestId {
    /// Short digest used to index receipts by request.
    pub fn lookup_key(&self) -> [u8; 8] {
        let mut ret = [0u8; 8];
        ret.copy_from_slice(&keccak(self.0.to_bytes()).as_bytes()[..8]);
        ret
    }

    /// Stored form.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_bytes()
    }

    /// Parses the stored form.
    pub fn from_bytes(b: &[u8]) -> CodecResult<Self> {
        OutputId::from_bytes(b).map(Self)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}",
            hex::encode(self.0.transaction_id.as_bytes()),
            self.0.index
        )
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({self})")
    }
}

impl std::str::FromStr for RequestId {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// Contract and entry point a request calls.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct CallTarget {
    /// The contract.
    pub contract: Hname,
    /// The entry point.
    pub entry_point: Hname,
}

impl CallTarget {
    /// Creates a target.
    pub const fn new(contract: Hname, entry_point: Hname) -> Self {
        Self {
            contract,
            entry_point,
        }
    }
}

/// What the caller lets the callee take from its account.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct Allowance {
    /// Fungible tokens.
    pub assets: FungibleTokens,
    /// NFTs.
    pub nfts: Vec<NftId>,
}

impl Allowance {
    /// Only base tokens.
    pub fn base_tokens(amount: u64) -> Self {
        Self {
            assets: FungibleTokens::with_base_tokens(amount),
            nfts: Vec::new(),
        }
    }

    /// Whether nothing is allowed.
    pub fn is_empty(&self) -> bool {
        self.assets.is_empty() && self.nfts.is_empty()
    }

    /// Removes `assets` from what is still allowed. Returns `false` and
    /// changes nothing when they exceed the allowance.
    pub fn spend(&mut self, assets: &FungibleTokens, nfts: &[NftId]) -> bool {
        if !nfts.iter().all(|id| self.nfts.contains(id)) {
            return false;
        }
        if !self.assets.spend(assets) {
            return false;
        }
        self.nfts.retain(|id| !nfts.contains(id));
        true
    }
}

impl Packable for Allowance {
    fn pack<B: BufMut>(&self, buf: &mut B) {
        self.assets.pack(buf);
        buf.put_u16_le(self.nfts.len() as u16);
        for id in &self.nfts {
            id.pack(buf);
        }
    }

    fn unpack<B: Buf>(buf: &mut B) -> CodecResult<Self> {
        let assets = FungibleTokens::unpack(buf)?;
        let count = anchor_ledger::codec::read_u16(buf)?;
        let mut nfts = Vec::with_capacity(count as usize);
        for _ in 0..count {
            nfts.push(NftId::unpack(buf)?);
        }
        Ok(Self { assets, nfts })
    }
}

fn write_uvarint<B: BufMut>(buf: &mut B, mut v: u64) {
    while v >= 0x80 {
        buf.put_u8((v as u8) | 0x80);
        v >>= 7;
    }
    buf.put_u8(v as u8);
}

fn read_uvarint<B: Buf>(buf: &mut B) -> CodecResult<u64> {
    let mut ret = 0u64;
    for shift in (0..64).step_by(7) {
        let b = read_u8(buf)?;
        ret |= ((b & 0x7f) as u64) << shift;
        if b & 0x80 == 0 {
            return Ok(ret);
        }
    }
    Err(CodecError::Invalid("varint overflow".into()))
}

fn pack_params<B: BufMut>(buf: &mut B, params: &Dict) {
    let raw = params.to_bytes();
    write_uvarint(buf, raw.len() as u64);
    buf.put_slice(&raw);
}

fn unpack_params<B: Buf>(buf: &mut B) -> CodecResult<Dict> {
    let len = read_uvarint(buf)? as usize;
    if buf.remaining() < len {
        return Err(CodecError::UnexpectedEof {
            needed: len,
            remaining: buf.remaining(),
        });
    }
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    Dict::from_bytes(&raw).map_err(|e| CodecError::Invalid(e.to_string()))
}

/// The call encoded in the metadata feature of an on-ledger request.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RequestMetadata {
    /// Contract of the sending chain that posted the request, if any.
    pub sender_contract: Hname,
    /// Called contract.
    pub target_contract: Hname,
    /// Called entry point.
    pub entry_point: Hname,
    /// Call parameters.
    pub params: Dict,
    /// What the callee may take from the sender's account.
    pub allowance: Allowance,
    /// Gas the sender is willing to pay for.
    pub gas_budget: u64,
}

impl Packable for RequestMetadata {
    fn pack<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.sender_contract.0);
        buf.put_u32_le(self.target_contract.0);
        buf.put_u32_le(self.entry_point.0);
        pack_params(buf, &self.params);
        self.allowance.pack(buf);
        buf.put_u64_le(self.gas_budget);
    }

    fn unpack<B: Buf>(buf: &mut B) -> CodecResult<Self> {
        Ok(Self {
            sender_contract: Hname(read_u32(buf)?),
            target_contract: Hname(read_u32(buf)?),
            entry_point: Hname(read_u32(buf)?),
            params: unpack_params(buf)?,
            allowance: Allowance::unpack(buf)?,
            gas_budget: read_u64(buf)?,
        })
    }
}

/// NFT carried by a request.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct NftInfo {
    /// The NFT.
    pub id: NftId,
    /// Who minted it.
    pub issuer: Option<Address>,
    /// Immutable metadata.
    pub metadata: Vec<u8>,
}

/// A request made by sending an output to the chain.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OnLedgerRequest {
    output_id: OutputId,
    output: Output,
    metadata: Option<RequestMetadata>,
}

impl OnLedgerRequest {
    /// Interprets an output as a request. Metadata that does not parse is
    /// ignored and the output is treated as a plain deposit.
    pub fn from_output(output_id: OutputId, output: Output) -> Result<Self, RequestError> {
        if !matches!(output, Output::Basic(_) | Output::Nft(_)) {
            return Err(RequestError::NotARequestOutput(output_id));
        }
        let metadata = output
            .features()
            .metadata()
            .and_then(|m| RequestMetadata::from_bytes(m).ok());
        Ok(Self {
            output_id,
            output,
            metadata,
        })
    }

    /// The consumed output.
    pub fn output(&self) -> &Output {
        &self.output
    }

    /// Its id.
    pub fn output_id(&self) -> OutputId {
        self.output_id
    }

    /// The decoded call, if any.
    pub fn metadata(&self) -> Option<&RequestMetadata> {
        self.metadata.as_ref()
    }

    /// The NFT carried by the output, if it is an NFT output.
    pub fn nft(&self) -> Option<NftInfo> {
        let nft = self.output.as_nft()?;
        Some(NftInfo {
            id: nft.nft_id.or_from_output_id(&self.output_id),
            issuer: nft.immutable_features.issuer().copied(),
            metadata: nft
                .immutable_features
                .metadata()
                .map(<[u8]>::to_vec)
                .unwrap_or_default(),
        })
    }

    /// Everything the output holds.
    pub fn fungible_tokens(&self) -> FungibleTokens {
        FungibleTokens {
            base_tokens: self.output.amount(),
            native_tokens: self.output.native_tokens().clone(),
        }
    }
}

/// A request signed by its sender and handed to a node directly.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OffLedgerRequest {
    /// Target chain.
    pub chain_id: ChainId,
    /// Called contract.
    pub contract: Hname,
    /// Called entry point.
    pub entry_point: Hname,
    /// Call parameters.
    pub params: Dict,
    /// What the callee may take from the sender's account.
    pub allowance: Option<Allowance>,
    /// Strictly increasing per sender.
    pub nonce: u64,
    /// Gas the sender is willing to pay for.
    pub gas_budget: u64,
    /// Sender key.
    pub public_key: [u8; 32],
    /// Signature over everything above.
    pub signature: [u8; 64],
}

impl OffLedgerRequest {
    /// An unsigned request.
    pub fn new(
        chain_id: ChainId,
        target: CallTarget,
        params: Dict,
        nonce: u64,
        gas_budget: u64,
    ) -> Self {
        Self {
            chain_id,
            contract: target.contract,
            entry_point: target.entry_point,
            params,
            allowance: None,
            nonce,
            gas_budget,
            public_key: [0; 32],
            signature: [0; 64],
        }
    }

    /// Sets the allowance, builder style.
    pub fn with_allowance(mut self, allowance: Allowance) -> Self {
        self.allowance = (!allowance.is_empty()).then_some(allowance);
        self
    }

    /// Signs the request with `key`.
    pub fn sign(mut self, key: &SigningKey) -> Self {
        self.public_key = key.verifying_key().to_bytes();
        self.signature = key.sign(&self.signing_message()).to_bytes();
        self
    }

    /// All bytes except the signature.
    pub fn essence_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.pack_essence(&mut buf);
        buf
    }

    fn pack_essence<B: BufMut>(&self, buf: &mut B) {
        self.chain_id.pack(buf);
        buf.put_u32_le(self.contract.0);
        buf.put_u32_le(self.entry_point.0);
        pack_params(buf, &self.params);
        match &self.allowance {
            Some(a) => {
                buf.put_u8(1);
                a.pack(buf);
            }
            None => buf.put_u8(0),
        }
        buf.put_u64_le(self.nonce);
        buf.put_u64_le(self.gas_budget);
        buf.put_slice(&self.public_key);
    }

    fn signing_message(&self) -> [u8; 32] {
        Sha256::digest(self.essence_bytes()).into()
    }

    /// The request id: hash of the bytes without the signature.
    pub fn id(&self) -> RequestId {
        RequestId(OutputId::new(
            TransactionId(keccak(self.essence_bytes()).0),
            0,
        ))
    }

    /// The sender's account.
    pub fn sender(&self) -> AgentId {
        AgentId::Address(Address::Ed25519(Ed25519Address::from_public_key(
            &self.public_key,
        )))
    }

    /// Checks the signature.
    pub fn verify_signature(&self) -> Result<(), RequestError> {
        let key = VerifyingKey::from_bytes(&self.public_key)
            .map_err(|_| RequestError::InvalidSignature)?;
        let sig = Signature::from_bytes(&self.signature);
        key.verify(&self.signing_message(), &sig)
            .map_err(|_| RequestError::InvalidSignature)
    }
}

impl Packable for OffLedgerRequest {
    fn pack<B: BufMut>(&self, buf: &mut B) {
        self.pack_essence(buf);
        buf.put_slice(&self.signature);
    }

    fn unpack<B: Buf>(buf: &mut B) -> CodecResult<Self> {
        let chain_id = ChainId::unpack(buf)?;
        let contract = Hname(read_u32(buf)?);
        let entry_point = Hname(read_u32(buf)?);
        let params = unpack_params(buf)?;
        let allowance = match read_u8(buf)? {
            0 => None,
            1 => Some(Allowance::unpack(buf)?),
            kind => {
                return Err(CodecError::UnknownKind {
                    what: "allowance flag",
                    kind,
                })
            }
        };
        Ok(Self {
            chain_id,
            contract,
            entry_point,
            params,
            allowance,
            nonce: read_u64(buf)?,
            gas_budget: read_u64(buf)?,
            public_key: read_array(buf)?,
            signature: read_array(buf)?,
        })
    }
}

const ON_LEDGER_KIND: u8 = 0;
const OFF_LEDGER_KIND: u8 = 1;

/// Any request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Request {
    /// Sent as an output.
    OnLedger(OnLedgerRequest),
    /// Sent as a signed message.
    OffLedger(OffLedgerRequest),
}

impl Request {
    /// The request id.
    pub fn id(&self) -> RequestId {
        match self {
            Request::OnLedger(r) => RequestId(r.output_id),
            Request::OffLedger(r) => r.id(),
        }
    }

    /// Whose account pays and receives for the request.
    pub fn sender_account(&self) -> AgentId {
        match self {
            Request::OnLedger(r) => r
                .output
                .features()
                .sender()
                .map_or(AgentId::Nil, |a| AgentId::Address(*a)),
            Request::OffLedger(r) => r.sender(),
        }
    }

    /// The called contract and entry point. An on-ledger request without a
    /// call is a deposit.
    pub fn call_target(&self) -> CallTarget {
        match self {
            Request::OnLedger(r) => match &r.metadata {
                Some(m) => CallTarget::new(m.target_contract, m.entry_point),
                None => CallTarget::new(
                    CoreContract::Accounts.hname(),
                    Hname::from_name(accounts::FUNC_DEPOSIT),
                ),
            },
            Request::OffLedger(r) => CallTarget::new(r.contract, r.entry_point),
        }
    }

    /// Call parameters.
    pub fn params(&self) -> Dict {
        match self {
            Request::OnLedger(r) => r
                .metadata
                .as_ref()
                .map(|m| m.params.clone())
                .unwrap_or_default(),
            Request::OffLedger(r) => r.params.clone(),
        }
    }

    /// What the callee may take from the sender's account.
    pub fn allowance(&self) -> Option<Allowance> {
        match self {
            Request::OnLedger(r) => r.metadata.as_ref().map(|m| m.allowance.clone()),
            Request::OffLedger(r) => r.allowance.clone(),
        }
        .filter(|a| !a.is_empty())
    }

    /// Gas the sender is willing to pay for. A plain deposit is not limited
    /// beyond the chain's own caps.
    pub fn gas_budget(&self) -> u64 {
        match self {
            Request::OnLedger(r) => r.metadata.as_ref().map_or(u64::MAX, |m| m.gas_budget),
            Request::OffLedger(r) => r.gas_budget,
        }
    }

    /// NFT carried by an on-ledger request.
    pub fn nft(&self) -> Option<NftInfo> {
        match self {
            Request::OnLedger(r) => r.nft(),
            Request::OffLedger(_) => None,
        }
    }

    /// Tokens carried by an on-ledger request.
    pub fn fungible_tokens(&self) -> Option<FungibleTokens> {
        match self {
            Request::OnLedger(r) => Some(r.fungible_tokens()),
            Request::OffLedger(_) => None,
        }
    }

    /// Whether this is an off-ledger request.
    pub fn is_off_ledger(&self) -> bool {
        matches!(self, Request::OffLedger(_))
    }

    /// The nonce of an off-ledger request.
    pub fn nonce(&self) -> Option<u64> {
        match self {
            Request::OnLedger(_) => None,
            Request::OffLedger(r) => Some(r.nonce),
        }
    }

    /// Checks the signature of an off-ledger request. On-ledger requests
    /// were authorised by the ledger.
    pub fn verify_signature(&self) -> Result<(), RequestError> {
        match self {
            Request::OnLedger(_) => Ok(()),
            Request::OffLedger(r) => r.verify_signature(),
        }
    }

    /// The on-ledger request, if it is one.
    pub fn as_on_ledger(&self) -> Option<&OnLedgerRequest> {
        match self {
            Request::OnLedger(r) => Some(r),
            Request::OffLedger(_) => None,
        }
    }
}

impl Packable for Request {
    fn pack<B: BufMut>(&self, buf: &mut B) {
        match self {
            Request::OnLedger(r) => {
                buf.put_u8(ON_LEDGER_KIND);
                r.output_id.pack(buf);
                r.output.pack(buf);
            }
            Request::OffLedger(r) => {
                buf.put_u8(OFF_LEDGER_KIND);
                r.pack(buf);
            }
        }
    }

    fn unpack<B: Buf>(buf: &mut B) -> CodecResult<Self> {
        match read_u8(buf)? {
            ON_LEDGER_KIND => {
                let id = OutputId::unpack(buf)?;
                let output = Output::unpack(buf)?;
                OnLedgerRequest::from_output(id, output)
                    .map(Request::OnLedger)
                    .map_err(|e| CodecError::Invalid(e.to_string()))
            }
            OFF_LEDGER_KIND => OffLedgerRequest::unpack(buf).map(Request::OffLedger),
            kind => Err(CodecError::UnknownKind {
                what: "request",
                kind,
            }),
        }
    }
}

/// Puts a batch in execution order: on-ledger requests by output id, then
/// off-ledger requests by sender and nonce.
pub fn sort_batch(requests: &mut [Request]) {
    requests.sort_by(|a, b| match (a, b) {
        (Request::OnLedger(x), Request::OnLedger(y)) => x.output_id.cmp(&y.output_id),
        (Request::OnLedger(_), Request::OffLedger(_)) => std::cmp::Ordering::Less,
        (Request::OffLedger(_), Request::OnLedger(_)) => std::cmp::Ordering::Greater,
        (Request::OffLedger(x), Request::OffLedger(y)) => (x.sender(), x.nonce, x.id())
            .cmp(&(y.sender(), y.nonce, y.id())),
    });
}

#[cfg(test)]
mod tests {
    use anchor_ledger::{
        make_basic_output, AliasId, Feature, RentStructure, SendOptions,
    };
    use ethereum_types::U256;
    use rand::rngs::OsRng;

    use super::*;

    fn chain() -> ChainId {
        AliasId([7; 32])
    }

    fn target() -> CallTarget {
        CallTarget::new(Hname::from_name("inccounter"), Hname::from_name("increment"))
    }

    #[test]
    fn off_ledger_signature_and_id() {
        let key = SigningKey::generate(&mut OsRng);
        let req = OffLedgerRequest::new(chain(), target(), Dict::new().with("x", [1u8]), 3, 10_000)
            .with_allowance(Allowance::base_tokens(5))
            .sign(&key);
        req.verify_signature().unwrap();

        let decoded = OffLedgerRequest::from_bytes(&req.to_bytes()).unwrap();
        assert_eq!(decoded, req);
        assert_eq!(decoded.id(), req.id());

        // The id does not cover the signature.
        let mut tampered = req.clone();
        tampered.signature[0] ^= 1;
        assert_eq!(tampered.id(), req.id());
        assert_eq!(
            tampered.verify_signature(),
            Err(RequestError::InvalidSignature)
        );

        // Any other byte changes the id and breaks the signature.
        let mut other = req.clone();
        other.nonce += 1;
        assert_ne!(other.id(), req.id());
        assert!(other.verify_signature().is_err());
    }

    #[test]
    fn on_ledger_metadata_is_decoded() {
        let sender = Address::Ed25519(Ed25519Address([1; 32]));
        let meta = RequestMetadata {
            target_contract: target().contract,
            entry_point: target().entry_point,
            params: Dict::new().with("n", [42u8]),
            allowance: Allowance::base_tokens(10),
            gas_budget: 5000,
            ..Default::default()
        };
        let out = make_basic_output(
            Address::Alias(chain()),
            Some(sender),
            &FungibleTokens::with_base_tokens(1_000_000),
            Some(meta.to_bytes()),
            SendOptions::default(),
            &RentStructure::default(),
            true,
        );
        let id = OutputId::new(TransactionId([3; 32]), 1);
        let req = Request::OnLedger(OnLedgerRequest::from_output(id, out.into()).unwrap());
        assert_eq!(req.id(), RequestId(id));
        assert_eq!(req.sender_account(), AgentId::Address(sender));
        assert_eq!(req.call_target(), target());
        assert_eq!(req.gas_budget(), 5000);
        assert_eq!(req.allowance(), Some(Allowance::base_tokens(10)));
        assert_eq!(req.params().get_ref(b"n"), Some(&[42u8][..]));
        assert_eq!(Request::from_bytes(&req.to_bytes()).unwrap(), req);
    }

    #[test]
    fn outputs_without_call_are_deposits() {
        let mut out = anchor_ledger::BasicOutput {
            amount: 100,
            ..Default::default()
        };
        out.features.upsert(Feature::Metadata(vec![0xff]));
        let req = OnLedgerRequest::from_output(OutputId::default(), out.into()).unwrap();
        assert!(req.metadata().is_none());
        let req = Request::OnLedger(req);
        assert_eq!(
            req.call_target().entry_point,
            Hname::from_name(accounts::FUNC_DEPOSIT)
        );
        assert_eq!(req.sender_account(), AgentId::Nil);
        assert_eq!(req.gas_budget(), u64::MAX);
    }

    #[test]
    fn alias_outputs_are_not_requests() {
        let out = Output::Alias(Default::default());
        assert!(OnLedgerRequest::from_output(OutputId::default(), out).is_err());
    }

    #[test]
    fn allowance_spending_is_all_or_nothing() {
        let token = anchor_ledger::FoundryId::build(&chain(), 1, 0);
        let nft = NftId([5; 32]);
        let mut a = Allowance {
            assets: FungibleTokens::with_base_tokens(10).add_native_token(token, U256::from(3)),
            nfts: vec![nft],
        };
        assert!(!a.spend(&FungibleTokens::with_base_tokens(11), &[]));
        assert!(!a.spend(&FungibleTokens::default(), &[NftId([6; 32])]));
        assert!(a.spend(&FungibleTokens::with_base_tokens(4), &[nft]));
        assert_eq!(a.assets.base_tokens, 6);
        assert!(a.nfts.is_empty());
    }

    #[test]
    fn batch_order() {
        let key = SigningKey::generate(&mut OsRng);
        let off = |n| {
            Request::OffLedger(OffLedgerRequest::new(chain(), target(), Dict::new(), n, 1).sign(&key))
        };
        let on = |i| {
            Request::OnLedger(
                OnLedgerRequest::from_output(
                    OutputId::new(TransactionId([1; 32]), i),
                    anchor_ledger::BasicOutput::default().into(),
                )
                .unwrap(),
            )
        };
        let mut batch = vec![off(2), on(5), off(1), on(0)];
        sort_batch(&mut batch);
        let nonces: Vec<_> = batch.iter().map(Request::nonce).collect();
        assert_eq!(nonces, vec![None, None, Some(1), Some(2)]);
        assert_eq!(batch[0].id().0.index, 0);
    }

    #[test]
    fn request_id_text_form() {
        let id = RequestId(OutputId::new(TransactionId([0xab; 32]), 4));
        let s = id.to_string();
        assert!(s.ends_with(":4"));
        assert!(!s.starts_with("0x"));
        assert_eq!(s.parse::<RequestId>().unwrap(), id);
    }
}
