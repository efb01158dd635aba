//! Error codes stored in receipts and their message templates.
//!
//! A failed request records an [`UnresolvedVmError`]: the code of the error
//! plus its parameters. The message is produced only when somebody asks for
//! it, by looking the template up either in the built-in table of core
//! errors or in the `errors` contract of the chain.

use std::fmt;

use anchor_ledger::codec::{read_bytes_u16, read_u16, read_u8};
use anchor_ledger::{CodecError, CodecResult, Packable};
use bytes::{Buf, BufMut};
use keccak_hash::keccak;
use kv_state::codec::{decode_u16, KvResult};
use kv_state::KvDecodeError;
use serde::{Deserialize, Serialize};

use crate::hname::Hname;

/// Identifies an error template: the contract that registered it and its
/// index within that contract.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize)]
pub struct VmErrorCode {
    /// The registering contract; [`Hname::NIL`] for core errors.
    pub contract: Hname,
    /// Index of the template.
    pub id: u16,
}

impl VmErrorCode {
    /// A core error code.
    pub const fn core(id: u16) -> Self {
        Self {
            contract: Hname::NIL,
            id,
        }
    }

    /// Key under which the template is stored.
    pub fn to_bytes(&self) -> [u8; 6] {
        let mut ret = [0u8; 6];
        ret[..4].copy_from_slice(&self.contract.to_bytes());
        ret[4..].copy_from_slice(&self.id.to_le_bytes());
        ret
    }

    /// Parses the form produced by [`VmErrorCode::to_bytes`].
    pub fn from_bytes(b: &[u8]) -> KvResult<Self> {
        if b.len() != 6 {
            return Err(KvDecodeError::WrongLength {
                what: "error code",
                expected: 6,
                got: b.len(),
            });
        }
        Ok(Self {
            contract: Hname::from_bytes(&b[..4])?,
            id: decode_u16(&b[4..])?,
        })
    }
}

impl fmt::Display for VmErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.contract, self.id)
    }
}

/// Core error codes.
pub mod core_errors {
    use super::VmErrorCode;

    /// The gas budget was exhausted.
    pub const GAS_LIMIT_EXCEEDED: VmErrorCode = VmErrorCode::core(1);
    /// The target contract does not exist.
    pub const CONTRACT_NOT_FOUND: VmErrorCode = VmErrorCode::core(2);
    /// The target entry point does not exist.
    pub const ENTRY_POINT_NOT_FOUND: VmErrorCode = VmErrorCode::core(3);
    /// The caller may not do this.
    pub const UNAUTHORIZED: VmErrorCode = VmErrorCode::core(4);
    /// An account lacks funds.
    pub const NOT_ENOUGH_FUNDS: VmErrorCode = VmErrorCode::core(5);
    /// The anchor transaction could not take the effects.
    pub const TX_BUILDER: VmErrorCode = VmErrorCode::core(6);
    /// A parameter is missing or malformed.
    pub const INVALID_PARAM: VmErrorCode = VmErrorCode::core(7);
    /// A contract gave up with a message.
    pub const GENERIC: VmErrorCode = VmErrorCode::core(8);
    /// Stored data could not be decoded.
    pub const DECODE: VmErrorCode = VmErrorCode::core(9);
    /// An EVM transaction was rejected.
    pub const EVM: VmErrorCode = VmErrorCode::core(10);

    /// Message formats of the core codes, indexed by id.
    pub(crate) const TEMPLATES: &[(u16, &str)] = &[
        (1, "gas budget exceeded"),
        (2, "contract %v not found"),
        (3, "entry point %v not found in contract %v"),
        (4, "unauthorized access"),
        (5, "not enough funds"),
        (6, "anchor transaction: %v"),
        (7, "invalid parameter: %v"),
        (8, "%v"),
        (9, "decode failed: %v"),
        (10, "evm: %v"),
    ];
}

/// Message format of a core error code.
pub fn core_template(code: &VmErrorCode) -> Option<&'static str> {
    if !code.contract.is_nil() {
        return None;
    }
    core_errors::TEMPLATES
        .iter()
        .find(|(id, _)| *id == code.id)
        .map(|(_, t)| *t)
}

/// Replaces each `%v` of `template` with the next parameter. Missing
/// parameters leave the placeholder in place; extra ones are ignored.
pub fn format_template(template: &str, params: &[String]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut params = params.iter();
    let mut rest = template;
    while let Some(pos) = rest.find("%v") {
        out.push_str(&rest[..pos]);
        match params.next() {
            Some(p) => out.push_str(p),
            None => out.push_str("%v"),
        }
        rest = &rest[pos + 2..];
    }
    out.push_str(rest);
    out
}

/// An error as recorded in a receipt.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct UnresolvedVmError {
    /// The template.
    pub code: VmErrorCode,
    /// Values for the placeholders of the template.
    pub params: Vec<String>,
}

impl UnresolvedVmError {
    /// Creates the error.
    pub fn new(code: VmErrorCode, params: Vec<String>) -> Self {
        Self { code, params }
    }

    /// Digest identifying this exact error instance.
    pub fn hash(&self) -> [u8; 32] {
        keccak(self.to_bytes()).0
    }

    /// The message, using `template` for the format.
    pub fn resolve_with(&self, template: &str) -> String {
        format_template(template, &self.params)
    }

    /// The message of a core error; `None` for contract-registered codes.
    pub fn resolve_core(&self) -> Option<String> {
        core_template(&self.code).map(|t| self.resolve_with(t))
    }
}

impl fmt::Display for UnresolvedVmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.resolve_core() {
            Some(msg) => f.write_str(&msg),
            None => write!(f, "error {} {:?}", self.code, self.params),
        }
    }
}

impl Packable for UnresolvedVmError {
    fn pack<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&self.code.to_bytes());
        buf.put_u8(self.params.len() as u8);
        for p in &self.params {
            anchor_ledger::codec::write_bytes_u16(buf, p.as_bytes());
        }
    }

    fn unpack<B: Buf>(buf: &mut B) -> CodecResult<Self> {
        let contract = Hname(anchor_ledger::codec::read_u32(buf)?);
        let id = read_u16(buf)?;
        let count = read_u8(buf)?;
        let mut params = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let raw = read_bytes_u16(buf)?;
            params.push(
                String::from_utf8(raw).map_err(|_| CodecError::Invalid("error param".into()))?,
            );
        }
        Ok(Self {
            code: VmErrorCode { contract, id },
            params,
        })
    }
}
