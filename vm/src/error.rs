//! Errors raised by the VM.

use anchor_ledger::CodecError;
use kv_state::KvDecodeError;
use thiserror::Error;

use crate::evm::EvmError;
use crate::hname::Hname;
use crate::txbuilder::TxBuilderError;
use crate::vmerror::{core_errors, UnresolvedVmError};

/// Result of a VM operation.
pub type VmResult<T> = Result<T, VmError>;

/// Failure of a request or of the VM itself.
///
/// Everything except [`VmError::Fatal`] fails only the current request: its
/// state changes are dropped and the error is recorded in its receipt.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum VmError {
    /// The request burned its whole gas budget.
    #[error("gas budget exceeded")]
    GasLimitExceeded,

    /// No contract is deployed under the hname.
    #[error("contract {0} not found")]
    ContractNotFound(Hname),

    /// The contract has no such entry point.
    #[error("entry point {entry_point} not found in contract {contract}")]
    EntryPointNotFound {
        /// The called contract.
        contract: Hname,
        /// The missing entry point.
        entry_point: Hname,
    },

    /// The caller is not allowed to perform the operation.
    #[error("unauthorized access")]
    Unauthorized,

    /// An account cannot cover a debit.
    #[error("not enough funds")]
    NotEnoughFunds,

    /// A parameter is missing or malformed.
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    /// The anchor transaction cannot take the effects of the request.
    #[error("anchor transaction: {0}")]
    TxBuilder(#[from] TxBuilderError),

    /// A stored value could not be decoded.
    #[error("decode failed: {0}")]
    Decode(#[from] KvDecodeError),

    /// Ledger bytes could not be decoded.
    #[error("decode failed: {0}")]
    Codec(#[from] CodecError),

    /// An EVM transaction was rejected.
    #[error("evm: {0}")]
    Evm(String),

    /// A contract failed with a message.
    #[error("{0}")]
    Generic(String),

    /// A contract failed with one of its registered errors.
    #[error("{0}")]
    Custom(UnresolvedVmError),

    /// The state or the VM is inconsistent. Aborts the block.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl VmError {
    /// Whether the error must abort the block instead of only the request.
    pub fn is_fatal(&self) -> bool {
        matches!(self, VmError::Fatal(_))
    }

    /// The form stored in receipts.
    pub fn to_unresolved(&self) -> UnresolvedVmError {
        use core_errors::*;

        let (code, params) = match self {
            VmError::GasLimitExceeded => (GAS_LIMIT_EXCEEDED, vec![]),
            VmError::ContractNotFound(h) => (CONTRACT_NOT_FOUND, vec![h.to_string()]),
            VmError::EntryPointNotFound {
                contract,
                entry_point,
            } => (
                ENTRY_POINT_NOT_FOUND,
                vec![entry_point.to_string(), contract.to_string()],
            ),
            VmError::Unauthorized => (UNAUTHORIZED, vec![]),
            VmError::NotEnoughFunds => (NOT_ENOUGH_FUNDS, vec![]),
            VmError::InvalidParam(p) => (INVALID_PARAM, vec![p.clone()]),
            VmError::TxBuilder(e) => (TX_BUILDER, vec![e.to_string()]),
            VmError::Decode(e) => (DECODE, vec![e.to_string()]),
            VmError::Codec(e) => (DECODE, vec![e.to_string()]),
            VmError::Evm(e) => (EVM, vec![e.clone()]),
            VmError::Generic(msg) | VmError::Fatal(msg) => (GENERIC, vec![msg.clone()]),
            VmError::Custom(e) => return e.clone(),
        };
        UnresolvedVmError::new(code, params)
    }
}

impl From<EvmError> for VmError {
    fn from(e: EvmError) -> Self {
        VmError::Evm(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receipts_carry_the_same_message() {
        let errs = [
            VmError::GasLimitExceeded,
            VmError::ContractNotFound(Hname(0x1234)),
            VmError::EntryPointNotFound {
                contract: Hname(0x1234),
                entry_point: Hname(0x5678),
            },
            VmError::InvalidParam("n".into()),
            VmError::Generic("boom".into()),
        ];
        for e in errs {
            assert_eq!(e.to_unresolved().resolve_core().unwrap(), e.to_string());
        }
    }
}
