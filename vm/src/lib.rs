//! The deterministic part of a chain: everything between a batch of requests
//! and the anchor transaction of the block they produce.
//!
//! A chain keeps its state in a [`kv_state::StateDb`] partitioned between
//! contracts. The core contracts ([`contracts::CoreContract`]) are deployed
//! at [`origin`] and keep the L2 ledger, the registry of contracts, the
//! governance settings, the error templates, the block log and the EVM
//! state. User programs are registered in [`Processors`] and deployed through
//! the root contract.
//!
//! [`run_block`] runs a batch of requests against the committed state. Each
//! request executes inside a [`Sandbox`] with its own gas meter and state
//! overlay; the [`AnchorTxBuilder`] follows the effects every request has on
//! L1 and finally lays out the transaction that moves the anchor output to
//! the commitment of the new state.

#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_debug_implementations)]
#![deny(missing_docs)]

pub mod accounts;
pub mod agent;
pub mod blocklog;
pub mod contracts;
pub mod error;
pub mod evm;
pub mod gas;
pub mod hname;
pub mod origin;
pub mod request;
pub mod sandbox;
pub mod txbuilder;
pub mod vmcontext;
pub mod vmerror;

pub use agent::{AgentId, ChainId};
pub use contracts::{CoreContract, Processor, Processors};
pub use error::{VmError, VmResult};
pub use gas::{GasFeePolicy, GasLimits};
pub use hname::Hname;
pub use origin::{chain_id_of, origin_state, OriginParams};
pub use request::{OffLedgerRequest, OnLedgerRequest, Request, RequestId};
pub use sandbox::{call_view, BlockEnv, Sandbox, ViewContext};
pub use txbuilder::{AnchorTxBuilder, TxBuilderError};
pub use vmcontext::{run_block, sign_anchor_transaction, BlockResult, BlockTask, SkipReason};
pub use vmerror::{UnresolvedVmError, VmErrorCode};

#[cfg(test)]
pub(crate) mod testing_utils {
    use std::sync::Once;

    static INIT: Once = Once::new();

    pub(crate) fn common_setup() {
        // Try init since multiple tests calling `init` will cause an error.
        INIT.call_once(|| {
            let _ = pretty_env_logger::try_init();
        });
    }
}
