//! Protocol parameters of the host ledger.

use serde::{Deserialize, Serialize};

use crate::rent::RentStructure;

/// Default maximum number of inputs of a transaction.
pub const MAX_INPUTS_COUNT: usize = 128;
/// Default maximum number of outputs of a transaction.
pub const MAX_OUTPUTS_COUNT: usize = 128;
/// Default maximum number of distinct native tokens across a transaction.
pub const MAX_NATIVE_TOKENS_COUNT_PER_TX: usize = 64;

/// The ledger parameters a chain needs to build valid transactions.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct L1Params {
    /// Identifies the ledger network; part of every essence.
    pub network_id: u64,
    /// Protocol version placed in blocks.
    pub protocol_version: u8,
    /// Upper bound of transaction inputs.
    pub max_inputs: usize,
    /// Upper bound of transaction outputs.
    pub max_outputs: usize,
    /// Upper bound of distinct native tokens a transaction may move.
    pub max_native_tokens_per_tx: usize,
    /// Storage deposit pricing.
    pub rent: RentStructure,
}

impl Default for L1Params {
    fn default() -> Self {
        Self {
            network_id: 0x1ee7_5a17,
            protocol_version: 2,
            max_inputs: MAX_INPUTS_COUNT,
            max_outputs: MAX_OUTPUTS_COUNT,
            max_native_tokens_per_tx: MAX_NATIVE_TOKENS_COUNT_PER_TX,
            rent: RentStructure::default(),
        }
    }
}
