//! Storage deposit ("rent") computation.

use serde::{Deserialize, Serialize};

use crate::codec::Packable;
use crate::ids::{BlockId, OutputId};
use crate::output::Output;

/// Parameters that price the bytes an output occupies in the ledger.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct RentStructure {
    /// Base tokens charged per virtual byte.
    pub v_byte_cost: u32,
    /// Weight of data bytes.
    pub v_byte_factor_data: u8,
    /// Weight of key (indexed) bytes.
    pub v_byte_factor_key: u8,
}

impl Default for RentStructure {
    fn default() -> Self {
        Self {
            v_byte_cost: 100,
            v_byte_factor_data: 1,
            v_byte_factor_key: 10,
        }
    }
}

impl RentStructure {
    /// Virtual bytes every output pays on top of its own size: the output id
    /// is stored as a key, the booking metadata as data.
    fn v_byte_offset(&self) -> u64 {
        let key = OutputId::LEN as u64 * self.v_byte_factor_key as u64;
        let data = (BlockId::LEN + 4 + 4) as u64 * self.v_byte_factor_data as u64;
        key + data
    }

    /// The minimum amount of base tokens `output` must hold.
    pub fn min_storage_deposit(&self, output: &Output) -> u64 {
        let data = output.packed_len() as u64 * self.v_byte_factor_data as u64;
        self.v_byte_cost as u64 * (self.v_byte_offset() + data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::BasicOutput;

    #[test]
    fn deposit_grows_with_size() {
        let rent = RentStructure::default();
        let small = Output::Basic(BasicOutput::default());
        let mut bigger = BasicOutput::default();
        bigger
            .features
            .upsert(crate::output::Feature::Metadata(vec![0; 100]));
        let bigger = Output::Basic(bigger);
        assert_eq!(
            rent.min_storage_deposit(&bigger) - rent.min_storage_deposit(&small),
            100 * (1 + 2 + 100)
        );
    }
}
