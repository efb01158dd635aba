//! Ledger-level data model of the UTXO ledger that anchors every chain.
//!
//! The crate provides the output types a chain consumes and produces (alias,
//! basic, foundry and NFT outputs), the transaction essence and its wrapping
//! block, and a deterministic little-endian binary codec for all of them. It
//! also carries the rent structure used to compute the minimum storage
//! deposit of an output, together with the protocol limits a transaction must
//! respect.
//!
//! Every type implements [`Packable`](codec::Packable), so that
//! `T::from_bytes(&x.to_bytes()) == x` for any well-formed value.

#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_debug_implementations)]
#![deny(missing_docs)]

pub mod address;
pub mod codec;
pub mod ids;
pub mod output;
pub mod params;
pub mod rent;
pub mod tokens;
pub mod transaction;

pub use address::{Address, Ed25519Address};
pub use codec::{CodecError, CodecResult, Packable};
pub use ids::{AliasId, BlockId, FoundryId, NftId, OutputId, TokenId, TransactionId};
pub use output::{
    make_basic_output, AliasOutput, BasicOutput, Feature, Features, FoundryOutput, NftOutput,
    Output, OutputKind, SendOptions, SimpleTokenScheme, UnlockCondition, UnlockConditions,
};
pub use params::L1Params;
pub use rent::RentStructure;
pub use tokens::{FungibleTokens, NativeToken, NativeTokens};
pub use transaction::{
    inputs_commitment, Block, Ed25519Signature, Transaction, TransactionEssence, Unlock,
};
