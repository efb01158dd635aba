//! Running chains on a node.
//!
//! A node follows the anchor output and the incoming requests of each of
//! its chains on the ledger, admits requests into a per-chain pool,
//! produces blocks with the VM and publishes their anchor transactions.

pub mod chain;
pub mod config;
pub mod l1;
pub mod mempool;
pub mod nodeconn;
pub mod offledger;
pub mod registry;
pub mod retry;
pub mod tracing;

pub use chain::{spawn_chain, ChainHandle, Committee, SingleKeyCommittee};
pub use config::{ChainParams, DustPolicy, NodeCliConfig, NodeConfig, OffLedgerConfig};
pub use l1::{BlockMetadata, InclusionState, L1Client};
pub use mempool::{AdmissionError, AdmissionResult, Mempool, Submission};
pub use nodeconn::{NodeConn, NodeConnError, NodeConnResult};
pub use offledger::{Broadcaster, OffLedgerCache, PeerSender};
pub use registry::{ChainRecord, Chains};
