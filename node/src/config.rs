//! Node configuration.
//!
//! [`NodeCliConfig`] is what the operator passes on the command line or
//! through the environment; it is turned into the plain [`NodeConfig`] the
//! rest of the node works with.

use std::time::Duration;

use anchor_ledger::params::{
    MAX_INPUTS_COUNT, MAX_NATIVE_TOKENS_COUNT_PER_TX, MAX_OUTPUTS_COUNT,
};
use anchor_ledger::{Address, L1Params, RentStructure};
use chain_vm::gas::Ratio32;
use chain_vm::{AgentId, GasFeePolicy, GasLimits, OriginParams};
use clap::{Args, ValueEnum};
use serde::{Deserialize, Serialize};

/// The help heading for the chain arguments.
const CHAIN_HEADING: &str = "Chain";
/// The help heading for the off-ledger arguments.
const OFF_LEDGER_HEADING: &str = "Off-ledger requests";

/// What to do with on-ledger requests whose base tokens do not cover the
/// minimum fee of a request.
#[derive(ValueEnum, Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub enum DustPolicy {
    /// Leave them on L1.
    #[default]
    Reject,
    /// Take them in; the whole amount goes to fees.
    Accept,
}

impl std::fmt::Display for DustPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DustPolicy::Reject => write!(f, "reject"),
            DustPolicy::Accept => write!(f, "accept"),
        }
    }
}

/// Parses a gas ratio written as `gas:tokens`.
fn parse_ratio(s: &str) -> Result<Ratio32, String> {
    let (a, b) = s
        .split_once(':')
        .ok_or_else(|| format!("expected <gas>:<tokens>, got {s:?}"))?;
    let a = a.trim().parse::<u32>().map_err(|e| e.to_string())?;
    let b = b.trim().parse::<u32>().map_err(|e| e.to_string())?;
    if a == 0 {
        return Err("the gas side of the ratio must not be zero".into());
    }
    Ok(Ratio32 { a, b })
}

/// Command line arguments of the node, each with an environment fallback.
#[derive(Args, Clone, Debug)]
pub struct NodeCliConfig {
    /// Most inputs of an anchor transaction, the anchor included.
    #[clap(long, help_heading = CHAIN_HEADING, env = "ANCHOR_MAX_INPUTS", default_value_t = MAX_INPUTS_COUNT)]
    pub max_inputs: usize,

    /// Most outputs of an anchor transaction.
    #[clap(long, help_heading = CHAIN_HEADING, env = "ANCHOR_MAX_OUTPUTS", default_value_t = MAX_OUTPUTS_COUNT)]
    pub max_outputs: usize,

    /// Most distinct native tokens an anchor transaction may move.
    #[clap(
        long,
        help_heading = CHAIN_HEADING,
        env = "ANCHOR_MAX_NATIVE_TOKENS_PER_TX",
        default_value_t = MAX_NATIVE_TOKENS_COUNT_PER_TX
    )]
    pub max_native_tokens_per_tx: usize,

    /// Most requests taken into one block.
    #[clap(long, help_heading = CHAIN_HEADING, env = "ANCHOR_MAX_REQUESTS_PER_BLOCK", default_value_t = 100)]
    pub max_requests_per_block: usize,

    /// Price of gas for chains created by this node, as `<gas>:<tokens>`.
    #[clap(
        long,
        help_heading = CHAIN_HEADING,
        env = "ANCHOR_GAS_RATIO",
        default_value = "1:1",
        value_parser = parse_ratio
    )]
    pub gas_ratio: Ratio32,

    /// On-ledger requests too small to pay for themselves.
    #[clap(long, help_heading = CHAIN_HEADING, env = "ANCHOR_DUST_POLICY", default_value_t = DustPolicy::Reject)]
    pub dust_policy: DustPolicy,

    /// Seconds to wait for an anchor transaction to be included.
    #[clap(long, help_heading = CHAIN_HEADING, env = "ANCHOR_PUBLISH_TIMEOUT_S", default_value_t = 60)]
    pub publish_timeout_s: u64,

    /// Milliseconds between attempts to produce a block.
    #[clap(long, help_heading = CHAIN_HEADING, env = "ANCHOR_BLOCK_INTERVAL_MS", default_value_t = 1000)]
    pub block_interval_ms: u64,

    /// Committee peers an off-ledger request is forwarded to.
    #[clap(
        long,
        help_heading = OFF_LEDGER_HEADING,
        env = "ANCHOR_OFFLEDGER_BROADCAST_PEERS",
        default_value_t = 2
    )]
    pub offledger_broadcast_peers: usize,

    /// Milliseconds between forwards of a pending off-ledger request.
    #[clap(
        long,
        help_heading = OFF_LEDGER_HEADING,
        env = "ANCHOR_OFFLEDGER_BROADCAST_INTERVAL_MS",
        default_value_t = 5000
    )]
    pub offledger_broadcast_interval_ms: u64,

    /// Seconds an off-ledger request is remembered after submission.
    #[clap(
        long,
        help_heading = OFF_LEDGER_HEADING,
        env = "ANCHOR_OFFLEDGER_API_CACHE_TTL_S",
        default_value_t = 300
    )]
    pub offledger_api_cache_ttl_s: u64,
}

/// How off-ledger requests are remembered and spread.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct OffLedgerConfig {
    /// Peers every pending request is forwarded to.
    pub broadcast_peers: usize,
    /// Time between forwards.
    pub broadcast_interval: Duration,
    /// Time a submitted request is remembered by the admission cache.
    pub cache_ttl: Duration,
}

impl Default for OffLedgerConfig {
    fn default() -> Self {
        Self {
            broadcast_peers: 2,
            broadcast_interval: Duration::from_millis(5000),
            cache_ttl: Duration::from_secs(300),
        }
    }
}

/// Parameters of every chain run by the node.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct ChainParams {
    /// Ledger limits anchor transactions are built against.
    pub l1_params: L1Params,
    /// Requests run in one block at most.
    pub max_requests_per_block: usize,
    /// Gas bought by one base token.
    pub gas_ratio: Ratio32,
    /// Handling of on-ledger requests too small to pay for themselves.
    pub dust_policy: DustPolicy,
    /// Wait for the ledger to decide on an anchor transaction.
    pub publish_timeout: Duration,
    /// Time between block production attempts.
    pub block_interval: Duration,
    /// Account credited with the validator share of fees.
    pub validator: Option<AgentId>,
}

impl Default for ChainParams {
    fn default() -> Self {
        Self {
            l1_params: L1Params::default(),
            max_requests_per_block: 100,
            gas_ratio: Ratio32 { a: 1, b: 1 },
            dust_policy: DustPolicy::Reject,
            publish_timeout: Duration::from_secs(60),
            block_interval: Duration::from_millis(1000),
            validator: None,
        }
    }
}

impl ChainParams {
    /// Parameters of block 0 for a chain created by this node.
    pub fn origin_params(
        &self,
        owner: AgentId,
        state_controller: Address,
        governor: Address,
        timestamp: u64,
    ) -> OriginParams {
        OriginParams {
            owner,
            state_controller,
            governor,
            fee_policy: GasFeePolicy {
                gas_per_token: self.gas_ratio,
                ..Default::default()
            },
            gas_limits: GasLimits::default(),
            timestamp,
        }
    }
}

/// Everything the node is configured with.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct NodeConfig {
    /// Parameters shared by the chains.
    pub chain: ChainParams,
    /// Off-ledger request handling.
    pub off_ledger: OffLedgerConfig,
}

impl NodeCliConfig {
    /// Resolves the parsed arguments.
    pub fn into_node_config(self) -> NodeConfig {
        NodeConfig {
            chain: ChainParams {
                l1_params: L1Params {
                    max_inputs: self.max_inputs,
                    max_outputs: self.max_outputs,
                    max_native_tokens_per_tx: self.max_native_tokens_per_tx,
                    rent: RentStructure::default(),
                    ..Default::default()
                },
                max_requests_per_block: self.max_requests_per_block,
                gas_ratio: self.gas_ratio,
                dust_policy: self.dust_policy,
                publish_timeout: Duration::from_secs(self.publish_timeout_s),
                block_interval: Duration::from_millis(self.block_interval_ms),
                validator: None,
            },
            off_ledger: OffLedgerConfig {
                broadcast_peers: self.offledger_broadcast_peers,
                broadcast_interval: Duration::from_millis(self.offledger_broadcast_interval_ms),
                cache_ttl: Duration::from_secs(self.offledger_api_cache_ttl_s),
            },
        }
    }
}

impl From<NodeCliConfig> for NodeConfig {
    fn from(item: NodeCliConfig) -> Self {
        item.into_node_config()
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct Cli {
        #[clap(flatten)]
        node: NodeCliConfig,
    }

    #[test]
    fn defaults_match_plain_config() {
        let cli = Cli::try_parse_from(["node"]).unwrap();
        let config: NodeConfig = cli.node.into();
        assert_eq!(config, NodeConfig::default());
        assert_eq!(config.chain.l1_params.max_inputs, 128);
        assert_eq!(config.off_ledger.broadcast_peers, 2);
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "node",
            "--max-inputs",
            "16",
            "--gas-ratio",
            "10:3",
            "--dust-policy",
            "accept",
            "--offledger-api-cache-ttl-s",
            "5",
        ])
        .unwrap();
        let config = cli.node.into_node_config();
        assert_eq!(config.chain.l1_params.max_inputs, 16);
        assert_eq!(config.chain.gas_ratio, Ratio32 { a: 10, b: 3 });
        assert_eq!(config.chain.dust_policy, DustPolicy::Accept);
        assert_eq!(config.off_ledger.cache_ttl, Duration::from_secs(5));
    }

    #[test]
    fn malformed_ratio() {
        assert!(parse_ratio("3").is_err());
        assert!(parse_ratio("0:1").is_err());
        assert!(parse_ratio("x:1").is_err());
        assert_eq!(parse_ratio(" 2 : 5 "), Ok(Ratio32 { a: 2, b: 5 }));
    }
}
