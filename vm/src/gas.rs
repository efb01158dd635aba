//! Gas: what operations cost and how burned gas turns into fees.

use std::fmt;

use kv_state::codec::{decode_u32, decode_u64, KvDecodeError, KvResult};
use serde::{Deserialize, Serialize};

use crate::error::{VmError, VmResult};

/// Upper bound of the gas a single request may burn.
pub const MAX_GAS_PER_REQUEST: u64 = 50_000_000;
/// Upper bound of the gas a whole block may burn.
pub const MAX_GAS_PER_BLOCK: u64 = 1_000_000_000;
/// Every processed request is charged at least this much gas, or its whole
/// budget when that is lower.
pub const MIN_GAS_PER_REQUEST: u64 = 10_000;

/// The kinds of work that burn gas.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Deserialize, Serialize)]
pub enum BurnCode {
    /// Calling into another contract.
    CallContract,
    /// Reading the call context (caller, params, allowance).
    GetContext,
    /// Reading an account balance.
    GetBalance,
    /// Reading `x` bytes of state.
    ReadFromState,
    /// Writing `x` bytes of state.
    StorageWrite,
    /// Moving funds between accounts.
    TransferAllowance,
    /// Posting an output to L1.
    SendL1Request,
    /// Deploying a contract.
    DeployContract,
    /// Emitting an event of `x` bytes.
    EmitEvent,
    /// Gas burned explicitly by a contract; costs exactly `x`.
    Utility,
    /// Gas used by an EVM transaction; costs exactly `x`.
    EvmGas,
}

impl BurnCode {
    /// Gas burned for an operation with size argument `x`.
    pub fn cost(&self, x: u64) -> u64 {
        match self {
            BurnCode::CallContract => 100,
            BurnCode::GetContext => 10,
            BurnCode::GetBalance => 20,
            BurnCode::ReadFromState => 10 + x / 100,
            BurnCode::StorageWrite => 100 + x,
            BurnCode::TransferAllowance => 100,
            BurnCode::SendL1Request => 200,
            BurnCode::DeployContract => 10_000,
            BurnCode::EmitEvent => 10 + x,
            BurnCode::Utility | BurnCode::EvmGas => x,
        }
    }

    /// Display name.
    pub const fn name(&self) -> &'static str {
        match self {
            BurnCode::CallContract => "CallContract",
            BurnCode::GetContext => "GetContext",
            BurnCode::GetBalance => "GetBalance",
            BurnCode::ReadFromState => "ReadFromState",
            BurnCode::StorageWrite => "StorageWrite",
            BurnCode::TransferAllowance => "TransferAllowance",
            BurnCode::SendL1Request => "SendL1Request",
            BurnCode::DeployContract => "DeployContract",
            BurnCode::EmitEvent => "EmitEvent",
            BurnCode::Utility => "Utility",
            BurnCode::EvmGas => "EVM",
        }
    }
}

/// One entry of a [`BurnLog`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct BurnRecord {
    /// What burned the gas.
    pub code: BurnCode,
    /// How much.
    pub gas_burned: u64,
}

/// Every burn of a request, in order. Kept only when asked for, e.g. for
/// gas estimation.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct BurnLog(pub Vec<BurnRecord>);

impl BurnLog {
    /// Appends a record.
    pub fn record(&mut self, code: BurnCode, gas_burned: u64) {
        self.0.push(BurnRecord { code, gas_burned });
    }

    /// Sum of all records.
    pub fn total(&self) -> u64 {
        self.0.iter().map(|r| r.gas_burned).sum()
    }
}

impl fmt::Display for BurnLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for r in &self.0 {
            writeln!(f, "{:>18}: {}", r.code.name(), r.gas_burned)?;
        }
        write!(f, "{:>18}: {}", "total", self.total())
    }
}

/// `a` units of gas cost `b` base tokens.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct Ratio32 {
    /// Gas side.
    pub a: u32,
    /// Token side.
    pub b: u32,
}

impl Ratio32 {
    /// `x * b / a`, rounded up.
    pub fn x_ceil(&self, x: u64) -> u64 {
        let num = x as u128 * self.b as u128;
        let a = self.a.max(1) as u128;
        num.div_ceil(a).min(u64::MAX as u128) as u64
    }

    /// `y * a / b`, rounded down.
    pub fn y_floor(&self, y: u64) -> u64 {
        if self.b == 0 {
            return u64::MAX;
        }
        (y as u128 * self.a as u128 / self.b as u128).min(u64::MAX as u128) as u64
    }
}

/// How gas is priced and how fees are split.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct GasFeePolicy {
    /// Price of gas in base tokens.
    pub gas_per_token: Ratio32,
    /// Percentage of every fee that goes to the validator producing the
    /// block; the rest goes to the chain's common account.
    pub validator_fee_share: u8,
}

impl Default for GasFeePolicy {
    fn default() -> Self {
        Self {
            gas_per_token: Ratio32 { a: 1, b: 1 },
            validator_fee_share: 0,
        }
    }
}

impl GasFeePolicy {
    /// Fee in base tokens for `gas`.
    pub fn fee_from_gas(&self, gas: u64) -> u64 {
        self.gas_per_token.x_ceil(gas)
    }

    /// Most gas that `tokens` base tokens can pay for.
    pub fn gas_budget_from_tokens(&self, tokens: u64) -> u64 {
        self.gas_per_token.y_floor(tokens)
    }

    /// Splits `fee` into the validator share and the common account share.
    pub fn split_fee(&self, fee: u64) -> (u64, u64) {
        let share = self.validator_fee_share.min(100) as u128;
        let validator = (fee as u128 * share / 100) as u64;
        (validator, fee - validator)
    }

    /// Stored form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut ret = Vec::with_capacity(9);
        ret.extend_from_slice(&self.gas_per_token.a.to_le_bytes());
        ret.extend_from_slice(&self.gas_per_token.b.to_le_bytes());
        ret.push(self.validator_fee_share);
        ret
    }

    /// Parses the stored form.
    pub fn from_bytes(b: &[u8]) -> KvResult<Self> {
        if b.len() != 9 {
            return Err(KvDecodeError::WrongLength {
                what: "gas fee policy",
                expected: 9,
                got: b.len(),
            });
        }
        let policy = Self {
            gas_per_token: Ratio32 {
                a: decode_u32(&b[..4])?,
                b: decode_u32(&b[4..8])?,
            },
            validator_fee_share: b[8],
        };
        if policy.gas_per_token.a == 0 || policy.validator_fee_share > 100 {
            return Err(KvDecodeError::Invalid("gas fee policy"));
        }
        Ok(policy)
    }
}

/// Gas limits of a chain.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct GasLimits {
    /// Cap on the gas of one block.
    pub max_gas_per_block: u64,
    /// Cap on the budget of one request.
    pub max_gas_per_request: u64,
}

impl Default for GasLimits {
    fn default() -> Self {
        Self {
            max_gas_per_block: MAX_GAS_PER_BLOCK,
            max_gas_per_request: MAX_GAS_PER_REQUEST,
        }
    }
}

impl GasLimits {
    /// Stored form.
    pub fn to_bytes(&self) -> Vec<u8> {
        [
            self.max_gas_per_block.to_le_bytes(),
            self.max_gas_per_request.to_le_bytes(),
        ]
        .concat()
    }

    /// Parses the stored form.
    pub fn from_bytes(b: &[u8]) -> KvResult<Self> {
        if b.len() != 16 {
            return Err(KvDecodeError::WrongLength {
                what: "gas limits",
                expected: 16,
                got: b.len(),
            });
        }
        Ok(Self {
            max_gas_per_block: decode_u64(&b[..8])?,
            max_gas_per_request: decode_u64(&b[8..])?,
        })
    }
}

/// Gas burned by one request against its budget.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct GasMeter {
    budget: u64,
    burned: u64,
    log: BurnLog,
}

impl GasMeter {
    /// A meter allowing `budget` gas.
    pub fn new(budget: u64) -> Self {
        Self {
            budget,
            burned: 0,
            log: BurnLog::default(),
        }
    }

    /// Burns the cost of `code` for size `x`. Going over the budget burns the
    /// whole budget and fails.
    pub fn burn(&mut self, code: BurnCode, x: u64) -> VmResult<()> {
        let cost = code.cost(x);
        self.log.record(code, cost);
        match self.burned.checked_add(cost) {
            Some(total) if total <= self.budget => {
                self.burned = total;
                Ok(())
            }
            _ => {
                self.burned = self.budget;
                Err(VmError::GasLimitExceeded)
            }
        }
    }

    /// The budget.
    pub fn budget(&self) -> u64 {
        self.budget
    }

    /// Gas burned so far; never above the budget.
    pub fn burned(&self) -> u64 {
        self.burned
    }

    /// Every burn so far.
    pub fn log(&self) -> &BurnLog {
        &self.log
    }
}
