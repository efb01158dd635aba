//! Contracts of a chain and the table dispatching calls to their entry
//! points.
//!
//! Every contract owns the partition of the chain state under the four bytes
//! of its hname. The root contract maps deployed hnames to program hashes;
//! [`Processors`] maps program hashes to code. Core contracts are deployed
//! at origin like any other contract, so resolution is the same for all.

pub mod accounts;
pub mod blocklog;
pub mod errors;
pub mod evm;
pub mod governance;
pub mod inccounter;
pub mod root;

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use anchor_ledger::Packable;
use ethereum_types::H256;
use keccak_hash::keccak;
use kv_state::codec::{decode_or, KvResult};
use kv_state::{Dict, KvReader, SubRealm};
use tracing::error;

use crate::error::{VmError, VmResult};
use crate::hname::{Hname, HnameCollision, HnameRegistry};
use crate::sandbox::{Sandbox, ViewContext};

/// Name of the entry point called once when a contract is deployed.
pub const FUNC_INIT: &str = "init";

/// A mutating entry point.
pub type FuncHandler = fn(&mut Sandbox<'_>) -> VmResult<Dict>;

/// A read-only entry point.
pub type ViewHandler = fn(&ViewContext<'_>) -> VmResult<Dict>;

/// An entry point of a contract.
#[derive(Clone, Copy)]
pub enum EntryPoint {
    /// Runs in a full sandbox and may change state.
    Func(FuncHandler),
    /// Runs against a read-only view of the state.
    View(ViewHandler),
}

impl EntryPoint {
    /// Whether this is a view.
    pub fn is_view(&self) -> bool {
        matches!(self, EntryPoint::View(_))
    }
}

impl fmt::Debug for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryPoint::Func(_) => f.write_str("Func"),
            EntryPoint::View(_) => f.write_str("View"),
        }
    }
}

/// The code of a contract: its entry points by hname.
///
/// An entry point whose name hashes like an earlier, different name is not
/// added; the collision is kept and the program cannot be registered in
/// [`Processors`].
#[derive(Clone, Debug)]
pub struct Processor {
    name: &'static str,
    description: &'static str,
    entry_points: BTreeMap<Hname, (&'static str, EntryPoint)>,
    names: HnameRegistry,
    collision: Option<HnameCollision>,
}

impl Processor {
    /// A program without entry points.
    pub fn new(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            entry_points: BTreeMap::new(),
            names: HnameRegistry::default(),
            collision: None,
        }
    }

    /// Adds a mutating entry point.
    pub fn func(self, name: &'static str, handler: FuncHandler) -> Self {
        self.entry_point_named(name, EntryPoint::Func(handler))
    }

    /// Adds a view.
    pub fn view(self, name: &'static str, handler: ViewHandler) -> Self {
        self.entry_point_named(name, EntryPoint::View(handler))
    }

    fn entry_point_named(mut self, name: &'static str, entry_point: EntryPoint) -> Self {
        match self.names.register(name) {
            Ok(hname) => {
                self.entry_points.insert(hname, (name, entry_point));
            }
            Err(collision) => {
                self.collision.get_or_insert(collision);
            }
        }
        self
    }

    /// Fails if two entry point names share an hname.
    pub fn check(&self) -> Result<(), HnameCollision> {
        match &self.collision {
            Some(collision) => Err(collision.clone()),
            None => Ok(()),
        }
    }

    /// Name of the program.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Human-readable description.
    pub fn description(&self) -> &'static str {
        self.description
    }

    /// Identifies the program when deploying it.
    pub fn program_hash(&self) -> H256 {
        keccak(self.name.as_bytes())
    }

    /// Hname under which the program is deployed when named after itself.
    pub fn hname(&self) -> Hname {
        Hname::from_name(self.name)
    }

    /// The entry point `hname`.
    pub fn entry_point(&self, hname: Hname) -> Option<EntryPoint> {
        self.entry_points.get(&hname).map(|(_, ep)| *ep)
    }

    /// Names of all entry points, in hname order.
    pub fn entry_point_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entry_points.values().map(|(name, _)| *name)
    }
}

/// The contracts every chain has from its origin block.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum CoreContract {
    /// Contract registry.
    Root,
    /// L2 accounts.
    Accounts,
    /// Blocks, receipts and events.
    Blocklog,
    /// Chain owner, fees and controllers.
    Governance,
    /// Error templates.
    Errors,
    /// Emulated EVM.
    Evm,
}

impl CoreContract {
    /// All core contracts, in deployment order.
    pub const ALL: [CoreContract; 6] = [
        CoreContract::Root,
        CoreContract::Accounts,
        CoreContract::Blocklog,
        CoreContract::Governance,
        CoreContract::Errors,
        CoreContract::Evm,
    ];

    /// Name of the contract.
    pub const fn name(&self) -> &'static str {
        match self {
            CoreContract::Root => "root",
            CoreContract::Accounts => "accounts",
            CoreContract::Blocklog => "blocklog",
            CoreContract::Governance => "governance",
            CoreContract::Errors => "errors",
            CoreContract::Evm => "evm",
        }
    }

    /// Hname of the contract.
    pub fn hname(&self) -> Hname {
        Hname::from_name(self.name())
    }

    /// Code of the contract.
    pub fn processor(&self) -> Processor {
        match self {
            CoreContract::Root => root::processor(),
            CoreContract::Accounts => accounts::processor(),
            CoreContract::Blocklog => blocklog::processor(),
            CoreContract::Governance => governance::processor(),
            CoreContract::Errors => errors::processor(),
            CoreContract::Evm => evm::processor(),
        }
    }
}

/// Programs a node can run, by program hash.
#[derive(Clone, Debug)]
pub struct Processors(HashMap<H256, Processor>);

impl Default for Processors {
    fn default() -> Self {
        Self::new()
    }
}

impl Processors {
    /// The core contracts and the example programs.
    pub fn new() -> Self {
        let mut ret = Self(HashMap::new());
        let builtin = CoreContract::ALL
            .iter()
            .map(CoreContract::processor)
            .chain([inccounter::processor()]);
        for processor in builtin {
            let name = processor.name();
            if let Err(e) = ret.register(processor) {
                error!("built-in program {name} not registered: {e}");
            }
        }
        ret
    }

    /// Makes `processor` deployable. A program with colliding entry point
    /// names is refused.
    pub fn register(&mut self, processor: Processor) -> Result<(), HnameCollision> {
        processor.check()?;
        self.0.insert(processor.program_hash(), processor);
        Ok(())
    }

    /// The program with `program_hash`.
    pub fn get(&self, program_hash: &H256) -> Option<&Processor> {
        self.0.get(program_hash)
    }

    /// The program deployed under `contract` on the chain with `state`.
    pub fn resolve<S: KvReader + ?Sized>(
        &self,
        state: &S,
        contract: Hname,
    ) -> VmResult<&Processor> {
        let root_state = partition(state, CoreContract::Root.hname());
        let record = root::find_contract(&root_state, contract)?
            .ok_or(VmError::ContractNotFound(contract))?;
        self.get(&record.program_hash)
            .ok_or(VmError::ContractNotFound(contract))
    }
}

/// The partition of `contract` in the chain state.
pub fn partition<S: KvReader + ?Sized>(state: &S, contract: Hname) -> SubRealm<&S> {
    SubRealm::new(state, contract.to_bytes())
}

/// The partition of `contract`, writable.
pub fn partition_mut<S: ?Sized>(state: &mut S, contract: Hname) -> SubRealm<&mut S> {
    SubRealm::new(state, contract.to_bytes())
}

/// A required parameter.
pub fn param(params: &Dict, key: &str) -> VmResult<Vec<u8>> {
    params
        .get(key.as_bytes())
        .ok_or_else(|| VmError::InvalidParam(format!("missing {key}")))
}

/// A required parameter decoded with `f`.
pub fn param_with<T>(
    params: &Dict,
    key: &str,
    f: impl FnOnce(&[u8]) -> KvResult<T>,
) -> VmResult<T> {
    f(&param(params, key)?).map_err(|e| VmError::InvalidParam(format!("{key}: {e}")))
}

/// A required parameter in its ledger binary form.
pub fn param_packed<T: Packable>(params: &Dict, key: &str) -> VmResult<T> {
    T::from_bytes(&param(params, key)?).map_err(|e| VmError::InvalidParam(format!("{key}: {e}")))
}

/// An optional parameter decoded with `f`, `default` when absent.
pub fn param_or<T>(
    params: &Dict,
    key: &str,
    default: T,
    f: impl FnOnce(&[u8]) -> KvResult<T>,
) -> VmResult<T> {
    decode_or(params.get(key.as_bytes()), default, f)
        .map_err(|e| VmError::InvalidParam(format!("{key}: {e}")))
}
