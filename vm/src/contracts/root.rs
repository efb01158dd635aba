//! The `root` contract: registry of the contracts deployed on the chain.

use anchor_ledger::codec::{read_array, read_bytes_u16, write_bytes_u16};
use anchor_ledger::{CodecError, CodecResult, Packable};
use bytes::{Buf, BufMut};
use ethereum_types::H256;
use kv_state::codec::{decode_bool, decode_string, encode_bool};
use kv_state::kv::key_join;
use kv_state::{Dict, KvReader, KvStore, KvWriter};
use serde::{Deserialize, Serialize};

use super::{governance, param, param_or, param_with, CoreContract, Processor};
use crate::agent::AgentId;
use crate::error::{VmError, VmResult};
use crate::hname::Hname;
use crate::sandbox::{Sandbox, ViewContext};

/// Deploys a program. Only the chain owner may deploy.
pub const FUNC_DEPLOY_CONTRACT: &str = "deploy_contract";
/// Looks a contract up by hname.
pub const VIEW_FIND_CONTRACT: &str = "find_contract";
/// Lists every deployed contract.
pub const VIEW_GET_CONTRACT_RECORDS: &str = "get_contract_records";

/// Program hash, 32 bytes.
pub const PARAM_PROGRAM_HASH: &str = "ph";
/// Name of the new contract.
pub const PARAM_NAME: &str = "nm";
/// Description of the new contract.
pub const PARAM_DESCRIPTION: &str = "ds";
/// Hname of a contract.
pub const PARAM_HNAME: &str = "hn";
/// Whether the contract was found.
pub const PARAM_CONTRACT_FOUND: &str = "cf";
/// Packed [`ContractRecord`].
pub const PARAM_CONTRACT_RECORD: &str = "dt";

const KEY_CONTRACTS: &[u8] = b"r";

/// A deployed contract.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct ContractRecord {
    /// The program it runs.
    pub program_hash: H256,
    /// Name; its hname is the contract's hname.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Who deployed it.
    pub deployer: AgentId,
}

impl Packable for ContractRecord {
    fn pack<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(self.program_hash.as_bytes());
        write_bytes_u16(buf, self.name.as_bytes());
        write_bytes_u16(buf, self.description.as_bytes());
        self.deployer.pack(buf);
    }

    fn unpack<B: Buf>(buf: &mut B) -> CodecResult<Self> {
        let program_hash = H256(read_array(buf)?);
        let utf8 = |b: Vec<u8>| {
            String::from_utf8(b).map_err(|_| CodecError::Invalid("contract name".into()))
        };
        Ok(Self {
            program_hash,
            name: utf8(read_bytes_u16(buf)?)?,
            description: utf8(read_bytes_u16(buf)?)?,
            deployer: AgentId::unpack(buf)?,
        })
    }
}

fn contract_key(hname: Hname) -> Vec<u8> {
    key_join(&[KEY_CONTRACTS, &hname.to_bytes()])
}

/// Adds a contract to the registry. Hnames are never reused.
pub fn register_contract<S: KvStore + ?Sized>(
    state: &mut S,
    hname: Hname,
    record: &ContractRecord,
) -> VmResult<()> {
    let key = contract_key(hname);
    if state.has(&key) {
        return Err(VmError::InvalidParam(format!(
            "contract {hname} ({}) already exists",
            record.name
        )));
    }
    state.set(&key, &record.to_bytes());
    Ok(())
}

/// The contract deployed under `hname`.
pub fn find_contract<S: KvReader + ?Sized>(
    state: &S,
    hname: Hname,
) -> VmResult<Option<ContractRecord>> {
    state
        .get(&contract_key(hname))
        .map(|b| ContractRecord::from_bytes(&b))
        .transpose()
        .map_err(Into::into)
}

/// Every deployed contract, in hname byte order.
pub fn get_contract_records<S: KvReader + ?Sized>(
    state: &S,
) -> VmResult<Vec<(Hname, ContractRecord)>> {
    let mut ret = Vec::new();
    for (k, v) in state.entries(KEY_CONTRACTS) {
        let hname = Hname::from_bytes(&k[KEY_CONTRACTS.len()..])?;
        ret.push((hname, ContractRecord::from_bytes(&v)?));
    }
    Ok(ret)
}

fn deploy_contract(ctx: &mut Sandbox<'_>) -> VmResult<Dict> {
    let owner = governance::chain_owner(&ctx.partition(CoreContract::Governance))?;
    ctx.require_caller(&owner)?;

    let params = ctx.params().clone();
    let raw = param(&params, PARAM_PROGRAM_HASH)?;
    if raw.len() != 32 {
        return Err(VmError::InvalidParam(PARAM_PROGRAM_HASH.into()));
    }
    let name = param_with(&params, PARAM_NAME, decode_string)?;
    let description = param_or(&params, PARAM_DESCRIPTION, String::new(), decode_string)?;
    let mut init_params = params.clone();
    for k in [PARAM_PROGRAM_HASH, PARAM_NAME, PARAM_DESCRIPTION] {
        init_params.del(k.as_bytes());
    }
    let hname = ctx.deploy(H256::from_slice(&raw), &name, &description, init_params)?;
    ctx.event(format!("deployed contract {name} as {hname}"))?;
    Ok(Dict::new().with(PARAM_HNAME, hname.to_bytes()))
}

fn view_find_contract(ctx: &ViewContext<'_>) -> VmResult<Dict> {
    let hname = param_with(ctx.params(), PARAM_HNAME, Hname::from_bytes)?;
    Ok(match find_contract(&ctx.state_reader(), hname)? {
        Some(r) => Dict::new()
            .with(PARAM_CONTRACT_FOUND, encode_bool(true))
            .with(PARAM_CONTRACT_RECORD, r.to_bytes()),
        None => Dict::new().with(PARAM_CONTRACT_FOUND, encode_bool(false)),
    })
}

fn view_get_contract_records(ctx: &ViewContext<'_>) -> VmResult<Dict> {
    Ok(get_contract_records(&ctx.state_reader())?
        .into_iter()
        .map(|(h, r)| (h.to_bytes().to_vec(), r.to_bytes()))
        .collect())
}

/// Whether a `find_contract` result reports a contract.
pub fn found(result: &Dict) -> VmResult<bool> {
    param_or(result, PARAM_CONTRACT_FOUND, false, decode_bool)
}

pub(crate) fn processor() -> Processor {
    Processor::new(CoreContract::Root.name(), "Root contract")
        .func(FUNC_DEPLOY_CONTRACT, deploy_contract)
        .view(VIEW_FIND_CONTRACT, view_find_contract)
        .view(VIEW_GET_CONTRACT_RECORDS, view_get_contract_records)
}

#[cfg(test)]
mod tests {
    use anchor_ledger::{Address, Ed25519Address};
    use keccak_hash::keccak;

    use super::*;

    fn record(name: &str) -> ContractRecord {
        ContractRecord {
            program_hash: keccak(name.as_bytes()),
            name: name.to_string(),
            description: format!("{name} program"),
            deployer: AgentId::Address(Address::Ed25519(Ed25519Address([1; 32]))),
        }
    }

    #[test]
    fn registry_refuses_duplicates() {
        let mut state = Dict::new();
        let h = Hname::from_name("inccounter");
        register_contract(&mut state, h, &record("inccounter")).unwrap();
        assert!(matches!(
            register_contract(&mut state, h, &record("other")),
            Err(VmError::InvalidParam(_))
        ));
        assert_eq!(find_contract(&state, h).unwrap(), Some(record("inccounter")));
        assert_eq!(find_contract(&state, Hname::from_name("nope")).unwrap(), None);

        register_contract(&mut state, Hname::from_name("evm"), &record("evm")).unwrap();
        assert_eq!(get_contract_records(&state).unwrap().len(), 2);
    }
}
