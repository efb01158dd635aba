//! Transactions and the blocks that carry them to the ledger.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut};
use ethereum_types::U256;
use keccak_hash::keccak;
use serde::{Deserialize, Serialize};

use crate::codec::{read_array, read_u16, read_u32, read_u64, read_u8, CodecError, CodecResult, Packable};
use crate::ids::{BlockId, OutputId, TokenId, TransactionId};
use crate::output::Output;

const ESSENCE_KIND: u8 = 1;
const UTXO_INPUT_KIND: u8 = 0;
const TRANSACTION_PAYLOAD_KIND: u32 = 6;
const ED25519_SIGNATURE_KIND: u8 = 0;

/// Commits to the exact outputs a transaction consumes, in input order.
pub fn inputs_commitment<'a>(consumed: impl IntoIterator<Item = &'a Output>) -> [u8; 32] {
    let mut concat = Vec::new();
    for out in consumed {
        concat.extend_from_slice(keccak(out.to_bytes()).as_bytes());
    }
    keccak(concat).0
}

/// The signed part of a transaction.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct TransactionEssence {
    /// Target ledger network.
    pub network_id: u64,
    /// Consumed outputs.
    pub inputs: Vec<OutputId>,
    /// See [`inputs_commitment`].
    pub inputs_commitment: [u8; 32],
    /// Produced outputs.
    pub outputs: Vec<Output>,
}

impl TransactionEssence {
    /// The message the unlocks sign.
    pub fn signing_message(&self) -> [u8; 32] {
        keccak(self.to_bytes()).0
    }

    /// Sum of base tokens over all outputs.
    pub fn output_base_tokens(&self) -> u128 {
        self.outputs.iter().map(|o| o.amount() as u128).sum()
    }

    /// Per-token sums over all outputs.
    pub fn output_native_tokens(&self) -> BTreeMap<TokenId, U256> {
        let mut ret = BTreeMap::<TokenId, U256>::new();
        for nt in self.outputs.iter().flat_map(|o| o.native_tokens().iter()) {
            let e = ret.entry(nt.id).or_default();
            *e = e.saturating_add(nt.amount);
        }
        ret
    }
}

impl Packable for TransactionEssence {
    fn pack<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(ESSENCE_KIND);
        buf.put_u64_le(self.network_id);
        buf.put_u16_le(self.inputs.len() as u16);
        for input in &self.inputs {
            buf.put_u8(UTXO_INPUT_KIND);
            input.pack(buf);
        }
        buf.put_slice(&self.inputs_commitment);
        buf.put_u16_le(self.outputs.len() as u16);
        for out in &self.outputs {
            out.pack(buf);
        }
        // No tagged-data payload.
        buf.put_u32_le(0);
    }

    fn unpack<B: Buf>(buf: &mut B) -> CodecResult<Self> {
        match read_u8(buf)? {
            ESSENCE_KIND => {}
            kind => {
                return Err(CodecError::UnknownKind {
                    what: "essence",
                    kind,
                })
            }
        }
        let network_id = read_u64(buf)?;
        let inputs_count = read_u16(buf)?;
        let mut inputs = Vec::with_capacity(inputs_count as usize);
        for _ in 0..inputs_count {
            match read_u8(buf)? {
                UTXO_INPUT_KIND => inputs.push(OutputId::unpack(buf)?),
                kind => {
                    return Err(CodecError::UnknownKind {
                        what: "input",
                        kind,
                    })
                }
            }
        }
        let inputs_commitment = read_array(buf)?;
        let outputs_count = read_u16(buf)?;
        let mut outputs = Vec::with_capacity(outputs_count as usize);
        for _ in 0..outputs_count {
            outputs.push(Output::unpack(buf)?);
        }
        match read_u32(buf)? {
            0 => {}
            n => return Err(CodecError::Invalid(format!("unexpected payload of {n} bytes"))),
        }
        Ok(Self {
            network_id,
            inputs,
            inputs_commitment,
            outputs,
        })
    }
}

/// An Ed25519 public key with a signature made by it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Ed25519Signature {
    /// The public key.
    pub public_key: [u8; 32],
    /// The signature.
    pub signature: [u8; 64],
}

impl Packable for Ed25519Signature {
    fn pack<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(ED25519_SIGNATURE_KIND);
        buf.put_slice(&self.public_key);
        buf.put_slice(&self.signature);
    }

    fn unpack<B: Buf>(buf: &mut B) -> CodecResult<Self> {
        match read_u8(buf)? {
            ED25519_SIGNATURE_KIND => Ok(Self {
                public_key: read_array(buf)?,
                signature: read_array(buf)?,
            }),
            kind => Err(CodecError::UnknownKind {
                what: "signature",
                kind,
            }),
        }
    }
}

/// Proves the right to consume an input.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Unlock {
    /// A signature over the essence.
    Signature(Ed25519Signature),
    /// Reuses the signature unlock at the given index.
    Reference(u16),
    /// Unlocked by the alias consumed at the given index.
    Alias(u16),
    /// Unlocked by the NFT consumed at the given index.
    Nft(u16),
}

impl Packable for Unlock {
    fn pack<B: BufMut>(&self, buf: &mut B) {
        match self {
            Unlock::Signature(sig) => {
                buf.put_u8(0);
                sig.pack(buf);
            }
            Unlock::Reference(i) => {
                buf.put_u8(1);
                buf.put_u16_le(*i);
            }
            Unlock::Alias(i) => {
                buf.put_u8(2);
                buf.put_u16_le(*i);
            }
            Unlock::Nft(i) => {
                buf.put_u8(3);
                buf.put_u16_le(*i);
            }
        }
    }

    fn unpack<B: Buf>(buf: &mut B) -> CodecResult<Self> {
        Ok(match read_u8(buf)? {
            0 => Unlock::Signature(Ed25519Signature::unpack(buf)?),
            1 => Unlock::Reference(read_u16(buf)?),
            2 => Unlock::Alias(read_u16(buf)?),
            3 => Unlock::Nft(read_u16(buf)?),
            kind => {
                return Err(CodecError::UnknownKind {
                    what: "unlock",
                    kind,
                })
            }
        })
    }
}

/// A signed transaction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transaction {
    /// What the transaction does.
    pub essence: TransactionEssence,
    /// One unlock per input.
    pub unlocks: Vec<Unlock>,
}

impl Transaction {
    /// Hash of the packed transaction.
    pub fn id(&self) -> TransactionId {
        TransactionId(keccak(self.to_bytes()).0)
    }

    /// Iterates produced outputs with their ids.
    pub fn outputs_with_ids(&self) -> impl Iterator<Item = (OutputId, &Output)> + '_ {
        let tx_id = self.id();
        self.essence
            .outputs
            .iter()
            .enumerate()
            .map(move |(i, o)| (OutputId::new(tx_id, i as u16), o))
    }
}

impl Packable for Transaction {
    fn pack<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(TRANSACTION_PAYLOAD_KIND);
        self.essence.pack(buf);
        buf.put_u16_le(self.unlocks.len() as u16);
        for u in &self.unlocks {
            u.pack(buf);
        }
    }

    fn unpack<B: Buf>(buf: &mut B) -> CodecResult<Self> {
        match read_u32(buf)? {
            TRANSACTION_PAYLOAD_KIND => {}
            kind => {
                return Err(CodecError::UnknownKind {
                    what: "payload",
                    kind: kind as u8,
                })
            }
        }
        let essence = TransactionEssence::unpack(buf)?;
        let count = read_u16(buf)?;
        let mut unlocks = Vec::with_capacity(count as usize);
        for _ in 0..count {
            unlocks.push(Unlock::unpack(buf)?);
        }
        if unlocks.len() != essence.inputs.len() {
            return Err(CodecError::Invalid(format!(
                "{} unlocks for {} inputs",
                unlocks.len(),
                essence.inputs.len()
            )));
        }
        Ok(Self { essence, unlocks })
    }
}

/// The ledger message wrapping a transaction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Block {
    /// Protocol version of the ledger.
    pub protocol_version: u8,
    /// Blocks this one approves; chosen by the ledger node.
    pub parents: Vec<BlockId>,
    /// The transaction.
    pub payload: Transaction,
    /// Proof-of-work nonce; chosen by the ledger node.
    pub nonce: u64,
}

impl Block {
    /// Wraps `tx` for posting; parents and nonce are filled in by the node.
    pub fn new(protocol_version: u8, tx: Transaction) -> Self {
        Self {
            protocol_version,
            parents: Vec::new(),
            payload: tx,
            nonce: 0,
        }
    }

    /// Hash of the packed block.
    pub fn id(&self) -> BlockId {
        BlockId(keccak(self.to_bytes()).0)
    }
}

impl Packable for Block {
    fn pack<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.protocol_version);
        buf.put_u8(self.parents.len() as u8);
        for p in &self.parents {
            p.pack(buf);
        }
        let payload = self.payload.to_bytes();
        buf.put_u32_le(payload.len() as u32);
        buf.put_slice(&payload);
        buf.put_u64_le(self.nonce);
    }

    fn unpack<B: Buf>(buf: &mut B) -> CodecResult<Self> {
        let protocol_version = read_u8(buf)?;
        let count = read_u8(buf)?;
        let mut parents = Vec::with_capacity(count as usize);
        for _ in 0..count {
            parents.push(BlockId::unpack(buf)?);
        }
        let payload_len = read_u32(buf)? as usize;
        crate::codec::ensure_remaining(buf, payload_len)?;
        let mut payload_bytes = vec![0; payload_len];
        buf.copy_to_slice(&mut payload_bytes);
        Ok(Self {
            protocol_version,
            parents,
            payload: Transaction::from_bytes(&payload_bytes)?,
            nonce: read_u64(buf)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{Address, Ed25519Address};
    use crate::output::{BasicOutput, UnlockCondition, UnlockConditions};

    fn essence() -> TransactionEssence {
        let out = Output::Basic(BasicOutput {
            amount: 1_000,
            unlock_conditions: UnlockConditions::new().with(UnlockCondition::Address(
                Address::Ed25519(Ed25519Address([1; 32])),
            )),
            ..Default::default()
        });
        TransactionEssence {
            network_id: 5,
            inputs: vec![OutputId::new(TransactionId([3; 32]), 1)],
            inputs_commitment: inputs_commitment([&out]),
            outputs: vec![out],
        }
    }

    #[test]
    fn transaction_requires_one_unlock_per_input() {
        let tx = Transaction {
            essence: essence(),
            unlocks: vec![],
        };
        assert!(matches!(
            Transaction::from_bytes(&tx.to_bytes()),
            Err(CodecError::Invalid(_))
        ));
    }

    #[test]
    fn block_carries_transaction() {
        let tx = Transaction {
            essence: essence(),
            unlocks: vec![Unlock::Signature(Ed25519Signature {
                public_key: [8; 32],
                signature: [9; 64],
            })],
        };
        let block = Block::new(2, tx.clone());
        let back = Block::from_bytes(&block.to_bytes()).unwrap();
        assert_eq!(back.payload.id(), tx.id());
        assert_eq!(back.id(), block.id());
    }

    #[test]
    fn inputs_commitment_depends_on_order() {
        let a = Output::Basic(BasicOutput {
            amount: 1,
            ..Default::default()
        });
        let b = Output::Basic(BasicOutput {
            amount: 2,
            ..Default::default()
        });
        assert_ne!(inputs_commitment([&a, &b]), inputs_commitment([&b, &a]));
    }
}
