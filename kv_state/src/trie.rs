//! The hashed Patricia trie that commits to the chain state.
//!
//! Every state key is hashed with keccak and the 64-nibble hash is used as the
//! trie path, so paths have a fixed length and branch nodes never carry a
//! value. Nodes are immutable and shared through [`Arc`]; an update rebuilds
//! the path from the root to the touched leaf and reuses everything else,
//! which keeps cached node hashes valid.
//!
//! Node encoding and hashing follow the Ethereum rules (RLP, nodes shorter
//! than 32 bytes are inlined), so the root of an empty trie is
//! [`EMPTY_TRIE_HASH`](anchor_common::EMPTY_TRIE_HASH).

use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use enum_as_inner::EnumAsInner;
use ethereum_types::H256;
use keccak_hash::keccak;
use log::trace;
use rlp::RlpStream;

use crate::nibbles::{Nibble, Nibbles};

/// A shared trie node.
pub type WrappedNode = Arc<TrieNode>;

/// A node together with its lazily computed encoding.
#[derive(Debug)]
pub struct TrieNode {
    node: Node,
    encoded: OnceLock<EncodedNode>,
}

impl TrieNode {
    /// The node.
    pub fn node(&self) -> &Node {
        &self.node
    }

    fn encoded(&self) -> &EncodedNode {
        self.encoded.get_or_init(|| rlp_encode_and_hash_node(&self.node))
    }
}

impl From<Node> for WrappedNode {
    fn from(node: Node) -> Self {
        Arc::new(TrieNode {
            node,
            encoded: OnceLock::new(),
        })
    }
}

/// A node of the trie.
#[derive(Debug, EnumAsInner)]
pub enum Node {
    /// An empty subtree.
    Empty,
    /// A 16-way fork.
    Branch {
        /// One child per nibble.
        children: [WrappedNode; 16],
        /// Value ending exactly here; always empty for fixed-length paths.
        value: Vec<u8>,
    },
    /// A shared path segment.
    Extension {
        /// The segment.
        nibbles: Nibbles,
        /// Branch below the segment.
        child: WrappedNode,
    },
    /// The end of a path holding a value.
    Leaf {
        /// Remaining path.
        nibbles: Nibbles,
        /// Stored value.
        value: Vec<u8>,
    },
}

/// The node type used for calculating the hash of a trie.
#[derive(Clone, Debug, Hash)]
pub enum EncodedNode {
    /// Node that is RLPed but not hashed.
    Raw(Bytes),
    /// Node that is hashed.
    Hashed([u8; 32]),
}

impl From<&EncodedNode> for H256 {
    fn from(v: &EncodedNode) -> Self {
        match v {
            EncodedNode::Raw(b) => keccak(b),
            EncodedNode::Hashed(h) => H256(*h),
        }
    }
}

/// A trie over hashed keys.
#[derive(Clone, Debug)]
pub struct StateTrie {
    root: WrappedNode,
}

impl Default for StateTrie {
    fn default() -> Self {
        Self {
            root: Node::Empty.into(),
        }
    }
}

impl StateTrie {
    /// Path of `key` in the trie.
    pub fn path(key: &[u8]) -> Nibbles {
        Nibbles::from_bytes(keccak(key).as_bytes())
    }

    /// Inserts or replaces the value of `key`.
    pub fn insert(&mut self, key: &[u8], value: Vec<u8>) {
        self.root = insert_into_trie_rec(&self.root, Self::path(key), value);
    }

    /// Removes `key`, returning its value if it was present.
    pub fn delete(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        let (updated, value) = delete_intern(&self.root, Self::path(key))?;
        self.root = updated;
        Some(value)
    }

    /// The value of `key`.
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        let mut path = Self::path(key);
        let mut node = &self.root;
        loop {
            match node.node() {
                Node::Empty => return None,
                Node::Branch { children, value } => {
                    if path.is_empty() {
                        return (!value.is_empty()).then_some(value.as_slice());
                    }
                    node = &children[path.get_nibble(0) as usize];
                    path = path.truncate_n_nibbles_front(1);
                }
                Node::Extension { nibbles, child } => {
                    if !path.starts_with(nibbles) {
                        return None;
                    }
                    path = path.truncate_n_nibbles_front(nibbles.len());
                    node = child;
                }
                Node::Leaf { nibbles, value } => {
                    return (*nibbles == path).then_some(value.as_slice());
                }
            }
        }
    }

    /// The root hash.
    pub fn hash(&self) -> H256 {
        self.root.encoded().into()
    }

    /// The root node.
    pub fn root(&self) -> &WrappedNode {
        &self.root
    }
}

fn insert_into_trie_rec(node: &WrappedNode, path: Nibbles, value: Vec<u8>) -> WrappedNode {
    match node.node() {
        Node::Empty => {
            trace!("Insert traversed Empty");
            leaf(path, value)
        }
        Node::Branch { children, value: bv } => {
            if path.is_empty() {
                trace!("Insert traversed branch and placed value in node");
                return branch(children.clone(), value);
            }
            let nibble = path.get_nibble(0);
            trace!("Insert traversed Branch (nibble: {:x})", nibble);
            let mut updated = children.clone();
            updated[nibble as usize] = insert_into_trie_rec(
                &children[nibble as usize],
                path.truncate_n_nibbles_front(1),
                value,
            );
            branch(updated, bv.clone())
        }
        Node::Extension { nibbles, child } => {
            trace!("Insert traversed Extension (nibbles: {:?})", nibbles);
            let common = nibbles.common_prefix_len(&path);
            if common == nibbles.len() {
                return extension(
                    nibbles.clone(),
                    insert_into_trie_rec(child, path.truncate_n_nibbles_front(common), value),
                );
            }
            // The branch takes one nibble of the existing segment.
            let existing_rest = nibbles.truncate_n_nibbles_front(common + 1);
            let existing = match existing_rest.is_empty() {
                true => child.clone(),
                false => extension(existing_rest, child.clone()),
            };
            place_branch(
                nibbles.prefix(common),
                (nibbles.get_nibble(common), existing),
                path,
                value,
            )
        }
        Node::Leaf {
            nibbles,
            value: existing_value,
        } => {
            trace!("Insert traversed Leaf (nibbles: {:?})", nibbles);
            if *nibbles == path {
                return leaf(path, value);
            }
            let common = nibbles.common_prefix_len(&path);
            match nibbles.len() == common {
                // Only possible with variable-length paths.
                true => {
                    let mut children = new_branch_child_arr();
                    let nib = path.get_nibble(common);
                    children[nib as usize] = leaf(path.truncate_n_nibbles_front(common + 1), value);
                    with_prefix(nibbles.prefix(common), branch(children, existing_value.clone()))
                }
                false => place_branch(
                    nibbles.prefix(common),
                    (
                        nibbles.get_nibble(common),
                        leaf(
                            nibbles.truncate_n_nibbles_front(common + 1),
                            existing_value.clone(),
                        ),
                    ),
                    path,
                    value,
                ),
            }
        }
    }
}

/// Builds `prefix -> branch` where the branch holds `existing` at its nibble
/// and the new value at the nibble following `prefix` in `path`.
fn place_branch(
    prefix: Nibbles,
    existing: (Nibble, WrappedNode),
    path: Nibbles,
    value: Vec<u8>,
) -> WrappedNode {
    let mut children = new_branch_child_arr();
    children[existing.0 as usize] = existing.1;
    let common = prefix.len();
    let branch_value = match path.len() == common {
        true => value,
        false => {
            let nib = path.get_nibble(common);
            children[nib as usize] = leaf(path.truncate_n_nibbles_front(common + 1), value);
            Vec::new()
        }
    };
    with_prefix(prefix, branch(children, branch_value))
}

fn with_prefix(prefix: Nibbles, node: WrappedNode) -> WrappedNode {
    match prefix.is_empty() {
        true => node,
        false => extension(prefix, node),
    }
}

fn delete_intern(node: &WrappedNode, path: Nibbles) -> Option<(WrappedNode, Vec<u8>)> {
    match node.node() {
        Node::Empty => {
            trace!("Delete traversed Empty");
            None
        }
        Node::Branch { children, value } => {
            if path.is_empty() {
                return (!value.is_empty())
                    .then(|| (normalize_branch(children.clone(), Vec::new()), value.clone()));
            }
            let nibble = path.get_nibble(0);
            trace!("Delete traversed Branch nibble {:x}", nibble);
            let (updated_child, deleted) =
                delete_intern(&children[nibble as usize], path.truncate_n_nibbles_front(1))?;
            let mut updated = children.clone();
            updated[nibble as usize] = updated_child;
            Some((normalize_branch(updated, value.clone()), deleted))
        }
        Node::Extension { nibbles, child } => {
            trace!("Delete traversed Extension (nibbles: {:?})", nibbles);
            if !path.starts_with(nibbles) {
                return None;
            }
            let (updated_child, deleted) =
                delete_intern(child, path.truncate_n_nibbles_front(nibbles.len()))?;
            Some((collapse_ext_node_if_needed(nibbles, &updated_child), deleted))
        }
        Node::Leaf { nibbles, value } => {
            trace!("Delete traversed Leaf (nibbles: {:?})", nibbles);
            (*nibbles == path).then(|| (Node::Empty.into(), value.clone()))
        }
    }
}

/// Reduces a branch left with fewer than two entries.
fn normalize_branch(children: [WrappedNode; 16], value: Vec<u8>) -> WrappedNode {
    let occupied: Vec<usize> = (0..16).filter(|i| !node_is_empty(&children[*i])).collect();
    match (occupied.as_slice(), value.is_empty()) {
        ([], true) => Node::Empty.into(),
        ([], false) => leaf(Nibbles::default(), value),
        ([nib], true) => {
            trace!("Branch became an extension when collapsing a branch (slot {:x})", nib);
            collapse_ext_node_if_needed(&Nibbles::from_nibble(*nib as Nibble), &children[*nib])
        }
        _ => branch(children, value),
    }
}

fn collapse_ext_node_if_needed(ext_nibbles: &Nibbles, child: &WrappedNode) -> WrappedNode {
    match child.node() {
        Node::Empty => Node::Empty.into(),
        Node::Branch { .. } => extension(ext_nibbles.clone(), child.clone()),
        Node::Extension {
            nibbles: other,
            child: other_child,
        } => extension(ext_nibbles.merge_nibbles(other), other_child.clone()),
        Node::Leaf { nibbles, value } => leaf(ext_nibbles.merge_nibbles(nibbles), value.clone()),
    }
}

fn new_branch_child_arr() -> [WrappedNode; 16] {
    std::array::from_fn(|_| Node::Empty.into())
}

fn node_is_empty(node: &WrappedNode) -> bool {
    matches!(node.node(), Node::Empty)
}

fn branch(children: [WrappedNode; 16], value: Vec<u8>) -> WrappedNode {
    Node::Branch { children, value }.into()
}

fn extension(nibbles: Nibbles, child: WrappedNode) -> WrappedNode {
    Node::Extension { nibbles, child }.into()
}

fn leaf(nibbles: Nibbles, value: Vec<u8>) -> WrappedNode {
    Node::Leaf { nibbles, value }.into()
}

fn rlp_encode_and_hash_node(node: &Node) -> EncodedNode {
    match node {
        Node::Empty => EncodedNode::Raw(Bytes::from_static(&rlp::NULL_RLP)),
        Node::Branch { children, value } => {
            let mut stream = RlpStream::new_list(17);
            for c in children.iter() {
                append_to_stream(&mut stream, c.encoded());
            }
            match value.is_empty() {
                false => stream.append(value),
                true => stream.append_empty_data(),
            };
            hash_bytes_if_large_enough(stream.out().freeze())
        }
        Node::Extension { nibbles, child } => {
            let mut stream = RlpStream::new_list(2);
            stream.append(&nibbles.to_hex_prefix_encoding(false));
            append_to_stream(&mut stream, child.encoded());
            hash_bytes_if_large_enough(stream.out().freeze())
        }
        Node::Leaf { nibbles, value } => {
            let mut stream = RlpStream::new_list(2);
            stream.append(&nibbles.to_hex_prefix_encoding(true));
            stream.append(value);
            hash_bytes_if_large_enough(stream.out().freeze())
        }
    }
}

fn hash_bytes_if_large_enough(bytes: Bytes) -> EncodedNode {
    match bytes.len() >= 32 {
        false => EncodedNode::Raw(bytes),
        true => EncodedNode::Hashed(keccak(&bytes).0),
    }
}

fn append_to_stream(s: &mut RlpStream, node: &EncodedNode) {
    match node {
        EncodedNode::Raw(b) => s.append_raw(b, 1),
        EncodedNode::Hashed(h) => s.append(&h.as_ref()),
    };
}
