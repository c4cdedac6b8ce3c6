//! Merkle-ised signer tree of a wallet configuration.
//!
//! Leaves hash into the wallet's image hash; the same tree, with owner leaves swapped for
//! their signatures, is serialised into the wallet signature.

use ethers::types::{Address, H256, U256};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How an ECDSA signature was produced over the subdigest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SignatureType {
    /// Signed over the raw subdigest.
    Eip712 = 1,
    /// Signed over the EIP-191 prefixed subdigest (`personal_sign`).
    EthSign = 2,
}

impl SignatureType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(SignatureType::Eip712),
            2 => Some(SignatureType::EthSign),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum SignatureLeaf {
    /// Owner that has signed.
    Ecdsa {
        address: Address,
        weight: u8,
        signature: Vec<u8>,
        signature_type: SignatureType,
    },
    /// Owner without a signature; contributes its leaf hash only.
    Address { address: Address, weight: u8 },
    /// Pre-hashed subtree.
    Node { hash: H256 },
    /// Digest that is always considered signed.
    Subdigest { hash: H256 },
    /// Nested configuration with its own threshold.
    Nested {
        weight: u8,
        threshold: u16,
        tree: Box<SignerNode>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SignerNode {
    Empty,
    Leaf(SignatureLeaf),
    Branch(Box<SignerNode>, Box<SignerNode>),
}

/// `(weight << 160) | address`
pub fn leaf_for_address_and_weight(address: Address, weight: u8) -> H256 {
    let v = (U256::from(weight) << 160) | U256::from_big_endian(address.as_bytes());
    let mut out = [0u8; 32];
    v.to_big_endian(&mut out);
    H256(out)
}

pub fn leaf_for_nested(internal_root: H256, internal_threshold: u16, external_weight: u8) -> H256 {
    let mut buf = Vec::with_capacity(24 + 96);
    buf.extend_from_slice(b"Sequence nested config:\n");
    buf.extend_from_slice(internal_root.as_bytes());
    buf.extend_from_slice(&left_pad32(&internal_threshold.to_be_bytes()));
    buf.extend_from_slice(&left_pad32(&[external_weight]));
    H256(keccak256(buf))
}

pub fn leaf_for_static_digest(digest: H256) -> H256 {
    let mut buf = Vec::with_capacity(24 + 32);
    buf.extend_from_slice(b"Sequence static digest:\n");
    buf.extend_from_slice(digest.as_bytes());
    H256(keccak256(buf))
}

fn hash_pair(left: H256, right: H256) -> H256 {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left.as_bytes());
    buf[32..].copy_from_slice(right.as_bytes());
    H256(keccak256(buf))
}

fn left_pad32(b: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[32 - b.len()..].copy_from_slice(b);
    out
}

impl SignatureLeaf {
    pub fn hash(&self) -> H256 {
        match self {
            SignatureLeaf::Ecdsa {
                address, weight, ..
            }
            | SignatureLeaf::Address { address, weight } => {
                leaf_for_address_and_weight(*address, *weight)
            }
            SignatureLeaf::Node { hash } => *hash,
            SignatureLeaf::Subdigest { hash } => leaf_for_static_digest(*hash),
            SignatureLeaf::Nested {
                weight,
                threshold,
                tree,
            } => leaf_for_nested(tree.hash(), *threshold, *weight),
        }
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            SignatureLeaf::Ecdsa {
                weight,
                signature,
                signature_type,
                ..
            } => {
                out.push(0x00);
                out.push(*weight);
                out.extend_from_slice(signature);
                out.push(*signature_type as u8);
            }
            SignatureLeaf::Address { address, weight } => {
                out.push(0x01);
                out.push(*weight);
                out.extend_from_slice(address.as_bytes());
            }
            SignatureLeaf::Node { hash } => {
                out.push(0x03);
                out.extend_from_slice(hash.as_bytes());
            }
            SignatureLeaf::Subdigest { hash } => {
                out.push(0x05);
                out.extend_from_slice(hash.as_bytes());
            }
            SignatureLeaf::Nested {
                weight,
                threshold,
                tree,
            } => {
                let inner = tree.encode();
                out.push(0x06);
                out.push(*weight);
                out.extend_from_slice(&threshold.to_be_bytes());
                push_u24(out, inner.len());
                out.extend_from_slice(&inner);
            }
        }
    }
}

/// Largest part a u24 length prefix can describe.
pub const MAX_PART_LEN: usize = 0xFF_FFFF;

fn push_u24(out: &mut Vec<u8>, len: usize) {
    debug_assert!(len <= MAX_PART_LEN, "signature part of {len} bytes exceeds a u24 length");
    let b = (len as u32).to_be_bytes();
    out.extend_from_slice(&b[1..]);
}

impl SignerNode {
    pub fn address(address: Address, weight: u8) -> Self {
        SignerNode::Leaf(SignatureLeaf::Address { address, weight })
    }

    pub fn hash(&self) -> H256 {
        match self {
            SignerNode::Empty => H256::zero(),
            SignerNode::Leaf(leaf) => leaf.hash(),
            SignerNode::Branch(left, right) => hash_pair(left.hash(), right.hash()),
        }
    }

    /// Leaves in signature order (left to right). Nested trees are not descended.
    pub fn leaves(&self) -> Vec<&SignatureLeaf> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a SignatureLeaf>) {
        match self {
            SignerNode::Empty => {}
            SignerNode::Leaf(leaf) => out.push(leaf),
            SignerNode::Branch(left, right) => {
                left.collect_leaves(out);
                right.collect_leaves(out);
            }
        }
    }

    /// Swaps every owner leaf that has a signature in `signed` for an ECDSA leaf.
    ///
    /// Returns how many leaves were replaced.
    pub fn replace_signed(&mut self, signed: &BTreeMap<Address, (Vec<u8>, SignatureType)>) -> usize {
        match self {
            SignerNode::Empty => 0,
            SignerNode::Branch(left, right) => {
                left.replace_signed(signed) + right.replace_signed(signed)
            }
            SignerNode::Leaf(SignatureLeaf::Nested { tree, .. }) => tree.replace_signed(signed),
            SignerNode::Leaf(leaf) => {
                let SignatureLeaf::Address { address, weight } = leaf else {
                    return 0;
                };
                let Some((signature, signature_type)) = signed.get(address) else {
                    return 0;
                };
                *leaf = SignatureLeaf::Ecdsa {
                    address: *address,
                    weight: *weight,
                    signature: signature.clone(),
                    signature_type: *signature_type,
                };
                1
            }
        }
    }

    /// Serialises the tree the way the wallet's signature decoder folds it back: the left
    /// spine is emitted leaf by leaf, any right-hand subtree as a branch part.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            SignerNode::Empty => SignatureLeaf::Node { hash: H256::zero() }.encode_into(out),
            SignerNode::Leaf(leaf) => leaf.encode_into(out),
            SignerNode::Branch(left, right) => {
                left.encode_into(out);
                match right.as_ref() {
                    SignerNode::Branch(..) => {
                        let inner = right.encode();
                        out.push(0x04);
                        push_u24(out, inner.len());
                        out.extend_from_slice(&inner);
                    }
                    other => other.encode_into(out),
                }
            }
        }
    }
}

/// Folds members left to right: `(((m0, m1), m2), m3)`.
pub fn rooted_node_builder(members: Vec<SignerNode>) -> Option<SignerNode> {
    let mut iter = members.into_iter();
    let mut acc = iter.next()?;
    for member in iter {
        acc = SignerNode::Branch(Box::new(acc), Box::new(member));
    }
    Some(acc)
}
