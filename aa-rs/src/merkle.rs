//! Sorted-pair keccak merkle tree over user operation hashes.
//!
//! Pairs are ordered before hashing so proofs verify without knowing left/right; an odd
//! node at the end of a layer is promoted unchanged.

use ethers::types::H256;
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MerkleProof {
    pub leaf: H256,
    pub siblings: Vec<H256>,
    /// 0 = sibling is on the left, 1 = sibling is on the right.
    pub path_indices: Vec<u8>,
    pub root: H256,
}

#[derive(Clone, Debug)]
pub struct MerkleTree {
    layers: Vec<Vec<H256>>,
}

pub fn hash_pair(a: &H256, b: &H256) -> H256 {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(lo.as_bytes());
    buf[32..].copy_from_slice(hi.as_bytes());
    H256(keccak256(buf))
}

impl MerkleTree {
    /// Builds every layer up front. Leaves are used in the given order.
    pub fn from_leaves(leaves: Vec<H256>) -> Self {
        let mut layers = vec![leaves];
        while layers.last().map(|l| l.len() > 1).unwrap_or(false) {
            let current = &layers[layers.len() - 1];
            let next = current
                .chunks(2)
                .map(|pair| match pair {
                    [a, b] => hash_pair(a, b),
                    [a] => *a,
                    _ => unreachable!("chunks(2) yields one or two items"),
                })
                .collect();
            layers.push(next);
        }
        Self { layers }
    }

    pub fn leaves(&self) -> &[H256] {
        &self.layers[0]
    }

    /// Root of the tree; zero for an empty tree.
    pub fn root(&self) -> H256 {
        self.layers
            .last()
            .and_then(|l| l.first())
            .copied()
            .unwrap_or_default()
    }

    pub fn create_proof(&self, leaf: &H256) -> Option<MerkleProof> {
        let mut index = self.leaves().iter().position(|x| x == leaf)?;
        let mut siblings = Vec::new();
        let mut path_indices = Vec::new();

        for layer in &self.layers[..self.layers.len() - 1] {
            if index % 2 == 0 {
                if let Some(sibling) = layer.get(index + 1) {
                    siblings.push(*sibling);
                    path_indices.push(1);
                }
            } else {
                siblings.push(layer[index - 1]);
                path_indices.push(0);
            }
            index /= 2;
        }

        Some(MerkleProof {
            leaf: *leaf,
            siblings,
            path_indices,
            root: self.root(),
        })
    }

    pub fn verify_proof(proof: &MerkleProof) -> bool {
        if proof.siblings.len() != proof.path_indices.len() {
            return false;
        }
        let computed = proof
            .siblings
            .iter()
            .fold(proof.leaf, |acc, sibling| hash_pair(&acc, sibling));
        computed == proof.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::U256;

    fn leaf(i: u64) -> H256 {
        let mut b = [0u8; 32];
        U256::from(i).to_big_endian(&mut b);
        H256(b)
    }

    fn hex_leaf(s: &str) -> H256 {
        s.parse().unwrap()
    }

    #[test]
    fn single_leaf_is_root() {
        let tree = MerkleTree::from_leaves(vec![leaf(1)]);
        assert_eq!(tree.root(), leaf(1));
        let proof = tree.create_proof(&leaf(1)).unwrap();
        assert!(proof.siblings.is_empty());
        assert!(MerkleTree::verify_proof(&proof));
    }

    #[test]
    fn known_roots() {
        let two = MerkleTree::from_leaves(vec![leaf(1), leaf(2)]);
        assert_eq!(
            two.root(),
            hex_leaf("0xe90b7bceb6e7df5418fb78d8ee546e97c83a08bbccc01a0644d599ccd2a7c2e0")
        );
        let three = MerkleTree::from_leaves(vec![leaf(1), leaf(2), leaf(3)]);
        assert_eq!(
            three.root(),
            hex_leaf("0x9b0225f2c6f59eeaf8302811ea290e95258763189b82dc033158e99a6ef45a87")
        );
    }

    #[test]
    fn proofs_verify_for_every_leaf() {
        for n in [2u64, 5, 16, 100] {
            let tree = MerkleTree::from_leaves((0..n).map(leaf).collect());
            for i in 0..n {
                let proof = tree.create_proof(&leaf(i)).unwrap();
                assert!(MerkleTree::verify_proof(&proof), "n={n} i={i}");
            }
        }
    }

    #[test]
    fn tampered_proof_fails() {
        let tree = MerkleTree::from_leaves((0..4).map(leaf).collect());
        let mut proof = tree.create_proof(&leaf(2)).unwrap();
        proof.leaf = leaf(9);
        assert!(!MerkleTree::verify_proof(&proof));
        assert!(tree.create_proof(&leaf(9)).is_none());
    }

    #[test]
    fn empty_tree_has_zero_root() {
        let tree = MerkleTree::from_leaves(Vec::new());
        assert_eq!(tree.root(), H256::zero());
    }
}
