use crate::merkle::MerkleTree;
use crate::types::UserOperation;
use ethers::types::{Address, H256, U256};
use ethers::utils::keccak256;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubdigestError {
    #[error("no operations to sign")]
    Empty,
    #[error("operation {index} is not sealed")]
    Unsealed { index: usize },
    #[error("operation {index} targets sender {found:?}, expected {expected:?}")]
    SenderMismatch {
        index: usize,
        expected: Address,
        found: Address,
    },
}

/// `keccak256(abi.encodePacked("\x19\x01", chainId, wallet, digest))`
///
/// A zero `chain_id` makes the subdigest valid on every chain.
pub fn subdigest_of(wallet: Address, digest: H256, chain_id: u64) -> H256 {
    let mut chain = [0u8; 32];
    U256::from(chain_id).to_big_endian(&mut chain);

    let mut buf = Vec::with_capacity(2 + 32 + 20 + 32);
    buf.extend_from_slice(b"\x19\x01");
    buf.extend_from_slice(&chain);
    buf.extend_from_slice(wallet.as_bytes());
    buf.extend_from_slice(digest.as_bytes());
    H256(keccak256(buf))
}

/// Merkle tree over the sorted hashes of sealed operations.
pub fn operations_tree(ops: &[UserOperation]) -> Result<MerkleTree, SubdigestError> {
    let mut leaves = sealed_hashes(ops)?;
    leaves.sort();
    Ok(MerkleTree::from_leaves(leaves))
}

/// What the wallet owners sign for a batch of operations.
///
/// A single operation is signed for its own chain; several operations are signed once, as
/// the merkle root of their hashes, with a chain-agnostic subdigest.
pub fn operations_subdigest(wallet: Address, ops: &[UserOperation]) -> Result<H256, SubdigestError> {
    for (index, op) in ops.iter().enumerate() {
        if op.sender() != wallet {
            return Err(SubdigestError::SenderMismatch {
                index,
                expected: wallet,
                found: op.sender(),
            });
        }
    }
    match ops {
        [] => Err(SubdigestError::Empty),
        [op] => {
            let hash = op.hash().ok_or(SubdigestError::Unsealed { index: 0 })?;
            Ok(subdigest_of(wallet, hash, op.chain_id()))
        }
        _ => Ok(subdigest_of(wallet, operations_tree(ops)?.root(), 0)),
    }
}

fn sealed_hashes(ops: &[UserOperation]) -> Result<Vec<H256>, SubdigestError> {
    if ops.is_empty() {
        return Err(SubdigestError::Empty);
    }
    ops.iter()
        .enumerate()
        .map(|(index, op)| op.hash().ok_or(SubdigestError::Unsealed { index }))
        .collect()
}
