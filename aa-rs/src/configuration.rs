use crate::signer_tree::{rooted_node_builder, SignerNode};
use ethers::abi::{encode, Token};
use ethers::types::{Address, H256, U256};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("configuration has no owners")]
    NoOwners,
    #[error("threshold must be greater than zero")]
    ZeroThreshold,
    #[error("total owner weight {total} is below threshold {threshold}")]
    UnreachableThreshold { total: u64, threshold: u16 },
    #[error("owner {0:?} is listed more than once")]
    DuplicateOwner(Address),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub address: Address,
    pub weight: u8,
}

/// Multi-owner signing policy of a wallet at a checkpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    pub threshold: u16,
    pub checkpoint: u32,
    /// Index order; it decides the shape of the signer tree.
    pub owners: Vec<Owner>,
}

impl Configuration {
    pub fn new(threshold: u16, checkpoint: u32, owners: Vec<Owner>) -> Self {
        Self {
            threshold,
            checkpoint,
            owners,
        }
    }

    pub fn total_weight(&self) -> u64 {
        self.owners.iter().map(|o| o.weight as u64).sum()
    }

    pub fn weight_of(&self, address: Address) -> Option<u8> {
        self.owners
            .iter()
            .find(|o| o.address == address)
            .map(|o| o.weight)
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.owners.is_empty() {
            return Err(ConfigurationError::NoOwners);
        }
        if self.threshold == 0 {
            return Err(ConfigurationError::ZeroThreshold);
        }
        for (i, o) in self.owners.iter().enumerate() {
            if self.owners[..i].iter().any(|p| p.address == o.address) {
                return Err(ConfigurationError::DuplicateOwner(o.address));
            }
        }
        let total = self.total_weight();
        if total < self.threshold as u64 {
            return Err(ConfigurationError::UnreachableThreshold {
                total,
                threshold: self.threshold,
            });
        }
        Ok(())
    }

    pub fn signer_tree(&self) -> Result<SignerNode, ConfigurationError> {
        let members = self
            .owners
            .iter()
            .map(|o| SignerNode::address(o.address, o.weight))
            .collect();
        rooted_node_builder(members).ok_or(ConfigurationError::NoOwners)
    }

    /// `keccak(abi.encode(keccak(abi.encode(root, threshold)), checkpoint))`
    pub fn image_hash(&self) -> Result<H256, ConfigurationError> {
        let root = self.signer_tree()?.hash();
        Ok(image_hash_of(root, self.threshold, self.checkpoint))
    }
}

pub fn image_hash_of(root: H256, threshold: u16, checkpoint: u32) -> H256 {
    let inner = keccak256(encode(&[
        Token::FixedBytes(root.as_bytes().to_vec()),
        Token::Uint(U256::from(threshold)),
    ]));
    H256(keccak256(encode(&[
        Token::FixedBytes(inner.to_vec()),
        Token::Uint(U256::from(checkpoint)),
    ])))
}
