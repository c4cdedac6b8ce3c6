//! Owner signature collection and wallet signature encoding.

use crate::configuration::{Configuration, ConfigurationError};
use crate::merkle::MerkleProof;
use crate::signer_tree::SignerNode;
use ethers::abi::{encode, Token};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Bytes, Signature, H256};
use ethers::utils::hash_message;
use std::collections::BTreeMap;
use thiserror::Error;

pub use crate::signer_tree::SignatureType;

/// Signature the gas estimator sees: threshold 1, checkpoint 1, one EIP-712 owner leaf.
pub const DUMMY_SIGNATURE: &str = "00010000000100013b31d8e3cafd8454ccaf0d4ad859bc76bbefbb7a7533197ca12fa852eba6a38a2e52c99c3b297f1935f9bfabb554176e65b601863cf6a80aa566930e0c05eef51c01";

/// r, s, v of the dummy owner leaf.
const DUMMY_ECDSA: &str = "3b31d8e3cafd8454ccaf0d4ad859bc76bbefbb7a7533197ca12fa852eba6a38a2e52c99c3b297f1935f9bfabb554176e65b601863cf6a80aa566930e0c05eef51c";

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("owner signature must be 65 or 66 bytes, got {0}")]
    InvalidLength(usize),
    #[error("unknown signature type {0}")]
    UnknownType(u8),
    #[error("signer recovery failed: {0}")]
    Recovery(String),
    #[error("{0:?} is not an owner of this wallet configuration")]
    NotOwner(Address),
    #[error("{0:?} already signed")]
    Duplicate(Address),
    #[error("signing failed: {0}")]
    Signing(String),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

/// An owner's ECDSA signature over a subdigest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnerSignature {
    pub signature: Signature,
    pub signature_type: SignatureType,
}

impl OwnerSignature {
    /// 65 bytes (r, s, v) are taken as `EthSign`; a 66th byte names the type.
    pub fn from_bytes(b: &[u8]) -> Result<Self, SignatureError> {
        let signature_type = match b.len() {
            65 => SignatureType::EthSign,
            66 => SignatureType::from_byte(b[65]).ok_or(SignatureError::UnknownType(b[65]))?,
            n => return Err(SignatureError::InvalidLength(n)),
        };
        let signature = Signature::try_from(&b[..65])
            .map_err(|e| SignatureError::Recovery(e.to_string()))?;
        Ok(Self {
            signature,
            signature_type,
        })
    }

    /// r, s, v followed by the type byte.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.signature.to_vec();
        out.push(self.signature_type as u8);
        out
    }

    pub fn recover(&self, subdigest: H256) -> Result<Address, SignatureError> {
        let digest = match self.signature_type {
            SignatureType::Eip712 => subdigest,
            SignatureType::EthSign => hash_message(subdigest.as_bytes()),
        };
        self.signature
            .recover(digest)
            .map_err(|e| SignatureError::Recovery(e.to_string()))
    }
}

/// Gathers owner signatures for one subdigest until their weight reaches the threshold.
#[derive(Clone, Debug)]
pub struct SignatureCollector {
    configuration: Configuration,
    subdigest: H256,
    signatures: BTreeMap<Address, OwnerSignature>,
}

impl SignatureCollector {
    pub fn new(configuration: Configuration, subdigest: H256) -> Result<Self, SignatureError> {
        configuration.validate()?;
        Ok(Self {
            configuration,
            subdigest,
            signatures: BTreeMap::new(),
        })
    }

    pub fn subdigest(&self) -> H256 {
        self.subdigest
    }

    /// Recovers the signer and records the signature. Returns the signer.
    pub fn add(&mut self, bytes: &[u8]) -> Result<Address, SignatureError> {
        let sig = OwnerSignature::from_bytes(bytes)?;
        let signer = sig.recover(self.subdigest)?;
        if self.configuration.weight_of(signer).is_none() {
            return Err(SignatureError::NotOwner(signer));
        }
        if self.signatures.contains_key(&signer) {
            return Err(SignatureError::Duplicate(signer));
        }
        self.signatures.insert(signer, sig);
        Ok(signer)
    }

    pub fn signers(&self) -> impl Iterator<Item = &Address> {
        self.signatures.keys()
    }

    pub fn collected_weight(&self) -> u64 {
        self.signatures
            .keys()
            .filter_map(|a| self.configuration.weight_of(*a))
            .map(u64::from)
            .sum()
    }

    pub fn is_submittable(&self) -> bool {
        self.collected_weight() >= self.configuration.threshold as u64
    }

    /// Legacy layout: no leading type byte.
    pub fn encode(&self) -> Result<Bytes, SignatureError> {
        self.encode_with_type(0)
    }

    /// `[type if != 0] ‖ threshold ‖ checkpoint ‖ tree`, with signed owners as ECDSA leaves.
    pub fn encode_with_type(&self, signature_type: u8) -> Result<Bytes, SignatureError> {
        let mut tree = self.configuration.signer_tree()?;
        let signed = self
            .signatures
            .iter()
            .map(|(a, s)| (*a, (s.signature.to_vec(), s.signature_type)))
            .collect();
        tree.replace_signed(&signed);
        Ok(encode_signature(
            signature_type,
            self.configuration.threshold,
            self.configuration.checkpoint,
            &tree,
        ))
    }
}

pub fn encode_signature(signature_type: u8, threshold: u16, checkpoint: u32, tree: &SignerNode) -> Bytes {
    let mut out = Vec::new();
    if signature_type != 0 {
        out.push(signature_type);
    }
    out.extend_from_slice(&threshold.to_be_bytes());
    out.extend_from_slice(&checkpoint.to_be_bytes());
    out.extend_from_slice(&tree.encode());
    Bytes::from(out)
}

/// Signature flag for an operation signed as part of a merkle batch.
pub const MERKLE_SIGNATURE_FLAG: u8 = 0x04;

/// `0x04 ‖ abi.encode(bytes32 root, bytes32[] proof, bytes signature)`: proves the
/// operation hash is a leaf of the signed root.
pub fn encode_merkle_signature(proof: &MerkleProof, wallet_signature: &[u8]) -> Bytes {
    let siblings = proof
        .siblings
        .iter()
        .map(|s| Token::FixedBytes(s.as_bytes().to_vec()))
        .collect();
    let body = encode(&[
        Token::FixedBytes(proof.root.as_bytes().to_vec()),
        Token::Array(siblings),
        Token::Bytes(wallet_signature.to_vec()),
    ]);
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(MERKLE_SIGNATURE_FLAG);
    out.extend_from_slice(&body);
    Bytes::from(out)
}

/// Placeholder with the size of a fully signed `configuration`, for gas estimation.
pub fn dummy_signature(configuration: &Configuration) -> Result<Bytes, SignatureError> {
    let ecdsa = hex::decode(DUMMY_ECDSA).map_err(|e| SignatureError::Recovery(e.to_string()))?;
    let mut tree = configuration.signer_tree()?;
    let signed = configuration
        .owners
        .iter()
        .map(|o| (o.address, (ecdsa.clone(), SignatureType::Eip712)))
        .collect();
    tree.replace_signed(&signed);
    Ok(encode_signature(
        0,
        configuration.threshold,
        configuration.checkpoint,
        &tree,
    ))
}

/// Personal-sign of the subdigest, as wallet owners do it. Returns 66 bytes.
pub async fn sign_subdigest(owner: &LocalWallet, subdigest: H256) -> Result<Vec<u8>, SignatureError> {
    let signature = owner
        .sign_message(subdigest.as_bytes())
        .await
        .map_err(|e| SignatureError::Signing(e.to_string()))?;
    Ok(OwnerSignature {
        signature,
        signature_type: SignatureType::EthSign,
    }
    .to_bytes())
}
