//! Decodes an encoded wallet signature back into its signer tree.
//!
//! Owner leaves are recovered against the subdigest, so the result carries both the image hash
//! the signature proves and the weight it reaches.

use crate::configuration::image_hash_of;
use crate::signature::OwnerSignature;
use crate::signer_tree::{leaf_for_nested, leaf_for_static_digest, SignatureLeaf, SignerNode};
use crate::subdigest::subdigest_of;
use ethers::types::{Address, H256};
use ethers::utils::keccak256;
use thiserror::Error;

const FLAG_ECDSA: u8 = 0x00;
const FLAG_ADDRESS: u8 = 0x01;
const FLAG_NODE: u8 = 0x03;
const FLAG_BRANCH: u8 = 0x04;
const FLAG_SUBDIGEST: u8 = 0x05;
const FLAG_NESTED: u8 = 0x06;

const LEGACY: u8 = 0x00;
const DYNAMIC: u8 = 0x01;
const NO_CHAIN_ID: u8 = 0x02;
const CHAINED: u8 = 0x03;

#[derive(Debug, Error)]
pub enum RecoverError {
    #[error("signature is empty")]
    Empty,
    #[error("signature truncated at byte {offset}: {needed} more bytes expected")]
    Truncated { offset: usize, needed: usize },
    #[error("unknown signature part flag {flag:#04x} at byte {offset}")]
    UnknownFlag { flag: u8, offset: usize },
    #[error("unsupported signature type {0:#04x}")]
    UnsupportedType(u8),
    #[error("owner leaf at byte {offset}: {source}")]
    Owner {
        offset: usize,
        #[source]
        source: crate::signature::SignatureError,
    },
    #[error("chained signature link {index} has weight {weight}, below its threshold {threshold}")]
    BelowThreshold {
        index: usize,
        weight: u64,
        threshold: u16,
    },
    #[error("chained signature link {index} has checkpoint {found}, expected below {previous}")]
    CheckpointNotDecreasing {
        index: usize,
        found: u32,
        previous: u32,
    },
}

/// A signer tree rebuilt from signature parts, with the weight its signed leaves carry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecoveredBranch {
    pub tree: SignerNode,
    pub root: H256,
    /// Saturates when a static-digest leaf matches the subdigest.
    pub weight: u64,
}

/// What a full wallet signature proves.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecoveredSignature {
    pub signature_type: u8,
    pub threshold: u16,
    pub checkpoint: u32,
    pub weight: u64,
    pub image_hash: H256,
    pub subdigest: H256,
    pub tree: SignerNode,
}

impl RecoveredSignature {
    pub fn meets_threshold(&self) -> bool {
        self.weight >= self.threshold as u64
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], RecoverError> {
        let end = self.pos + n;
        if end > self.buf.len() {
            return Err(RecoverError::Truncated {
                offset: self.pos,
                needed: end - self.buf.len(),
            });
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, RecoverError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, RecoverError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Result<usize, RecoverError> {
        let b = self.take(3)?;
        Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]) as usize)
    }

    fn u32(&mut self) -> Result<u32, RecoverError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn h256(&mut self) -> Result<H256, RecoverError> {
        Ok(H256::from_slice(self.take(32)?))
    }

    fn address(&mut self) -> Result<Address, RecoverError> {
        Ok(Address::from_slice(self.take(20)?))
    }

    /// A u24 length followed by that many bytes.
    fn sized(&mut self) -> Result<&'a [u8], RecoverError> {
        let len = self.u24()?;
        self.take(len)
    }
}

/// Left fold of decoded parts: `root = root == 0 ? node : keccak(root, node)`, except for
/// branch parts, which always hash into the running root.
struct Fold {
    tree: Option<SignerNode>,
    root: H256,
}

impl Fold {
    fn push(&mut self, node: SignerNode, hash: H256, branch: bool) {
        let joined = match self.tree.take() {
            Some(prev) if branch || !self.root.is_zero() => {
                SignerNode::Branch(Box::new(prev), Box::new(node))
            }
            None if branch => SignerNode::Branch(Box::new(SignerNode::Empty), Box::new(node)),
            _ => node,
        };
        self.root = if branch || !self.root.is_zero() {
            hash_pair(self.root, hash)
        } else {
            hash
        };
        self.tree = Some(joined);
    }
}

fn hash_pair(left: H256, right: H256) -> H256 {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left.as_bytes());
    buf[32..].copy_from_slice(right.as_bytes());
    H256(keccak256(buf))
}

/// Decodes the signer-tree part of a signature (everything after threshold and checkpoint).
pub fn recover_branch(sig: &[u8], subdigest: H256) -> Result<RecoveredBranch, RecoverError> {
    let mut r = Reader::new(sig);
    let mut fold = Fold {
        tree: None,
        root: H256::zero(),
    };
    let mut weight: u64 = 0;

    while !r.is_empty() {
        let offset = r.pos;
        let flag = r.u8()?;
        match flag {
            FLAG_ECDSA => {
                let leaf_weight = r.u8()?;
                let at = r.pos;
                let owner = OwnerSignature::from_bytes(r.take(66)?)
                    .and_then(|s| s.recover(subdigest).map(|a| (a, s)))
                    .map_err(|source| RecoverError::Owner { offset: at, source })?;
                let (address, sig) = owner;
                weight = weight.saturating_add(leaf_weight as u64);
                let leaf = SignatureLeaf::Ecdsa {
                    address,
                    weight: leaf_weight,
                    signature: sig.signature.to_vec(),
                    signature_type: sig.signature_type,
                };
                let hash = leaf.hash();
                fold.push(SignerNode::Leaf(leaf), hash, false);
            }
            FLAG_ADDRESS => {
                let leaf_weight = r.u8()?;
                let address = r.address()?;
                let leaf = SignatureLeaf::Address {
                    address,
                    weight: leaf_weight,
                };
                let hash = leaf.hash();
                fold.push(SignerNode::Leaf(leaf), hash, false);
            }
            FLAG_NODE => {
                let hash = r.h256()?;
                fold.push(SignerNode::Leaf(SignatureLeaf::Node { hash }), hash, false);
            }
            FLAG_BRANCH => {
                let inner = recover_branch(r.sized()?, subdigest)?;
                weight = weight.saturating_add(inner.weight);
                fold.push(inner.tree, inner.root, true);
            }
            FLAG_SUBDIGEST => {
                let hash = r.h256()?;
                if hash == subdigest {
                    weight = u64::MAX;
                }
                fold.push(
                    SignerNode::Leaf(SignatureLeaf::Subdigest { hash }),
                    leaf_for_static_digest(hash),
                    false,
                );
            }
            FLAG_NESTED => {
                let external_weight = r.u8()?;
                let internal_threshold = r.u16()?;
                let inner = recover_branch(r.sized()?, subdigest)?;
                if inner.weight >= internal_threshold as u64 {
                    weight = weight.saturating_add(external_weight as u64);
                }
                let hash = leaf_for_nested(inner.root, internal_threshold, external_weight);
                let leaf = SignatureLeaf::Nested {
                    weight: external_weight,
                    threshold: internal_threshold,
                    tree: Box::new(inner.tree),
                };
                fold.push(SignerNode::Leaf(leaf), hash, false);
            }
            flag => return Err(RecoverError::UnknownFlag { flag, offset }),
        }
    }

    Ok(RecoveredBranch {
        tree: fold.tree.unwrap_or(SignerNode::Empty),
        root: fold.root,
        weight,
    })
}

/// Decodes `threshold ‖ checkpoint ‖ tree` against an already computed subdigest.
pub fn recover_with_subdigest(
    sig: &[u8],
    subdigest: H256,
    signature_type: u8,
) -> Result<RecoveredSignature, RecoverError> {
    let mut r = Reader::new(sig);
    let threshold = r.u16()?;
    let checkpoint = r.u32()?;
    let branch = recover_branch(&sig[r.pos..], subdigest)?;
    Ok(RecoveredSignature {
        signature_type,
        threshold,
        checkpoint,
        weight: branch.weight,
        image_hash: image_hash_of(branch.root, threshold, checkpoint),
        subdigest,
        tree: branch.tree,
    })
}

/// Recovers a wallet signature over `digest`.
///
/// The first byte selects the layout: `0x00` legacy (the byte is part of the threshold), `0x01`
/// dynamic, `0x02` valid on every chain, `0x03` chained configuration updates.
pub fn recover_signature(
    wallet: Address,
    chain_id: u64,
    digest: H256,
    sig: &[u8],
) -> Result<RecoveredSignature, RecoverError> {
    let Some(&kind) = sig.first() else {
        return Err(RecoverError::Empty);
    };
    match kind {
        LEGACY => recover_with_subdigest(sig, subdigest_of(wallet, digest, chain_id), LEGACY),
        DYNAMIC => {
            recover_with_subdigest(&sig[1..], subdigest_of(wallet, digest, chain_id), DYNAMIC)
        }
        NO_CHAIN_ID => recover_with_subdigest(&sig[1..], subdigest_of(wallet, digest, 0), NO_CHAIN_ID),
        CHAINED => recover_chained(wallet, chain_id, digest, &sig[1..]),
        other => Err(RecoverError::UnsupportedType(other)),
    }
}

/// `keccak256(abi.encodePacked(keccak256("SetImageHash(bytes32 imageHash)"), imageHash))`
pub fn set_image_hash_digest(image_hash: H256) -> H256 {
    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(&keccak256("SetImageHash(bytes32 imageHash)"));
    buf.extend_from_slice(image_hash.as_bytes());
    H256(keccak256(buf))
}

/// Each link signs the image hash the previous one recovered; the result proves the last
/// link's image hash while the first link carries the subdigest.
fn recover_chained(
    wallet: Address,
    chain_id: u64,
    digest: H256,
    body: &[u8],
) -> Result<RecoveredSignature, RecoverError> {
    let mut r = Reader::new(body);
    let mut current = recover_signature(wallet, chain_id, digest, r.sized()?)?;
    check_link(0, &current)?;
    let first = current.clone();

    let mut index = 1;
    while !r.is_empty() {
        let link = recover_signature(
            wallet,
            chain_id,
            set_image_hash_digest(current.image_hash),
            r.sized()?,
        )?;
        check_link(index, &link)?;
        if link.checkpoint >= current.checkpoint {
            return Err(RecoverError::CheckpointNotDecreasing {
                index,
                found: link.checkpoint,
                previous: current.checkpoint,
            });
        }
        current = link;
        index += 1;
    }

    Ok(RecoveredSignature {
        signature_type: CHAINED,
        image_hash: current.image_hash,
        ..first
    })
}

fn check_link(index: usize, link: &RecoveredSignature) -> Result<(), RecoverError> {
    if !link.meets_threshold() {
        return Err(RecoverError::BelowThreshold {
            index,
            weight: link.weight,
            threshold: link.threshold,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::{Configuration, Owner};
    use crate::signature::{encode_signature, sign_subdigest, SignatureCollector, SignatureType};
    use ethers::signers::{LocalWallet, Signer};

    fn h(s: &str) -> H256 {
        s.parse().unwrap()
    }

    fn key(n: u64) -> LocalWallet {
        format!("{n:064x}").parse().unwrap()
    }

    const KEY_1: &str = "0x7E5F4552091A69125d5DfCb7b8C2659029395Bdf";
    const KEY_2: &str = "0x2B5AD5c4795c026514f8317c7a215E218DcCD6cF";
    const KEY_3: &str = "0x6813Eb9362372EEF6200f3b1dbC3f819671cBA69";

    #[test]
    fn single_signed_leaf() {
        let sig = hex::decode("00606673ffad2147741f04772b6f921f0ba6af0c1e77fc439e65c36dedf4092e88984c1a971652e0ada880120ef8025e709fff2080c4a39aae068d12eed009b68c891c01").unwrap();
        let branch = recover_branch(&sig, H256::from_low_u64_be(1)).unwrap();
        assert_eq!(branch.weight, 96);
        assert_eq!(
            branch.root,
            h("0x0000000000000000000000607e5f4552091a69125d5dfcb7b8c2659029395bdf")
        );
        let SignerNode::Leaf(SignatureLeaf::Ecdsa { address, signature_type, .. }) = &branch.tree
        else {
            panic!("expected an owner leaf, got {:?}", branch.tree);
        };
        assert_eq!(*address, KEY_1.parse::<Address>().unwrap());
        assert_eq!(*signature_type, SignatureType::Eip712);
    }

    #[test]
    fn legacy_signature_known_image_hash() {
        let sig = hex::decode("00110000000000025381b31277854cdcbf3feba4366454231d6f938c714464fb6a5ab564d6fe5fc76b8fb4513c4eda90e96c2cf7586bdfb25f55dcea82146288781d1cf82b95d9771b01").unwrap();
        let subdigest = h("0x21c816235ccd179f03e4027691a68a7f70387fdd70cef9dba02a39ffba192856");
        let rec = recover_with_subdigest(&sig, subdigest, 0).unwrap();
        assert_eq!(rec.threshold, 17);
        assert_eq!(rec.checkpoint, 0);
        assert_eq!(rec.weight, 2);
        assert!(!rec.meets_threshold());
        assert_eq!(
            rec.image_hash,
            h("0x50ec12b237887c47767742e6425b98694ac9f793a31729766ea4748b382ea648")
        );
    }

    #[tokio::test]
    async fn collected_signature_decodes_to_its_configuration() {
        let owners = [key(1), key(2), key(3)];
        let cfg = Configuration::new(
            2,
            1,
            owners
                .iter()
                .map(|w| Owner {
                    address: w.address(),
                    weight: 1,
                })
                .collect(),
        );
        let wallet = Address::repeat_byte(0x77);
        let digest = H256::repeat_byte(0x99);
        let subdigest = subdigest_of(wallet, digest, 8453);

        let mut collector = SignatureCollector::new(cfg.clone(), subdigest).unwrap();
        collector.add(&sign_subdigest(&owners[0], subdigest).await.unwrap()).unwrap();
        collector.add(&sign_subdigest(&owners[2], subdigest).await.unwrap()).unwrap();

        for kind in [0u8, 1] {
            let sig = collector.encode_with_type(kind).unwrap();
            let rec = recover_signature(wallet, 8453, digest, &sig).unwrap();
            assert_eq!(rec.signature_type, kind);
            assert_eq!(rec.weight, 2);
            assert!(rec.meets_threshold());
            assert_eq!(rec.subdigest, subdigest);
            assert_eq!(
                rec.image_hash,
                h("0x017c0e31285f48efbe961d527a6192e44d0100f5a9f5b3362b516c013e22b1c1")
            );
            assert_eq!(rec.image_hash, cfg.image_hash().unwrap());
        }

        // the same bytes checked on another chain recover other signers
        let sig = collector.encode().unwrap();
        let rec = recover_signature(wallet, 1, digest, &sig).unwrap();
        assert_ne!(rec.image_hash, cfg.image_hash().unwrap());
    }

    #[tokio::test]
    async fn every_part_kind_round_trips() {
        let subdigest = H256::repeat_byte(0x42);
        let leaf = |w: &LocalWallet| SignerNode::address(w.address(), 1);
        let nested = SignerNode::Leaf(SignatureLeaf::Nested {
            weight: 1,
            threshold: 1,
            tree: Box::new(SignerNode::Branch(
                Box::new(leaf(&key(3))),
                Box::new(SignerNode::Leaf(SignatureLeaf::Subdigest {
                    hash: H256::repeat_byte(0x55),
                })),
            )),
        });
        let node = SignerNode::Leaf(SignatureLeaf::Node {
            hash: H256::from_low_u64_be(0xdeadbeef),
        });
        let mut tree = SignerNode::Branch(
            Box::new(SignerNode::Branch(Box::new(leaf(&key(1))), Box::new(leaf(&key(2))))),
            Box::new(SignerNode::Branch(Box::new(node), Box::new(nested))),
        );
        assert_eq!(key(1).address(), KEY_1.parse::<Address>().unwrap());
        assert_eq!(key(2).address(), KEY_2.parse::<Address>().unwrap());
        assert_eq!(key(3).address(), KEY_3.parse::<Address>().unwrap());

        let mut signed = std::collections::BTreeMap::new();
        for w in [key(1), key(3)] {
            let raw = sign_subdigest(&w, subdigest).await.unwrap();
            signed.insert(w.address(), (raw[..65].to_vec(), SignatureType::EthSign));
        }
        assert_eq!(tree.replace_signed(&signed), 2);

        let sig = encode_signature(0, 2, 7, &tree);
        let rec = recover_with_subdigest(&sig, subdigest, 0).unwrap();
        assert_eq!(rec.tree, tree);
        assert_eq!(rec.weight, 2);
        assert_eq!(
            rec.image_hash,
            h("0x393c89dc9171aae5e2d13d7ac28664c638c1979b9e82f79b00008053e08a3b09")
        );
    }

    #[test]
    fn static_digest_leaf_matching_the_subdigest_signs_alone() {
        let subdigest = H256::repeat_byte(0x42);
        let mut sig = vec![0x05];
        sig.extend_from_slice(subdigest.as_bytes());
        assert_eq!(recover_branch(&sig, subdigest).unwrap().weight, u64::MAX);
        assert_eq!(recover_branch(&sig, H256::zero()).unwrap().weight, 0);
    }

    #[test]
    fn leading_branch_hashes_against_zero() {
        let mut inner = vec![0x03];
        inner.extend_from_slice(H256::repeat_byte(1).as_bytes());
        let mut sig = vec![0x04, 0, 0, 33];
        sig.extend_from_slice(&inner);
        let branch = recover_branch(&sig, H256::zero()).unwrap();
        assert_eq!(branch.root, hash_pair(H256::zero(), H256::repeat_byte(1)));
        assert_eq!(branch.tree.hash(), branch.root);
    }

    #[test]
    fn malformed_signatures() {
        assert!(matches!(
            recover_signature(Address::zero(), 1, H256::zero(), &[]),
            Err(RecoverError::Empty)
        ));
        assert!(matches!(
            recover_signature(Address::zero(), 1, H256::zero(), &[0x09]),
            Err(RecoverError::UnsupportedType(9))
        ));
        assert!(matches!(
            recover_branch(&[0x07], H256::zero()),
            Err(RecoverError::UnknownFlag { flag: 7, offset: 0 })
        ));
        assert!(matches!(
            recover_branch(&[0x03, 0xaa], H256::zero()),
            Err(RecoverError::Truncated { offset: 1, needed: 31 })
        ));
        // declared branch longer than what follows
        assert!(matches!(
            recover_branch(&[0x04, 0, 0, 5, 0x03], H256::zero()),
            Err(RecoverError::Truncated { .. })
        ));
    }

    #[test]
    fn set_image_hash_known_answer() {
        assert_eq!(
            set_image_hash_digest(H256::from_low_u64_be(1)),
            h("0xb5e1f9d781177bfdce4895e85793155c359e351caedd1c17a5c684d110566de7")
        );
    }

    #[tokio::test]
    async fn chained_signature_proves_the_last_image_hash() {
        let wallet = Address::repeat_byte(0x77);
        let digest = H256::repeat_byte(0x99);
        let new_owner = key(1);
        let old_owner = key(2);
        let owner = |w: &LocalWallet| Owner {
            address: w.address(),
            weight: 1,
        };
        let new_cfg = Configuration::new(1, 5, vec![owner(&new_owner)]);
        let old_cfg = Configuration::new(1, 2, vec![owner(&old_owner)]);

        let subdigest = subdigest_of(wallet, digest, 1);
        let mut first = SignatureCollector::new(new_cfg.clone(), subdigest).unwrap();
        first.add(&sign_subdigest(&new_owner, subdigest).await.unwrap()).unwrap();
        let first = first.encode().unwrap();

        let link_subdigest =
            subdigest_of(wallet, set_image_hash_digest(new_cfg.image_hash().unwrap()), 1);
        let mut link = SignatureCollector::new(old_cfg.clone(), link_subdigest).unwrap();
        link.add(&sign_subdigest(&old_owner, link_subdigest).await.unwrap()).unwrap();
        let link = link.encode().unwrap();

        let mut sig = vec![CHAINED];
        for part in [first.as_ref(), link.as_ref()] {
            sig.extend_from_slice(&(part.len() as u32).to_be_bytes()[1..]);
            sig.extend_from_slice(part);
        }
        let rec = recover_signature(wallet, 1, digest, &sig).unwrap();
        assert_eq!(rec.signature_type, CHAINED);
        assert_eq!(rec.checkpoint, 5);
        assert_eq!(rec.subdigest, subdigest);
        assert_eq!(rec.image_hash, old_cfg.image_hash().unwrap());

        // links must walk back to strictly older checkpoints
        let mut swapped = vec![CHAINED];
        for part in [first.as_ref(), first.as_ref()] {
            swapped.extend_from_slice(&(part.len() as u32).to_be_bytes()[1..]);
            swapped.extend_from_slice(part);
        }
        assert!(matches!(
            recover_signature(wallet, 1, digest, &swapped),
            Err(RecoverError::CheckpointNotDecreasing { index: 1, found: 5, previous: 5 })
        ));
    }
}
