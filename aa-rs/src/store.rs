use crate::types::UserOperation;
use anyhow::{anyhow, Context, Result};
use ethers::types::{Bytes, H256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// One line of the human-readable summary shown for an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailItem {
    pub title: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
}

impl DetailItem {
    pub fn new(title: impl Into<String>, value: impl ToString) -> Self {
        Self {
            title: title.into(),
            value: value.to_string(),
            href: None,
        }
    }
}

/// Debug payload kept next to an operation (raw RPC responses and the like).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevInfo {
    pub title: String,
    pub data: serde_json::Value,
}

/// How one submitted operation ended, as far as `send` could tell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionOutcome {
    /// Not waited for.
    Pending,
    Succeeded,
    Reverted,
    /// Waiting for the receipt failed or timed out.
    WaitFailed(String),
}

impl SubmissionOutcome {
    pub fn success(&self) -> Option<bool> {
        match self {
            SubmissionOutcome::Succeeded => Some(true),
            SubmissionOutcome::Reverted => Some(false),
            SubmissionOutcome::Pending | SubmissionOutcome::WaitFailed(_) => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SubmissionOutcome::Pending => "pending",
            SubmissionOutcome::Succeeded => "succeeded",
            SubmissionOutcome::Reverted => "reverted",
            SubmissionOutcome::WaitFailed(_) => "unconfirmed",
        }
    }
}

/// Operations being assembled, one per chain, plus everything collected around them.
///
/// Writes are last-write-wins; the file is replaced atomically on save.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationStore {
    #[serde(default)]
    user_operations: BTreeMap<u64, UserOperation>,
    /// Operation hashes (or merkle roots) submitted but not yet confirmed.
    #[serde(default)]
    pending_hashes: Vec<H256>,
    #[serde(default)]
    details: BTreeMap<u64, Vec<DetailItem>>,
    #[serde(default)]
    dev_info: BTreeMap<u64, Vec<DevInfo>>,
    /// Owner signatures keyed by the subdigest they sign.
    #[serde(default)]
    signatures: BTreeMap<H256, Vec<Bytes>>,
}

impl OperationStore {
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read store file {}", path.display()))?;
        let mut store: OperationStore = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse store file {}", path.display()))?;

        for (chain_id, op) in store.user_operations.iter_mut() {
            if op.hash().is_some() && !op.revalidate_seal() {
                tracing::warn!(chain_id, "stored operation hash is stale; dropped");
            }
        }
        Ok(store)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create store directory {}", parent.display())
                })?;
            }
        }

        let json = serde_json::to_string_pretty(self).context("failed to serialize store")?;

        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, json)
            .with_context(|| format!("failed to write temp store file {}", tmp_path.display()))?;

        // rename() does not replace an existing file on Windows
        if let Err(err) = fs::rename(&tmp_path, path) {
            if cfg!(windows) {
                let _ = fs::remove_file(path);
                fs::rename(&tmp_path, path)
                    .with_context(|| format!("failed to replace store file {}", path.display()))?;
            } else {
                return Err(anyhow!(
                    "failed to replace store file {}: {err}",
                    path.display()
                ));
            }
        }
        Ok(())
    }

    /// Inserts or replaces the operation for its chain.
    pub fn set_by_chain_id(&mut self, op: UserOperation) {
        self.user_operations.insert(op.chain_id(), op);
    }

    pub fn get(&self, chain_id: u64) -> Option<&UserOperation> {
        self.user_operations.get(&chain_id)
    }

    pub fn get_mut(&mut self, chain_id: u64) -> Option<&mut UserOperation> {
        self.user_operations.get_mut(&chain_id)
    }

    pub fn remove(&mut self, chain_id: u64) -> Option<UserOperation> {
        self.user_operations.remove(&chain_id)
    }

    /// Operations in chain id order.
    pub fn operations(&self) -> Vec<UserOperation> {
        self.user_operations.values().cloned().collect()
    }

    pub fn add_pending_hash(&mut self, hash: H256) {
        self.pending_hashes.push(hash);
    }

    pub fn pending_hashes(&self) -> &[H256] {
        &self.pending_hashes
    }

    pub fn reset_pending_hashes(&mut self) {
        self.pending_hashes.clear();
    }

    pub fn set_details(&mut self, chain_id: u64, details: Vec<DetailItem>) {
        self.details.insert(chain_id, details);
    }

    pub fn details(&self, chain_id: u64) -> Option<&[DetailItem]> {
        self.details.get(&chain_id).map(Vec::as_slice)
    }

    pub fn remove_details(&mut self, chain_id: u64) -> Result<()> {
        self.details
            .remove(&chain_id)
            .map(|_| ())
            .ok_or_else(|| anyhow!("no details stored for chain {chain_id}"))
    }

    pub fn reset_details(&mut self) {
        self.details.clear();
    }

    pub fn set_dev_info(&mut self, chain_id: u64, info: Vec<DevInfo>) {
        self.dev_info.insert(chain_id, info);
    }

    pub fn dev_info(&self, chain_id: u64) -> Option<&[DevInfo]> {
        self.dev_info.get(&chain_id).map(Vec::as_slice)
    }

    pub fn remove_dev_info(&mut self, chain_id: u64) -> Result<()> {
        self.dev_info
            .remove(&chain_id)
            .map(|_| ())
            .ok_or_else(|| anyhow!("no dev info stored for chain {chain_id}"))
    }

    pub fn reset_dev_info(&mut self) {
        self.dev_info.clear();
    }

    /// Clears per-chain details and dev info; operations and signatures stay.
    pub fn reset_all(&mut self) {
        self.reset_details();
        self.reset_dev_info();
    }

    /// Records an owner signature unless the same bytes are already stored.
    pub fn add_signature(&mut self, subdigest: H256, signature: Bytes) -> bool {
        let sigs = self.signatures.entry(subdigest).or_default();
        if sigs.contains(&signature) {
            return false;
        }
        sigs.push(signature);
        true
    }

    pub fn signatures(&self, subdigest: H256) -> &[Bytes] {
        self.signatures
            .get(&subdigest)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Returns how many signatures were dropped.
    pub fn clear_signatures(&mut self, subdigest: H256) -> usize {
        self.signatures
            .remove(&subdigest)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    /// Applies the outcomes of one submitted batch signed over `subdigest`.
    ///
    /// Succeeded operations leave the store with their details. Pending hashes and the batch's
    /// signatures are only dropped once every operation in it succeeded.
    pub fn settle(&mut self, subdigest: H256, outcomes: &[(u64, SubmissionOutcome)]) {
        for (chain_id, outcome) in outcomes {
            if *outcome == SubmissionOutcome::Succeeded {
                self.remove(*chain_id);
                self.details.remove(chain_id);
            }
        }
        let all_succeeded = !outcomes.is_empty()
            && outcomes
                .iter()
                .all(|(_, o)| *o == SubmissionOutcome::Succeeded);
        if all_succeeded {
            self.reset_pending_hashes();
            self.clear_signatures(subdigest);
        }
    }
}
