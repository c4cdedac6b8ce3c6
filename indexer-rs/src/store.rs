use crate::events::EntryPointEvent;
use ethers::types::{Address, Bytes, H256, U256};
use eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs, path::Path};

/// Row id of anything derived from a single log.
pub fn log_id(tx_hash: H256, log_index: u64) -> String {
    format!("{:?}-{}", tx_hash, log_index)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionEntity {
    pub hash: H256,
    pub from: Address,
    pub to: Option<Address>,
    pub value: U256,
    pub nonce: U256,
    pub gas: U256,
    pub gas_price: Option<U256>,
    pub input: Bytes,
    pub block_number: u64,
    pub block_timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptEntity {
    pub transaction_hash: H256,
    pub status: Option<u64>,
    pub gas_used: Option<U256>,
    pub cumulative_gas_used: U256,
    pub effective_gas_price: Option<U256>,
    pub block_number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntity {
    pub id: String,
    pub address: Address,
    pub topics: Vec<H256>,
    pub data: Bytes,
    pub log_index: u64,
    pub transaction_hash: H256,
    /// Operation whose execution emitted the log.
    pub user_operation: Option<H256>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperationEntity {
    pub user_op_hash: H256,
    pub chain_id: u64,
    pub sender: Address,
    pub nonce: U256,
    pub paymaster: Address,
    pub success: bool,
    pub actual_gas_cost: U256,
    pub actual_gas_used: U256,
    /// Present when the bundler's `handleOps` calldata could be decoded.
    pub init_code: Option<Bytes>,
    pub call_data: Option<Bytes>,
    pub call_gas_limit: Option<U256>,
    pub verification_gas_limit: Option<U256>,
    pub pre_verification_gas: Option<U256>,
    pub max_fee_per_gas: Option<U256>,
    pub max_priority_fee_per_gas: Option<U256>,
    pub paymaster_and_data: Option<Bytes>,
    pub signature: Option<Bytes>,
    pub revert_reason: Option<String>,
    pub logs: Vec<String>,
    pub transaction_hash: H256,
    pub block_number: u64,
    pub block_timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperationRevertReasonEntity {
    pub id: String,
    pub user_op_hash: H256,
    pub sender: Address,
    pub nonce: U256,
    pub revert_reason: Bytes,
    pub block_number: u64,
    pub block_timestamp: u64,
    pub transaction_hash: H256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LightWalletEntity {
    pub address: Address,
    pub factory: Address,
    pub paymaster: Address,
    /// Operation that deployed the wallet.
    pub user_op_hash: H256,
    pub user_operations: Vec<H256>,
    pub block_number: u64,
    pub block_timestamp: u64,
    pub transaction_hash: H256,
}

/// Entry point event kept as-is, keyed `txHash-logIndex`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRow {
    pub id: String,
    #[serde(flatten)]
    pub event: EntryPointEvent,
    pub block_number: u64,
    pub block_timestamp: u64,
    pub transaction_hash: H256,
}

/// Running totals; only ever incremented.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Counter {
    pub light_wallets: u64,
    pub user_operations: u64,
    pub user_operations_succeeded: u64,
    pub user_operations_reverted: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityStore {
    /// The highest block fully indexed.
    pub last_scanned_block: u64,

    #[serde(default)]
    pub transactions: BTreeMap<H256, TransactionEntity>,
    #[serde(default)]
    pub receipts: BTreeMap<H256, ReceiptEntity>,
    #[serde(default)]
    pub logs: BTreeMap<String, LogEntity>,
    #[serde(default)]
    pub user_operations: BTreeMap<H256, UserOperationEntity>,
    #[serde(default)]
    pub user_operation_events: BTreeMap<String, EventRow>,
    #[serde(default)]
    pub user_operation_revert_reasons: BTreeMap<String, UserOperationRevertReasonEntity>,
    #[serde(default)]
    pub light_wallets: BTreeMap<Address, LightWalletEntity>,
    #[serde(default)]
    pub events: BTreeMap<String, EventRow>,
    #[serde(default)]
    pub counter: Counter,
}

impl EntityStore {
    pub fn load_or_init(path: impl AsRef<Path>, start_block: u64) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let raw = fs::read_to_string(path)
                .map_err(|e| eyre!("failed to read store file {}: {e}", path.display()))?;
            let st: EntityStore = serde_json::from_str(&raw)
                .map_err(|e| eyre!("failed to parse store file {}: {e}", path.display()))?;
            return Ok(st);
        }

        let init = EntityStore {
            last_scanned_block: start_block.saturating_sub(1),
            ..Default::default()
        };
        init.save(path)?;
        Ok(init)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    eyre!("failed to create store directory {}: {e}", parent.display())
                })?;
            }
        }

        let json = serde_json::to_string_pretty(self)
            .map_err(|e| eyre!("failed to serialize entity store: {e}"))?;

        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, json)
            .map_err(|e| eyre!("failed to write temp store file {}: {e}", tmp_path.display()))?;

        // rename() does not replace an existing file on Windows
        if let Err(err) = fs::rename(&tmp_path, path) {
            if cfg!(windows) {
                let _ = fs::remove_file(path);
                fs::rename(&tmp_path, path)
                    .map_err(|e| eyre!("failed to replace store file {}: {e}", path.display()))?;
            } else {
                return Err(eyre!(
                    "failed to replace store file {}: {err}",
                    path.display()
                ));
            }
        }
        Ok(())
    }

    pub fn is_light_wallet(&self, address: &Address) -> bool {
        self.light_wallets.contains_key(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir()
            .join(format!("light-indexer-{}-{}", name, std::process::id()))
            .join("store.json")
    }

    #[test]
    fn log_ids_join_hash_and_index() {
        let id = log_id(H256::repeat_byte(0xab), 12);
        assert!(id.starts_with("0xabab"));
        assert!(id.ends_with("-12"));
        assert_eq!(id.len(), 66 + 3);
    }

    #[test]
    fn new_store_starts_before_start_block() {
        let path = temp_path("init");
        let st = EntityStore::load_or_init(&path, 100).unwrap();
        assert_eq!(st.last_scanned_block, 99);
        assert!(path.exists());

        let st = EntityStore::load_or_init(&path, 0).unwrap();
        assert_eq!(st.last_scanned_block, 99);
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn save_and_reload_entities() {
        let path = temp_path("reload");
        let mut st = EntityStore::default();
        let wallet = Address::repeat_byte(0x77);
        st.light_wallets.insert(
            wallet,
            LightWalletEntity {
                address: wallet,
                factory: Address::repeat_byte(0xfa),
                paymaster: Address::zero(),
                user_op_hash: H256::repeat_byte(1),
                user_operations: vec![H256::repeat_byte(1)],
                block_number: 5,
                block_timestamp: 1_700_000_000,
                transaction_hash: H256::repeat_byte(2),
            },
        );
        let id = log_id(H256::repeat_byte(2), 0);
        st.events.insert(
            id.clone(),
            EventRow {
                id: id.clone(),
                event: EntryPointEvent::Deposited {
                    account: wallet,
                    total_deposit: U256::from(10),
                },
                block_number: 5,
                block_timestamp: 1_700_000_000,
                transaction_hash: H256::repeat_byte(2),
            },
        );
        st.counter.light_wallets = 1;
        st.save(&path).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["events"][&id]["event"], "Deposited");
        assert_eq!(raw["events"][&id]["totalDeposit"], "0xa");

        let loaded = EntityStore::load_or_init(&path, 0).unwrap();
        assert!(loaded.is_light_wallet(&wallet));
        assert_eq!(loaded.events[&id], st.events[&id]);
        assert_eq!(loaded.counter, st.counter);
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }
}
