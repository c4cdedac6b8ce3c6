use crate::encoding::{self, parse_address, parse_h256};
use crate::pipeline::GasEstimator;
use crate::rpc::{quantity, JsonRpcClient};
use crate::types::UserOperation;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use serde_json::Value;
use std::time::{Duration, Instant};

const RECEIPT_POLL_INTERVAL: Duration = Duration::from_millis(1500);

/// ERC-4337 bundler endpoint (`eth_*UserOperation*` namespace).
#[derive(Debug, Clone)]
pub struct BundlerClient {
    rpc: JsonRpcClient,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GasEstimates {
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
}

impl GasEstimates {
    fn from_result(res: &Value) -> Result<Self> {
        Ok(Self {
            call_gas_limit: estimate_field(res, &["callGasLimit"])?,
            // older bundlers answer with `verificationGas`
            verification_gas_limit: estimate_field(res, &["verificationGasLimit", "verificationGas"])?,
            pre_verification_gas: estimate_field(res, &["preVerificationGas"])?,
        })
    }
}

fn estimate_field(res: &Value, keys: &[&str]) -> Result<U256> {
    keys.iter()
        .find_map(|k| res.get(*k).and_then(quantity))
        .ok_or_else(|| anyhow!("estimate is missing {} in {}", keys[0], res))
}

/// The parts of an `eth_getUserOperationReceipt` result the CLI reports on.
#[derive(Debug, Clone, PartialEq)]
pub struct UserOperationReceipt {
    pub user_op_hash: H256,
    pub success: bool,
    pub actual_gas_cost: Option<U256>,
    pub actual_gas_used: Option<U256>,
    pub reason: Option<String>,
    pub transaction_hash: Option<H256>,
}

impl UserOperationReceipt {
    fn from_result(user_op_hash: H256, res: &Value) -> Result<Self> {
        let success = res
            .get("success")
            .and_then(Value::as_bool)
            .ok_or_else(|| anyhow!("receipt without a success flag: {res}"))?;
        let transaction_hash = res
            .get("receipt")
            .and_then(|r| r.get("transactionHash"))
            .and_then(Value::as_str)
            .map(parse_h256)
            .transpose()
            .context("invalid receipt.transactionHash")?;
        Ok(Self {
            user_op_hash,
            success,
            actual_gas_cost: res.get("actualGasCost").and_then(quantity),
            actual_gas_used: res.get("actualGasUsed").and_then(quantity),
            reason: res
                .get("reason")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_owned),
            transaction_hash,
        })
    }
}

impl BundlerClient {
    pub fn new(url: String) -> Self {
        Self {
            rpc: JsonRpcClient::new(url),
        }
    }

    pub async fn estimate_user_operation_gas(
        &self,
        user_op: Value,
        entrypoint: Address,
    ) -> Result<GasEstimates> {
        let params = serde_json::json!([user_op, encoding::fmt_address(entrypoint)]);
        let res = self
            .rpc
            .call("eth_estimateUserOperationGas", params)
            .await
            .context("eth_estimateUserOperationGas failed")?;
        GasEstimates::from_result(&res)
    }

    pub async fn send_user_operation(&self, user_op: Value, entrypoint: Address) -> Result<H256> {
        let params = serde_json::json!([user_op, encoding::fmt_address(entrypoint)]);
        let res = self
            .rpc
            .call("eth_sendUserOperation", params)
            .await
            .context("eth_sendUserOperation failed")?;
        parse_userop_hash(&res)
    }

    /// Entry points the bundler accepts operations for.
    pub async fn supported_entry_points(&self) -> Result<Vec<Address>> {
        let res = self
            .rpc
            .call("eth_supportedEntryPoints", serde_json::json!([]))
            .await
            .context("eth_supportedEntryPoints failed")?;
        parse_entry_points(&res)
    }

    /// Fails early when the bundler does not serve `entrypoint`.
    pub async fn ensure_entry_point(&self, entrypoint: Address) -> Result<()> {
        let supported = self.supported_entry_points().await?;
        if !supported.contains(&entrypoint) {
            return Err(anyhow!(
                "bundler {} does not support entry point {} (supported: {:?})",
                self.rpc.url(),
                encoding::fmt_address(entrypoint),
                supported
            ));
        }
        Ok(())
    }

    /// `None` while the operation is not yet included.
    pub async fn get_user_operation_receipt(
        &self,
        user_op_hash: H256,
    ) -> Result<Option<UserOperationReceipt>> {
        let params = serde_json::json!([encoding::fmt_h256(user_op_hash)]);
        let res = self
            .rpc
            .call("eth_getUserOperationReceipt", params)
            .await
            .context("eth_getUserOperationReceipt failed")?;
        if res.is_null() {
            return Ok(None);
        }
        UserOperationReceipt::from_result(user_op_hash, &res).map(Some)
    }

    /// Polls until the receipt shows up. A zero `timeout` waits forever.
    pub async fn wait_user_operation_receipt(
        &self,
        user_op_hash: H256,
        timeout: Duration,
    ) -> Result<UserOperationReceipt> {
        let start = Instant::now();
        loop {
            if !timeout.is_zero() && start.elapsed() > timeout {
                return Err(anyhow!(
                    "timed out waiting for receipt of {:?} after {:?}",
                    user_op_hash,
                    timeout
                ));
            }

            match self.get_user_operation_receipt(user_op_hash).await {
                Ok(Some(receipt)) => return Ok(receipt),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, user_op_hash = ?user_op_hash, "bundler receipt poll error");
                }
            }

            tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl GasEstimator for BundlerClient {
    async fn estimate_gas(&self, op: &UserOperation, entry_point: Address) -> Result<GasEstimates> {
        self.estimate_user_operation_gas(encoding::user_op_to_wire(op, entry_point), entry_point)
            .await
    }
}

fn parse_entry_points(res: &Value) -> Result<Vec<Address>> {
    res.as_array()
        .ok_or_else(|| anyhow!("eth_supportedEntryPoints: expected array, got {}", res))?
        .iter()
        .map(|v| {
            v.as_str()
                .ok_or_else(|| anyhow!("eth_supportedEntryPoints: non-string entry {}", v))
                .and_then(parse_address)
        })
        .collect()
}

fn parse_userop_hash(res: &Value) -> Result<H256> {
    // Plain string, or wrapped under one of the keys bundlers use.
    let hash_str = res
        .as_str()
        .or_else(|| {
            ["result", "userOpHash", "userOperationHash"]
                .iter()
                .find_map(|k| res.get(*k).and_then(Value::as_str))
        })
        .ok_or_else(|| {
            anyhow!("unexpected eth_sendUserOperation result shape (expected a hash): {}", res)
        })?;
    parse_h256(hash_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const HASH: &str = "0x1111111111111111111111111111111111111111111111111111111111111111";

    #[test]
    fn userop_hash_in_every_known_shape() {
        let want = parse_h256(HASH).unwrap();
        for res in [
            json!(HASH),
            json!({ "result": HASH }),
            json!({ "userOpHash": HASH }),
            json!({ "userOperationHash": HASH }),
        ] {
            assert_eq!(parse_userop_hash(&res).unwrap(), want, "{res}");
        }
        assert!(parse_userop_hash(&json!({ "foo": "bar" })).is_err());
        assert!(parse_userop_hash(&json!("0x1234")).is_err());
    }

    #[test]
    fn parse_supported_entry_points() {
        let res = json!([
            "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789",
            "0x0000000071727De22E5E9d8BAf0edAc6f37da032"
        ]);
        let eps = parse_entry_points(&res).unwrap();
        assert_eq!(eps.len(), 2);
        assert_eq!(
            eps[0],
            "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789".parse::<Address>().unwrap()
        );
        assert!(parse_entry_points(&json!({ "foo": 1 })).is_err());
        assert!(parse_entry_points(&json!([1])).is_err());
    }

    #[test]
    fn gas_estimates_accept_hex_numbers_and_old_field_names() {
        let est = GasEstimates::from_result(&json!({
            "callGasLimit": "0x5208",
            "verificationGas": 100000,
            "preVerificationGas": "50000",
        }))
        .unwrap();
        assert_eq!(
            est,
            GasEstimates {
                call_gas_limit: U256::from(21_000),
                verification_gas_limit: U256::from(100_000),
                pre_verification_gas: U256::from(50_000),
            }
        );

        let err = GasEstimates::from_result(&json!({ "callGasLimit": "0x1" })).unwrap_err();
        assert!(err.to_string().contains("verificationGasLimit"));
    }

    #[test]
    fn receipt_fields() {
        let hash = parse_h256(HASH).unwrap();
        let r = UserOperationReceipt::from_result(
            hash,
            &json!({
                "userOpHash": HASH,
                "success": false,
                "actualGasCost": "0x2386f26fc10000",
                "actualGasUsed": "0x1e8480",
                "reason": "0x08c379a0",
                "receipt": { "transactionHash": HASH },
            }),
        )
        .unwrap();
        assert!(!r.success);
        assert_eq!(r.actual_gas_cost, Some(U256::exp10(16)));
        assert_eq!(r.actual_gas_used, Some(U256::from(2_000_000)));
        assert_eq!(r.reason.as_deref(), Some("0x08c379a0"));
        assert_eq!(r.transaction_hash, Some(hash));

        let r = UserOperationReceipt::from_result(hash, &json!({ "success": true, "reason": "" }))
            .unwrap();
        assert!(r.success);
        assert_eq!(r.reason, None);
        assert_eq!(r.transaction_hash, None);

        assert!(UserOperationReceipt::from_result(hash, &json!({})).is_err());
    }
}
