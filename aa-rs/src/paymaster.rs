use crate::encoding;
use crate::pipeline::Sponsor;
use crate::rpc::{quantity, JsonRpcClient};
use crate::types::{EntryPointVersion, UserOperation};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use ethers::types::{Address, Bytes, H160, U256};
use serde_json::Value;

/// Alchemy's v0.6 gas manager, which packs its validity window differently.
pub const ALCHEMY_V060_GAS_MANAGER: Address = H160([
    0x4f, 0xd9, 0x09, 0x8a, 0xf9, 0xdd, 0xcb, 0x41, 0xda, 0x48, 0xa1, 0xd7, 0x8f, 0x91, 0xf1, 0x39,
    0x89, 0x65, 0xad, 0xdc,
]);

/// Which paymaster web service dialect to speak.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymasterMode {
    /// ERC-7677 (`pm_getPaymasterStubData` / `pm_getPaymasterData`) with a sponsorship policy.
    Erc7677 {
        policy_id: String,
        webhook_data: Option<String>,
    },
    /// `paymaster_requestGasAndPaymasterAndData`, which may also re-price the operation.
    Light,
}

/// What a paymaster returned for an operation. `None` fields leave the operation as is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sponsorship {
    pub paymaster_and_data: Bytes,
    pub call_gas_limit: Option<U256>,
    pub verification_gas_limit: Option<U256>,
    pub pre_verification_gas: Option<U256>,
    pub max_fee_per_gas: Option<U256>,
    pub max_priority_fee_per_gas: Option<U256>,
}

impl Sponsorship {
    pub fn apply(&self, op: &mut UserOperation) {
        if let Some(v) = self.call_gas_limit {
            op.set_call_gas_limit(v);
        }
        if let Some(v) = self.verification_gas_limit {
            op.set_verification_gas_limit(v);
        }
        if let Some(v) = self.pre_verification_gas {
            op.set_pre_verification_gas(v);
        }
        if let Some(v) = self.max_fee_per_gas {
            op.set_max_fee_per_gas(v);
        }
        if let Some(v) = self.max_priority_fee_per_gas {
            op.set_max_priority_fee_per_gas(v);
        }
        op.set_paymaster_and_data(self.paymaster_and_data.clone());
    }
}

/// Verifying-paymaster fields packed into `paymasterAndData`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymasterData {
    pub paymaster: Address,
    pub valid_until: u64,
    pub valid_after: u64,
    pub signature: Bytes,
}

#[derive(Debug, Clone)]
pub struct PaymasterClient {
    rpc: JsonRpcClient,
    mode: PaymasterMode,
    chain_id: u64,
}

impl PaymasterClient {
    pub fn new(url: String, mode: PaymasterMode, chain_id: u64) -> Self {
        Self {
            rpc: JsonRpcClient::new(url),
            mode,
            chain_id,
        }
    }

    pub async fn get_paymaster_stub_data(&self, op: &UserOperation, entrypoint: Address) -> Result<Bytes> {
        let params = self.erc7677_params(encoding::user_op_to_wire(op, entrypoint), entrypoint)?;
        let res = self
            .rpc
            .call("pm_getPaymasterStubData", params)
            .await
            .context("pm_getPaymasterStubData RPC failed")?;
        parse_paymaster_and_data(&res, EntryPointVersion::of(entrypoint), op.paymaster_and_data())
    }

    pub async fn get_paymaster_data(&self, op: &UserOperation, entrypoint: Address) -> Result<Bytes> {
        let params = self.erc7677_params(encoding::user_op_to_wire(op, entrypoint), entrypoint)?;
        let res = self
            .rpc
            .call("pm_getPaymasterData", params)
            .await
            .context("pm_getPaymasterData RPC failed")?;
        parse_paymaster_and_data(&res, EntryPointVersion::of(entrypoint), op.paymaster_and_data())
    }

    pub async fn request_gas_and_paymaster_and_data(
        &self,
        user_op: Value,
        entrypoint: Address,
    ) -> Result<Sponsorship> {
        let params = serde_json::json!([user_op, encoding::fmt_address(entrypoint)]);
        let res = self
            .rpc
            .call("paymaster_requestGasAndPaymasterAndData", params)
            .await
            .context("paymaster_requestGasAndPaymasterAndData RPC failed")?;
        parse_sponsorship(&res)
    }

    fn erc7677_params(&self, user_op: Value, entrypoint: Address) -> Result<Value> {
        match &self.mode {
            PaymasterMode::Erc7677 {
                policy_id,
                webhook_data,
            } => Ok(build_params(
                user_op,
                entrypoint,
                self.chain_id,
                policy_id,
                webhook_data.as_deref(),
            )),
            PaymasterMode::Light => Err(anyhow!("paymaster is not configured for ERC-7677")),
        }
    }
}

#[async_trait]
impl Sponsor for PaymasterClient {
    async fn stub_data(&self, op: &UserOperation, entry_point: Address) -> Result<Option<Bytes>> {
        match self.mode {
            PaymasterMode::Erc7677 { .. } => {
                let stub = self.get_paymaster_stub_data(op, entry_point).await?;
                Ok(Some(stub))
            }
            PaymasterMode::Light => Ok(None),
        }
    }

    async fn sponsor(&self, op: &UserOperation, entry_point: Address) -> Result<Sponsorship> {
        match self.mode {
            PaymasterMode::Erc7677 { .. } => {
                let paymaster_and_data = self.get_paymaster_data(op, entry_point).await?;
                Ok(Sponsorship {
                    paymaster_and_data,
                    ..Default::default()
                })
            }
            PaymasterMode::Light => {
                let user_op = encoding::user_op_to_wire(op, entry_point);
                self.request_gas_and_paymaster_and_data(user_op, entry_point).await
            }
        }
    }
}

fn build_params(
    user_op: Value,
    entrypoint: Address,
    chain_id: u64,
    policy_id: &str,
    webhook_data: Option<&str>,
) -> Value {
    let mut context = serde_json::Map::new();
    context.insert("policyId".into(), policy_id.into());
    if let Some(wd) = webhook_data {
        context.insert("webhookData".into(), wd.into());
    }
    serde_json::json!([
        user_op,
        encoding::fmt_address(entrypoint),
        encoding::fmt_u256(U256::from(chain_id)),
        Value::Object(context),
    ])
}

fn parse_v06_paymaster_and_data(result: &Value) -> Result<Bytes> {
    // Some services answer with { "entrypointV06Response": { "paymasterAndData": .. } }.
    let v06 = result
        .get("entrypointV06Response")
        .or_else(|| result.get("entryPointV06Response"))
        .unwrap_or(result);

    let s = v06
        .get("paymasterAndData")
        .and_then(|x| x.as_str())
        .ok_or_else(|| anyhow!("missing paymasterAndData field"))?;
    encoding::parse_bytes(s).context("invalid hex in paymasterAndData")
}

fn parse_paymaster_and_data(
    result: &Value,
    version: EntryPointVersion,
    current: &[u8],
) -> Result<Bytes> {
    match version {
        EntryPointVersion::V06 => parse_v06_paymaster_and_data(result),
        EntryPointVersion::V07 => pack_v07_paymaster_and_data(result, current),
    }
}

/// v0.7 services answer with unpacked fields; gas limits they leave out are kept from
/// `current` (the stub already applied to the operation).
fn pack_v07_paymaster_and_data(result: &Value, current: &[u8]) -> Result<Bytes> {
    let v07 = result
        .get("entrypointV07Response")
        .or_else(|| result.get("entryPointV07Response"))
        .unwrap_or(result);
    if let Some(packed) = v07.get("paymasterAndData").and_then(Value::as_str) {
        return encoding::parse_bytes(packed).context("invalid hex in paymasterAndData");
    }

    let paymaster = v07
        .get("paymaster")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("missing paymaster field"))
        .and_then(encoding::parse_address)?;
    let gas = |key: &str, at: std::ops::Range<usize>| -> Result<[u8; 16]> {
        let value = optional_quantity(v07, key)?
            .or_else(|| current.get(at).map(U256::from_big_endian))
            .unwrap_or_default();
        if value.bits() > 128 {
            bail!("{key} does not fit in 128 bits: {value}");
        }
        Ok(value.low_u128().to_be_bytes())
    };
    let verification_gas = gas("paymasterVerificationGasLimit", 20..36)?;
    let post_op_gas = gas("paymasterPostOpGasLimit", 36..52)?;
    let data = match v07.get("paymasterData").and_then(Value::as_str) {
        Some(s) => encoding::parse_bytes(s).context("invalid hex in paymasterData")?,
        None => Bytes::default(),
    };

    let mut out = Vec::with_capacity(52 + data.len());
    out.extend_from_slice(paymaster.as_bytes());
    out.extend_from_slice(&verification_gas);
    out.extend_from_slice(&post_op_gas);
    out.extend_from_slice(&data);
    Ok(Bytes::from(out))
}

fn optional_quantity(v: &Value, key: &str) -> Result<Option<U256>> {
    match v.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(raw) => quantity(raw)
            .map(Some)
            .ok_or_else(|| anyhow!("invalid {key}: {raw}")),
    }
}

fn parse_sponsorship(result: &Value) -> Result<Sponsorship> {
    Ok(Sponsorship {
        paymaster_and_data: parse_v06_paymaster_and_data(result)?,
        call_gas_limit: optional_quantity(result, "callGasLimit")?,
        verification_gas_limit: optional_quantity(result, "verificationGasLimit")?,
        pre_verification_gas: optional_quantity(result, "preVerificationGas")?,
        max_fee_per_gas: optional_quantity(result, "maxFeePerGas")?,
        max_priority_fee_per_gas: optional_quantity(result, "maxPriorityFeePerGas")?,
    })
}

fn be_u64(b: &[u8]) -> u64 {
    b.iter().fold(0u64, |acc, x| (acc << 8) | *x as u64)
}

/// Splits a verifying paymaster's `paymasterAndData` into its parts.
///
/// Standard layout: `paymaster ‖ abi.encode(uint48 validUntil, uint48 validAfter) ‖ signature`.
/// The Alchemy v0.6 gas manager packs only `validUntil` (bytes 28..32) and starts its
/// signature at byte 52.
pub fn decode_paymaster_and_data(data: &[u8]) -> Result<PaymasterData> {
    if data.len() < 20 {
        bail!("paymasterAndData too short: {} bytes", data.len());
    }
    let paymaster = Address::from_slice(&data[..20]);

    if paymaster == ALCHEMY_V060_GAS_MANAGER {
        if data.len() < 52 {
            bail!("gas manager paymasterAndData too short: {} bytes", data.len());
        }
        return Ok(PaymasterData {
            paymaster,
            valid_until: be_u64(&data[28..32]),
            valid_after: 0,
            signature: Bytes::from(data[52..].to_vec()),
        });
    }

    if data.len() < 84 {
        bail!("paymasterAndData too short: {} bytes", data.len());
    }
    Ok(PaymasterData {
        paymaster,
        valid_until: be_u64(&data[44..52]),
        valid_after: be_u64(&data[76..84]),
        signature: Bytes::from(data[84..].to_vec()),
    })
}
