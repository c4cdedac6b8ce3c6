use crate::types::{EntryPointVersion, UserOperation};
use anyhow::{anyhow, Context, Result};
use ethers::types::{Address, Bytes, H256, U256};
use serde_json::Value;

pub fn fmt_address(addr: Address) -> String {
    format!("0x{}", hex::encode(addr.as_bytes()))
}

pub fn fmt_h256(h: H256) -> String {
    format!("0x{}", hex::encode(h.as_bytes()))
}

/// JSON-RPC "quantity" encoding.
pub fn fmt_u256(v: U256) -> String {
    if v.is_zero() {
        "0x0".to_string()
    } else {
        format!("0x{:x}", v)
    }
}

pub fn fmt_bytes(b: &Bytes) -> String {
    format!("0x{}", hex::encode(b.as_ref()))
}

/// Bundler / paymaster wire shape of an operation (no chain id, no hash).
pub fn user_op_to_json(op: &UserOperation) -> Value {
    serde_json::json!({
        "sender": fmt_address(op.sender()),
        "nonce": fmt_u256(op.nonce()),
        "initCode": fmt_bytes(op.init_code()),
        "callData": fmt_bytes(op.call_data()),
        "callGasLimit": fmt_u256(op.call_gas_limit()),
        "verificationGasLimit": fmt_u256(op.verification_gas_limit()),
        "preVerificationGas": fmt_u256(op.pre_verification_gas()),
        "maxFeePerGas": fmt_u256(op.max_fee_per_gas()),
        "maxPriorityFeePerGas": fmt_u256(op.max_priority_fee_per_gas()),
        "paymasterAndData": fmt_bytes(op.paymaster_and_data()),
        "signature": fmt_bytes(op.signature()),
    })
}

/// v0.7 wire shape: factory and paymaster fields travel unpacked.
pub fn user_op_to_json_v07(op: &UserOperation) -> Value {
    let mut v = serde_json::Map::new();
    v.insert("sender".into(), fmt_address(op.sender()).into());
    v.insert("nonce".into(), fmt_u256(op.nonce()).into());
    let init_code = op.init_code();
    if init_code.len() >= 20 {
        v.insert("factory".into(), fmt_address(Address::from_slice(&init_code[..20])).into());
        v.insert("factoryData".into(), format!("0x{}", hex::encode(&init_code[20..])).into());
    }
    v.insert("callData".into(), fmt_bytes(op.call_data()).into());
    v.insert("callGasLimit".into(), fmt_u256(op.call_gas_limit()).into());
    v.insert("verificationGasLimit".into(), fmt_u256(op.verification_gas_limit()).into());
    v.insert("preVerificationGas".into(), fmt_u256(op.pre_verification_gas()).into());
    v.insert("maxFeePerGas".into(), fmt_u256(op.max_fee_per_gas()).into());
    v.insert("maxPriorityFeePerGas".into(), fmt_u256(op.max_priority_fee_per_gas()).into());
    let pmd = op.paymaster_and_data();
    if pmd.len() >= 20 {
        // paymaster ‖ verificationGasLimit(16) ‖ postOpGasLimit(16) ‖ data
        let gas = |range: std::ops::Range<usize>| {
            pmd.get(range)
                .map(U256::from_big_endian)
                .unwrap_or_default()
        };
        v.insert("paymaster".into(), fmt_address(Address::from_slice(&pmd[..20])).into());
        v.insert("paymasterVerificationGasLimit".into(), fmt_u256(gas(20..36)).into());
        v.insert("paymasterPostOpGasLimit".into(), fmt_u256(gas(36..52)).into());
        let data = pmd.get(52..).unwrap_or_default();
        v.insert("paymasterData".into(), format!("0x{}", hex::encode(data)).into());
    }
    v.insert("signature".into(), fmt_bytes(op.signature()).into());
    Value::Object(v)
}

/// Wire shape the entry point's bundler expects.
pub fn user_op_to_wire(op: &UserOperation, entry_point: Address) -> Value {
    match EntryPointVersion::of(entry_point) {
        EntryPointVersion::V06 => user_op_to_json(op),
        EntryPointVersion::V07 => user_op_to_json_v07(op),
    }
}

/// Parses the wire shape back into an (unsealed) operation for `chain_id`.
pub fn user_op_from_json(v: &Value, chain_id: u64) -> Result<UserOperation> {
    let sender = parse_address(str_field(v, "sender")?).context("invalid sender")?;
    let mut op = UserOperation::new(sender, chain_id);
    op.set_nonce(parse_u256_quantity(str_field(v, "nonce")?)?);
    op.set_init_code(parse_bytes(str_field(v, "initCode")?).context("invalid initCode")?);
    op.set_call_data(parse_bytes(str_field(v, "callData")?).context("invalid callData")?);
    op.set_call_gas_limit(parse_u256_quantity(str_field(v, "callGasLimit")?)?);
    op.set_verification_gas_limit(parse_u256_quantity(str_field(v, "verificationGasLimit")?)?);
    op.set_pre_verification_gas(parse_u256_quantity(str_field(v, "preVerificationGas")?)?);
    op.set_max_fee_per_gas(parse_u256_quantity(str_field(v, "maxFeePerGas")?)?);
    op.set_max_priority_fee_per_gas(parse_u256_quantity(str_field(v, "maxPriorityFeePerGas")?)?);
    op.set_paymaster_and_data(
        parse_bytes(str_field(v, "paymasterAndData")?).context("invalid paymasterAndData")?,
    );
    if let Some(sig) = v.get("signature").and_then(|x| x.as_str()) {
        op.set_signature(parse_bytes(sig).context("invalid signature")?);
    }
    Ok(op)
}

fn str_field<'a>(v: &'a Value, key: &str) -> Result<&'a str> {
    v.get(key)
        .and_then(|x| x.as_str())
        .ok_or_else(|| anyhow!("missing or invalid field {key}"))
}

pub fn parse_u256_quantity(s: &str) -> Result<U256> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.is_empty() {
        return Ok(U256::zero());
    }
    Ok(U256::from_str_radix(s, 16)?)
}

pub fn parse_h256(s: &str) -> Result<H256> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(s)?;
    if bytes.len() != 32 {
        anyhow::bail!("expected 32-byte hex, got {} bytes", bytes.len());
    }
    Ok(H256::from_slice(&bytes))
}

pub fn parse_bytes(s: &str) -> Result<Bytes> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    Ok(Bytes::from(hex::decode(s)?))
}

pub fn parse_address(s: &str) -> Result<Address> {
    s.trim()
        .parse::<Address>()
        .map_err(|e| anyhow!("invalid address '{s}': {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn quantity_formatting() {
        assert_eq!(fmt_u256(U256::zero()), "0x0");
        assert_eq!(fmt_u256(U256::from(255)), "0xff");
        assert_eq!(parse_u256_quantity("0x").unwrap(), U256::zero());
        assert_eq!(parse_u256_quantity("0x2710").unwrap(), U256::from(10_000));
    }

    #[test]
    fn parse_h256_rejects_short_input() {
        assert!(parse_h256("0x1234").is_err());
        assert!(parse_h256(&format!("0x{}", "11".repeat(32))).is_ok());
    }

    #[test]
    fn wire_json_round_trip_keeps_fields() {
        let v = json!({
            "sender": "0x1306b01bc3e4ad202612d3843387e94737673f53",
            "nonce": "0x22ee",
            "initCode": "0x",
            "callData": "0xb61d27f6",
            "callGasLimit": "0x2710",
            "verificationGasLimit": "0x186a0",
            "preVerificationGas": "0x64",
            "maxFeePerGas": "0x1869f",
            "maxPriorityFeePerGas": "0x98967f",
            "paymasterAndData": "0x",
            "signature": "0x",
        });
        let op = user_op_from_json(&v, 10).unwrap();
        assert_eq!(op.nonce(), U256::from(8942));
        assert_eq!(op.chain_id(), 10);
        assert_eq!(op.call_data().to_vec(), vec![0xb6, 0x1d, 0x27, 0xf6]);
        assert_eq!(user_op_to_json(&op), v);
    }

    #[test]
    fn v07_wire_json_unpacks_factory_and_paymaster() {
        let mut op = UserOperation::new(Address::repeat_byte(0x13), 1);
        op.set_init_code(Bytes::from([vec![0xfa; 20], vec![0xab, 0xcd]].concat()));
        let mut pmd = vec![0x18; 20];
        pmd.extend_from_slice(&U256::from(100_000).low_u128().to_be_bytes());
        pmd.extend_from_slice(&U256::from(50_000).low_u128().to_be_bytes());
        pmd.extend_from_slice(&[0x08, 0x00, 0x85]);
        op.set_paymaster_and_data(Bytes::from(pmd));

        let ep = crate::types::ENTRY_POINT_V07;
        let v = user_op_to_wire(&op, ep);
        assert_eq!(v["factory"], json!(fmt_address(Address::repeat_byte(0xfa))));
        assert_eq!(v["factoryData"], json!("0xabcd"));
        assert_eq!(v["paymaster"], json!(fmt_address(Address::repeat_byte(0x18))));
        assert_eq!(v["paymasterVerificationGasLimit"], json!("0x186a0"));
        assert_eq!(v["paymasterPostOpGasLimit"], json!("0xc350"));
        assert_eq!(v["paymasterData"], json!("0x080085"));
        assert!(v.get("initCode").is_none());
        assert!(v.get("paymasterAndData").is_none());

        // a bare stub address still names the paymaster
        op.set_paymaster_and_data(Bytes::from(vec![0x18; 20]));
        op.set_init_code(Bytes::default());
        let v = user_op_to_json_v07(&op);
        assert_eq!(v["paymasterPostOpGasLimit"], json!("0x0"));
        assert_eq!(v["paymasterData"], json!("0x"));
        assert!(v.get("factory").is_none());

        let v06: Address = "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789".parse().unwrap();
        assert_eq!(user_op_to_wire(&op, v06), user_op_to_json(&op));
    }

    #[test]
    fn wire_json_requires_gas_fields() {
        let v = json!({ "sender": "0x1306b01bc3e4ad202612d3843387e94737673f53", "nonce": "0x0" });
        assert!(user_op_from_json(&v, 1).is_err());
    }
}
