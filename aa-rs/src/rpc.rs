//! Minimal JSON-RPC 2.0 client shared by the bundler and paymaster clients.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

// ERC-4337 bundler error codes
pub const ENTRYPOINT_VALIDATION_REJECTED_CODE: i64 = -32500;
pub const PAYMASTER_VALIDATION_REJECTED_CODE: i64 = -32501;
pub const OPCODE_VIOLATION_CODE: i64 = -32502;
pub const OUT_OF_TIME_RANGE_CODE: i64 = -32503;
pub const THROTTLED_OR_BANNED_CODE: i64 = -32504;
pub const STAKE_TOO_LOW_CODE: i64 = -32505;
pub const UNSUPPORTED_AGGREGATOR_CODE: i64 = -32506;
pub const SIGNATURE_CHECK_FAILED_CODE: i64 = -32507;
pub const PAYMASTER_DEPOSIT_TOO_LOW_CODE: i64 = -32508;
pub const EXECUTION_REVERTED_CODE: i64 = -32521;

#[derive(Debug, Serialize)]
struct Request<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct Response {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<RpcError>,
}

/// Error object of a JSON-RPC response.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

impl RpcError {
    /// Short name of an ERC-4337 error code, if it is one.
    pub fn erc4337_kind(&self) -> Option<&'static str> {
        Some(match self.code {
            ENTRYPOINT_VALIDATION_REJECTED_CODE => "rejected by entry point validation",
            PAYMASTER_VALIDATION_REJECTED_CODE => "rejected by paymaster",
            OPCODE_VIOLATION_CODE => "banned opcode",
            OUT_OF_TIME_RANGE_CODE => "outside validity window",
            THROTTLED_OR_BANNED_CODE => "entity throttled or banned",
            STAKE_TOO_LOW_CODE => "stake too low",
            UNSUPPORTED_AGGREGATOR_CODE => "unsupported aggregator",
            SIGNATURE_CHECK_FAILED_CODE => "signature check failed",
            PAYMASTER_DEPOSIT_TOO_LOW_CODE => "paymaster deposit too low",
            EXECUTION_REVERTED_CODE => "execution reverted",
            _ => return None,
        })
    }
}

impl std::error::Error for RpcError {}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RPC error {}: {}", self.code, self.message)?;
        if let Some(kind) = self.erc4337_kind() {
            write!(f, " ({kind})")?;
        }
        if let Some(data) = &self.data {
            write!(f, " data={data}")?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct JsonRpcClient {
    url: String,
    http: reqwest::Client,
    next_id: AtomicU64,
}

impl Clone for JsonRpcClient {
    fn clone(&self) -> Self {
        Self {
            url: self.url.clone(),
            http: self.http.clone(),
            next_id: AtomicU64::new(self.next_id.load(Ordering::Relaxed)),
        }
    }
}

impl JsonRpcClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            http: reqwest::Client::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Sends one request and returns its `result` (`null` when absent).
    ///
    /// A JSON-RPC error object surfaces as an [`RpcError`] inside the returned error, so callers
    /// can `downcast_ref` it to look at the code.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let req = Request {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let resp = self
            .http
            .post(&self.url)
            .json(&req)
            .send()
            .await
            .with_context(|| format!("POST {} failed", self.url))?;

        let status = resp.status();
        let body: Value = resp.json().await.context("failed to decode JSON")?;
        parse_response(status, body)
    }
}

fn parse_response(status: reqwest::StatusCode, body: Value) -> Result<Value> {
    let parsed: Response = serde_json::from_value(body.clone())
        .with_context(|| format!("HTTP {status}: malformed JSON-RPC response: {body}"))?;

    if let Some(err) = parsed.error {
        return Err(err.into());
    }
    if !status.is_success() {
        anyhow::bail!("HTTP {status}: {body}");
    }
    Ok(parsed.result)
}

/// Hex or decimal quantity, as a string or a JSON number.
pub fn quantity(v: &Value) -> Option<ethers::types::U256> {
    match v {
        Value::String(s) => match s.strip_prefix("0x") {
            Some(hex) => crate::encoding::parse_u256_quantity(hex).ok(),
            None => ethers::types::U256::from_dec_str(s).ok(),
        },
        Value::Number(n) => n.as_u64().map(ethers::types::U256::from),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::U256;
    use reqwest::StatusCode;
    use serde_json::json;

    #[test]
    fn result_is_returned() {
        let v = parse_response(StatusCode::OK, json!({ "jsonrpc": "2.0", "id": 1, "result": "0x1" }))
            .unwrap();
        assert_eq!(v, json!("0x1"));
    }

    #[test]
    fn null_result_is_not_an_error() {
        let v = parse_response(StatusCode::OK, json!({ "id": 1, "result": null })).unwrap();
        assert!(v.is_null());
    }

    #[test]
    fn error_object_keeps_its_code() {
        let err = parse_response(
            StatusCode::OK,
            json!({
                "jsonrpc": "2.0",
                "id": 1,
                "error": { "code": -32507, "message": "AA24 signature error" }
            }),
        )
        .unwrap_err();
        let rpc = err.downcast_ref::<RpcError>().unwrap();
        assert_eq!(rpc.code, SIGNATURE_CHECK_FAILED_CODE);
        assert_eq!(rpc.erc4337_kind(), Some("signature check failed"));
        assert_eq!(
            rpc.to_string(),
            "RPC error -32507: AA24 signature error (signature check failed)"
        );
    }

    #[test]
    fn error_object_wins_over_http_status() {
        let err = parse_response(
            StatusCode::BAD_REQUEST,
            json!({ "error": { "code": -32602, "message": "invalid params", "data": "x" } }),
        )
        .unwrap_err();
        let rpc = err.downcast_ref::<RpcError>().unwrap();
        assert_eq!(rpc.erc4337_kind(), None);
        assert!(rpc.to_string().ends_with("data=\"x\""));
    }

    #[test]
    fn http_failure_without_error_object() {
        let err = parse_response(StatusCode::BAD_GATEWAY, json!({ "oops": true })).unwrap_err();
        assert!(err.to_string().starts_with("HTTP 502"));
    }

    #[test]
    fn quantities_in_any_shape() {
        assert_eq!(quantity(&json!("0x5208")), Some(U256::from(21_000)));
        assert_eq!(quantity(&json!("21000")), Some(U256::from(21_000)));
        assert_eq!(quantity(&json!(21000)), Some(U256::from(21_000)));
        assert_eq!(quantity(&json!("0x")), Some(U256::zero()));
        assert_eq!(quantity(&json!(null)), None);
        assert_eq!(quantity(&json!("0xzz")), None);
    }
}
