use crate::wallet::{Factory, FactoryVersion};
use anyhow::{anyhow, Context, Result};
use ethers::types::Address;
use serde::Deserialize;
use std::{env, fs, path::Path};

/// Deployment artifact as written to `deployments/<network>.json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRaw {
    pub chain_id: u64,
    pub rpc: String,
    #[serde(default)]
    pub rpc_env_var: Option<String>,
    pub entry_point: String,
    pub factory: String,
    pub implementation: String,
    pub factory_version: String,
    #[serde(default)]
    pub bundler: Option<String>,
    #[serde(default)]
    pub paymaster: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Deployment {
    pub chain_id: u64,
    pub rpc_url: String,
    pub entry_point: Address,
    pub factory: Factory,
    pub bundler_url: Option<String>,
    pub paymaster_url: Option<String>,
}

pub fn load_deployment(path: &Path, rpc_override: Option<String>) -> Result<Deployment> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read deployment json at {}", path.display()))?;
    let raw: DeploymentRaw = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse deployment json at {}", path.display()))?;
    from_raw(raw, rpc_override).with_context(|| format!("invalid deployment {}", path.display()))
}

fn from_raw(raw: DeploymentRaw, rpc_override: Option<String>) -> Result<Deployment> {
    let rpc_url = if let Some(rpc) = rpc_override {
        rpc
    } else if let Some(env_var) = raw.rpc_env_var.clone() {
        env::var(&env_var).unwrap_or(raw.rpc.clone())
    } else {
        raw.rpc.clone()
    };

    let factory = Factory {
        address: parse_addr(&raw.factory).context("invalid factory address")?,
        implementation: parse_addr(&raw.implementation)
            .context("invalid implementation address")?,
        version: raw.factory_version.parse::<FactoryVersion>()?,
    };

    Ok(Deployment {
        chain_id: raw.chain_id,
        rpc_url,
        entry_point: parse_addr(&raw.entry_point).context("invalid entryPoint address")?,
        factory,
        bundler_url: raw.bundler,
        paymaster_url: raw.paymaster,
    })
}

fn parse_addr(s: &str) -> Result<Address> {
    s.parse::<Address>().map_err(|e| anyhow!("{e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(v: serde_json::Value) -> DeploymentRaw {
        serde_json::from_value(v).unwrap()
    }

    fn base() -> serde_json::Value {
        json!({
            "chainId": 8453,
            "rpc": "https://mainnet.base.org",
            "entryPoint": "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789",
            "factory": "0x0000000000756D3E6464f5efe7e413a0Af1C7474",
            "implementation": "0x00000000000000000000000000000000000000aa",
            "factoryVersion": "v0.3.0",
            "bundler": "https://bundler.example/rpc"
        })
    }

    #[test]
    fn parses_light_deployment() {
        let d = from_raw(raw(base()), None).unwrap();
        assert_eq!(d.chain_id, 8453);
        assert_eq!(d.factory.version, FactoryVersion::V030);
        assert_eq!(d.rpc_url, "https://mainnet.base.org");
        assert_eq!(d.bundler_url.as_deref(), Some("https://bundler.example/rpc"));
        assert!(d.paymaster_url.is_none());
    }

    #[test]
    fn rpc_override_wins() {
        let d = from_raw(raw(base()), Some("http://localhost:8545".into())).unwrap();
        assert_eq!(d.rpc_url, "http://localhost:8545");
    }

    #[test]
    fn unset_rpc_env_var_falls_back_to_rpc_field() {
        let mut v = base();
        v["rpcEnvVar"] = json!("LIGHT_AA_TEST_SURELY_UNSET_RPC");
        let d = from_raw(raw(v), None).unwrap();
        assert_eq!(d.rpc_url, "https://mainnet.base.org");
    }

    #[test]
    fn rejects_bad_version_and_addresses() {
        let mut v = base();
        v["factoryVersion"] = json!("v9");
        assert!(from_raw(raw(v), None).is_err());

        let mut v = base();
        v["entryPoint"] = json!("0x1234");
        assert!(from_raw(raw(v), None).is_err());
    }
}
