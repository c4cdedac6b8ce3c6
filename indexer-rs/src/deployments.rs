use eyre::{eyre, Result};
use serde::Deserialize;
use std::{fs, path::Path};

/// The parts of a deployment artifact the indexer reads; extra fields are ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentArtifact {
    pub chain_id: u64,
    #[serde(default)]
    pub rpc: Option<String>,
    /// Name of an environment variable holding the RPC URL, to keep API keys out of the file.
    #[serde(default)]
    pub rpc_env_var: Option<String>,
    pub entry_point: String,
    /// Light wallet factories whose accounts are indexed.
    #[serde(default)]
    pub factories: Vec<String>,
    pub start_block: u64,
}

impl DeploymentArtifact {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|e| eyre!("failed to read deployment artifact {}: {e}", path.display()))?;
        let art: DeploymentArtifact = serde_json::from_str(&raw).map_err(|e| {
            eyre!(
                "failed to parse deployment artifact {}: {e}",
                path.display()
            )
        })?;
        art.check()?;
        Ok(art)
    }

    fn check(&self) -> Result<()> {
        if self.entry_point.trim().is_empty() {
            return Err(eyre!("deployment artifact entryPoint is empty"));
        }
        if self.factories.is_empty() {
            return Err(eyre!("deployment artifact lists no factories"));
        }
        if self.start_block == 0 {
            tracing::warn!(
                "deployment artifact startBlock is 0; this will scan from genesis and may be slow"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_and_checks_artifact() {
        let art: DeploymentArtifact = serde_json::from_value(json!({
            "chainId": 8453,
            "rpcEnvVar": "BASE_RPC_URL",
            "entryPoint": "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789",
            "factories": ["0x0000000000756D3E6464f5efe7e413a0Af1C7474"],
            "startBlock": 6_000_000,
            "note": "ignored"
        }))
        .unwrap();
        assert!(art.check().is_ok());
        assert!(art.rpc.is_none());
        assert_eq!(art.factories.len(), 1);

        let empty: DeploymentArtifact = serde_json::from_value(json!({
            "chainId": 1,
            "entryPoint": "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789",
            "startBlock": 1
        }))
        .unwrap();
        assert!(empty.check().is_err());
    }
}
