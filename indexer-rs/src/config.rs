use crate::deployments::DeploymentArtifact;
use ethers::types::Address;
use eyre::{eyre, Result};
use std::{path::PathBuf, str::FromStr, time::Duration};

#[derive(Debug, Clone)]
pub struct IndexerConfig {
    pub chain_id: u64,
    pub rpc_url: String,
    pub entry_point: Address,
    pub factories: Vec<Address>,
    pub start_block: u64,

    pub poll_interval: Duration,
    pub log_chunk_size: u64,
    pub confirmations: u64,

    pub store_file: PathBuf,
    /// Max concurrent transaction / receipt / block fetches.
    pub max_concurrency: usize,

    pub once: bool,
}

impl IndexerConfig {
    #[allow(clippy::too_many_arguments)]
    pub fn from_cli_and_deployment(
        deployment: &DeploymentArtifact,
        rpc_override: Option<String>,
        poll_seconds: u64,
        log_chunk: u64,
        confirmations: u64,
        store_file: PathBuf,
        max_concurrency: usize,
        once: bool,
    ) -> Result<Self> {
        let rpc_url = rpc_override
            .or_else(|| std::env::var("LIGHT_INDEXER_RPC_URL").ok())
            .or_else(|| {
                deployment
                    .rpc_env_var
                    .as_ref()
                    .and_then(|k| std::env::var(k).ok())
            })
            .or_else(|| deployment.rpc.clone())
            .ok_or_else(|| {
                eyre!(
                    "no rpc url provided. pass --rpc-url, set LIGHT_INDEXER_RPC_URL, set deployment.rpcEnvVar, or include rpc in deployment json"
                )
            })?;

        let entry_point = Address::from_str(&deployment.entry_point).map_err(|e| {
            eyre!("invalid entryPoint address '{}': {e}", deployment.entry_point)
        })?;
        let factories = deployment
            .factories
            .iter()
            .map(|f| Address::from_str(f).map_err(|e| eyre!("invalid factory address '{f}': {e}")))
            .collect::<Result<Vec<_>>>()?;

        if log_chunk == 0 {
            return Err(eyre!("log chunk size must be > 0"));
        }
        if max_concurrency == 0 {
            return Err(eyre!("max concurrency must be > 0"));
        }

        if rpc_url.contains("alchemy.com/v2/") || rpc_url.contains("infura.io/v3/") {
            tracing::warn!("RPC URL looks like it may contain an API key; consider using LIGHT_INDEXER_RPC_URL env instead of committing it.");
        }

        Ok(Self {
            chain_id: deployment.chain_id,
            rpc_url,
            entry_point,
            factories,
            start_block: deployment.start_block,
            poll_interval: Duration::from_secs(poll_seconds.max(1)),
            log_chunk_size: log_chunk,
            confirmations,
            store_file,
            max_concurrency,
            once,
        })
    }
}
