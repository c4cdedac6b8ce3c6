mod config;
mod deployments;
mod events;
mod handlers;
mod scanner;
mod store;

use clap::Parser;
use config::IndexerConfig;
use deployments::DeploymentArtifact;
use ethers::prelude::{Http, Provider};
use ethers::providers::Middleware;
use eyre::{eyre, Result};
use fs2::FileExt;
use handlers::Handlers;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::time::Duration;
use store::EntityStore;

#[derive(Parser, Debug)]
#[command(
    name = "light-indexer",
    version,
    about = "Indexes light wallet deployments and user operations from EntryPoint logs"
)]
struct Args {
    /// Path to a deployment artifact JSON (e.g., deployments/base.json)
    #[arg(long, default_value = "deployments/base.json")]
    deployment: PathBuf,

    /// Override RPC URL. If omitted, uses LIGHT_INDEXER_RPC_URL or deployment.rpc.
    #[arg(long)]
    rpc_url: Option<String>,

    /// Polling interval in seconds.
    #[arg(long, default_value_t = 15)]
    poll_seconds: u64,

    /// Block confirmations to wait before scanning logs.
    #[arg(long, default_value_t = 2)]
    confirmations: u64,

    /// Log scan chunk size (blocks per eth_getLogs request).
    #[arg(long, default_value_t = 2000)]
    log_chunk: u64,

    /// Max concurrent RPC calls.
    #[arg(long, default_value_t = 10)]
    max_concurrency: usize,

    /// Where to store indexed entities and the scan cursor.
    #[arg(long, default_value = "indexer-rs/state/entities.json")]
    store_file: PathBuf,

    /// Run a single scan and exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let deployment = DeploymentArtifact::load(&args.deployment)?;

    let cfg = IndexerConfig::from_cli_and_deployment(
        &deployment,
        args.rpc_url,
        args.poll_seconds,
        args.log_chunk,
        args.confirmations,
        args.store_file,
        args.max_concurrency,
        args.once,
    )?;

    let provider =
        Provider::<Http>::try_from(cfg.rpc_url.as_str())?.interval(Duration::from_millis(800));

    // Refuse to index another chain into this store.
    let remote_chain_id = provider.get_chainid().await?.as_u64();
    if remote_chain_id != cfg.chain_id {
        return Err(eyre!(
            "RPC chainId mismatch: deployment expects {}, but RPC reports {}. Refusing to run.",
            cfg.chain_id,
            remote_chain_id
        ));
    }

    let code = provider.get_code(cfg.entry_point, None).await?;
    if code.0.is_empty() {
        return Err(eyre!(
            "no contract code found at EntryPoint address {:?}. Check deployments JSON and RPC.",
            cfg.entry_point
        ));
    }

    if let Some(parent) = cfg.store_file.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| eyre!("failed to create store directory {}: {e}", parent.display()))?;
        }
    }

    // Single writer per store file.
    let lock_path = cfg.store_file.with_extension("lock");
    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|e| eyre!("failed to open lock file {}: {e}", lock_path.display()))?;
    lock_file.try_lock_exclusive().map_err(|e| {
        eyre!(
            "indexer already running or lock unavailable ({}): {e}",
            lock_path.display()
        )
    })?;
    let _lock_guard = lock_file;

    tracing::info!(
        chain_id = cfg.chain_id,
        entry_point = ?cfg.entry_point,
        factories = cfg.factories.len(),
        start_block = cfg.start_block,
        once = cfg.once,
        "indexer starting"
    );

    let mut store = EntityStore::load_or_init(&cfg.store_file, cfg.start_block)?;
    let handlers = Handlers::new(cfg.factories.iter().copied());

    loop {
        match scanner::scan_new_blocks(&provider, &cfg, &handlers, &mut store, &cfg.store_file).await {
            Ok(stats) => {
                if stats.transactions > 0 {
                    tracing::info!(
                        wallets = store.counter.light_wallets,
                        user_operations = store.counter.user_operations,
                        succeeded = store.counter.user_operations_succeeded,
                        reverted = store.counter.user_operations_reverted,
                        "totals"
                    );
                }
            }
            // A single-shot run reports the failure; the poll loop retries next cycle.
            Err(err) if !cfg.once => {
                tracing::warn!(error = %err, last_scanned_block = store.last_scanned_block, "scan failed; retrying next cycle");
            }
            Err(err) => return Err(err),
        }

        if cfg.once {
            break;
        }

        tokio::time::sleep(cfg.poll_interval).await;
    }

    Ok(())
}
