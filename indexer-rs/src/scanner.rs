use crate::config::IndexerConfig;
use crate::events::EventKind;
use crate::handlers::{HandleStats, Handlers, TxContext};
use crate::store::EntityStore;
use ethers::providers::Middleware;
use ethers::types::{Address, BlockNumber, Filter, Log, ValueOrArray, H256};
use eyre::{eyre, Result};
use futures::stream::{self, StreamExt, TryStreamExt};
use std::cmp;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Smallest block range the scanner shrinks to before giving up.
pub const MIN_CHUNK: u64 = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub transactions: usize,
    pub handled: HandleStats,
}

/// Indexes confirmed blocks after the store cursor, saving after every chunk.
pub async fn scan_new_blocks<M: Middleware>(
    client: &M,
    cfg: &IndexerConfig,
    handlers: &Handlers,
    store: &mut EntityStore,
    store_file: &Path,
) -> Result<ScanStats> {
    let latest = client
        .get_block_number()
        .await
        .map_err(|e| eyre!("eth_blockNumber failed: {e}"))?
        .as_u64();
    let target = latest.saturating_sub(cfg.confirmations);

    let from = store.last_scanned_block.saturating_add(1).max(cfg.start_block);
    if from > target {
        tracing::debug!(from, target, "no new blocks to scan (waiting for confirmations)");
        return Ok(ScanStats::default());
    }

    let mut chunk = cfg.log_chunk_size.max(1);
    let mut stats = ScanStats::default();

    tracing::info!(from, to = target, confirmations = cfg.confirmations, chunk, "scanning entry point logs");

    let mut cursor = from;
    while cursor <= target {
        let end = chunk_end(cursor, chunk, target);

        let logs = match fetch_logs_with_retries(client, cfg.entry_point, cursor, end).await {
            Ok(logs) => logs,
            Err(err) => {
                if chunk <= MIN_CHUNK {
                    return Err(err);
                }
                chunk = shrink_chunk(chunk);
                tracing::warn!(cursor, end, chunk, "log fetch failed; reducing chunk size and retrying");
                continue;
            }
        };

        let tx_hashes = transactions_in_order(&logs);
        let contexts = fetch_contexts(client, cfg, &tx_hashes).await?;
        for ctx in &contexts {
            let s = handlers.handle_transaction(store, ctx);
            stats.handled.events += s.events;
            stats.handled.wallets_created += s.wallets_created;
            stats.handled.user_operations_created += s.user_operations_created;
            stats.handled.skipped += s.skipped;
        }
        stats.transactions += contexts.len();

        store.last_scanned_block = end;
        store.save(store_file)?;
        cursor = end.saturating_add(1);
    }

    tracing::info!(
        transactions = stats.transactions,
        events = stats.handled.events,
        wallets = stats.handled.wallets_created,
        user_operations = stats.handled.user_operations_created,
        skipped = stats.handled.skipped,
        last_scanned_block = store.last_scanned_block,
        "scan complete"
    );
    Ok(stats)
}

pub fn chunk_end(cursor: u64, chunk: u64, target: u64) -> u64 {
    cmp::min(cursor.saturating_add(chunk.max(1) - 1), target)
}

pub fn shrink_chunk(chunk: u64) -> u64 {
    cmp::max(MIN_CHUNK, chunk / 2)
}

/// Distinct transaction hashes ordered by (block, log index) of their first log.
/// Logs missing a position keep the order the node returned them in.
pub fn transactions_in_order(logs: &[Log]) -> Vec<H256> {
    let mut first_seen: BTreeMap<(u64, u64, usize), H256> = BTreeMap::new();
    let mut seen = HashSet::new();
    for (arrival, log) in logs.iter().enumerate() {
        let Some(tx) = log.transaction_hash else {
            continue;
        };
        if !seen.insert(tx) {
            continue;
        }
        let block = log.block_number.map(|b| b.as_u64()).unwrap_or_default();
        let index = log.log_index.map(|i| i.as_u64()).unwrap_or_default();
        first_seen.insert((block, index, arrival), tx);
    }
    first_seen.into_values().collect()
}

async fn fetch_contexts<M: Middleware>(
    client: &M,
    cfg: &IndexerConfig,
    tx_hashes: &[H256],
) -> Result<Vec<TxContext>> {
    let fetched: Vec<(ethers::types::Transaction, ethers::types::TransactionReceipt)> =
        stream::iter(tx_hashes.iter().copied())
            .map(|hash| async move {
                let tx = client
                    .get_transaction(hash)
                    .await
                    .map_err(|e| eyre!("eth_getTransactionByHash {hash:?} failed: {e}"))?
                    .ok_or_else(|| eyre!("transaction {hash:?} not found"))?;
                let receipt = client
                    .get_transaction_receipt(hash)
                    .await
                    .map_err(|e| eyre!("eth_getTransactionReceipt {hash:?} failed: {e}"))?
                    .ok_or_else(|| eyre!("receipt for {hash:?} not found"))?;
                Ok::<_, eyre::Report>((tx, receipt))
            })
            .buffered(cfg.max_concurrency)
            .try_collect()
            .await?;

    let mut blocks: Vec<u64> = fetched
        .iter()
        .filter_map(|(_, r)| r.block_number.map(|b| b.as_u64()))
        .collect();
    blocks.sort_unstable();
    blocks.dedup();

    let timestamps: HashMap<u64, u64> = stream::iter(blocks)
        .map(|number| async move {
            let block = client
                .get_block(number)
                .await
                .map_err(|e| eyre!("eth_getBlockByNumber {number} failed: {e}"))?
                .ok_or_else(|| eyre!("block {number} not found"))?;
            Ok::<_, eyre::Report>((number, block.timestamp.as_u64()))
        })
        .buffer_unordered(cfg.max_concurrency)
        .try_collect()
        .await?;

    Ok(fetched
        .into_iter()
        .map(|(transaction, receipt)| {
            let block_timestamp = receipt
                .block_number
                .and_then(|b| timestamps.get(&b.as_u64()).copied())
                .unwrap_or_default();
            TxContext {
                chain_id: cfg.chain_id,
                entry_point: cfg.entry_point,
                transaction,
                receipt,
                block_timestamp,
            }
        })
        .collect())
}

fn log_filter(entry_point: Address, from: u64, to: u64) -> Filter {
    Filter::new()
        .address(entry_point)
        .topic0(ValueOrArray::Array(
            EventKind::all_topics().into_iter().map(Some).collect::<Vec<_>>(),
        ))
        .from_block(BlockNumber::Number(from.into()))
        .to_block(BlockNumber::Number(to.into()))
}

async fn fetch_logs_with_retries<M: Middleware>(
    client: &M,
    entry_point: Address,
    from: u64,
    to: u64,
) -> Result<Vec<Log>> {
    if from > to {
        return Err(eyre!("invalid log range: from({from}) > to({to})"));
    }

    let filter = log_filter(entry_point, from, to);

    // flaky or rate-limited RPCs
    let mut delay = Duration::from_millis(200);

    for attempt in 1..=3 {
        match client.get_logs(&filter).await {
            Ok(logs) => return Ok(logs),
            Err(err) => {
                if attempt == 3 {
                    return Err(eyre!("eth_getLogs [{from}, {to}] failed: {err}"));
                }
                tracing::warn!(
                    attempt,
                    from,
                    to,
                    sleep_ms = delay.as_millis() as u64,
                    error = %err,
                    "getLogs failed; retrying"
                );
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
        }
    }

    Err(eyre!("unreachable"))
}
