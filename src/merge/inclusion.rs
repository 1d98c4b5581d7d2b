//! On-chain inclusion annotation.
//!
//! A small pool of RPC workers resolves every merged transaction against a
//! JSON-RPC node: `eth_getTransactionByHash` for the inclusion block, then
//! `eth_getBlockByNumber` for that block's timestamp. Lookups are not
//! retried; a failed entry simply stays at height 0.

use std::collections::HashMap;
use std::sync::Arc;

use alloy::providers::{Provider, ProviderBuilder};
use alloy::primitives::TxHash;
use anyhow::{Context, Result};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::types::{TxRecord, TxSummaryEntry};

/// `MERGER_RPC_WORKERS` overrides the worker count.
pub const DEFAULT_RPC_WORKERS: usize = 4;

/// Work queue capacity; holds a full day of mempool traffic so the driver
/// can enqueue everything before reading responses.
const RPC_QUEUE_CAPACITY: usize = 2_000_000;

pub fn rpc_worker_count() -> usize {
    std::env::var("MERGER_RPC_WORKERS")
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|&n| n > 0)
        .unwrap_or(DEFAULT_RPC_WORKERS)
}

struct Job {
    index: usize,
    hash: String,
}

struct Inclusion {
    block_height: u64,
    block_timestamp: u64,
}

/// Write the inclusion fields into a summary entry.
pub fn apply_inclusion(summary: &mut TxSummaryEntry, block_height: i64, block_timestamp: i64) {
    summary.included_at_block_height = block_height;
    summary.included_block_timestamp = block_timestamp;
    summary.inclusion_delay_ms = block_timestamp * 1000 - summary.timestamp_ms;
}

/// Annotate every entry with its inclusion status.
///
/// Each worker owns one provider; entries are partitioned by dequeue so no
/// worker ever touches another's entries. The driver enqueues all jobs, then
/// reads exactly one response per job; response order is meaningless.
pub async fn update_inclusion_status(
    check_node_uri: &str,
    txs: &mut HashMap<String, TxRecord>,
) -> Result<()> {
    let workers = rpc_worker_count();
    let url: reqwest::Url = check_node_uri
        .parse()
        .with_context(|| format!("invalid check-node URI {check_node_uri}"))?;

    let hashes: Vec<String> = txs.keys().cloned().collect();
    let total = hashes.len();
    if total == 0 {
        return Ok(());
    }
    info!(total, workers, "checking inclusion status");

    let (job_tx, job_rx) = mpsc::channel::<Job>(RPC_QUEUE_CAPACITY.min(total));
    let job_rx = Arc::new(Mutex::new(job_rx));
    // Response capacity covers every job, so workers never block on it.
    let (resp_tx, mut resp_rx) = mpsc::channel::<(usize, Result<Option<Inclusion>>)>(total);

    for _ in 0..workers {
        let provider = ProviderBuilder::new().connect_http(url.clone());
        let job_rx = job_rx.clone();
        let resp_tx = resp_tx.clone();
        tokio::spawn(async move {
            loop {
                let job = {
                    let mut rx = job_rx.lock().await;
                    rx.recv().await
                };
                let Some(job) = job else { break };
                let result = lookup_inclusion(&provider, &job.hash).await;
                if resp_tx.send((job.index, result)).await.is_err() {
                    break;
                }
            }
        });
    }
    drop(resp_tx);

    for (index, hash) in hashes.iter().enumerate() {
        job_tx
            .send(Job {
                index,
                hash: hash.clone(),
            })
            .await
            .context("inclusion work queue closed early")?;
    }
    drop(job_tx);

    let mut cnt_included = 0u64;
    let mut cnt_failed = 0u64;
    for i in 0..total {
        let (index, result) = resp_rx
            .recv()
            .await
            .context("inclusion response channel closed early")?;
        match result {
            Ok(Some(inclusion)) => {
                if let Some(record) = txs.get_mut(&hashes[index]) {
                    apply_inclusion(
                        &mut record.summary,
                        inclusion.block_height as i64,
                        inclusion.block_timestamp as i64,
                    );
                    cnt_included += 1;
                }
            }
            Ok(None) => {}
            Err(e) => {
                cnt_failed += 1;
                warn!(hash = %hashes[index], "inclusion lookup failed: {e:#}");
            }
        }
        if i > 0 && i % 10_000 == 0 {
            info!(progress = i, total, "inclusion check progress");
        }
    }

    info!(
        total,
        included = cnt_included,
        failed = cnt_failed,
        "inclusion checks done"
    );
    Ok(())
}

async fn lookup_inclusion(
    provider: &impl Provider,
    hash: &str,
) -> Result<Option<Inclusion>> {
    let h: TxHash = hash.parse().context("malformed transaction hash")?;

    let Some(tx) = provider
        .get_transaction_by_hash(h)
        .await
        .context("eth_getTransactionByHash")?
    else {
        return Ok(None);
    };
    let Some(block_height) = tx.block_number else {
        // Known to the node but still pending.
        return Ok(None);
    };

    let block = provider
        .get_block_by_number(block_height.into())
        .await
        .context("eth_getBlockByNumber")?
        .with_context(|| format!("inclusion block {block_height} not found"))?;

    Ok(Some(Inclusion {
        block_height,
        block_timestamp: block.header.timestamp,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_inclusion_delay_arithmetic() {
        let mut summary = TxSummaryEntry {
            timestamp_ms: 100_000,
            ..Default::default()
        };
        apply_inclusion(&mut summary, 1, 85);
        assert_eq!(summary.included_at_block_height, 1);
        assert_eq!(summary.included_block_timestamp, 85);
        assert_eq!(summary.inclusion_delay_ms, -15_000);
    }

    #[test]
    fn test_worker_count_env_override() {
        std::env::remove_var("MERGER_RPC_WORKERS");
        assert_eq!(rpc_worker_count(), DEFAULT_RPC_WORKERS);

        std::env::set_var("MERGER_RPC_WORKERS", "9");
        assert_eq!(rpc_worker_count(), 9);

        std::env::set_var("MERGER_RPC_WORKERS", "0");
        assert_eq!(rpc_worker_count(), DEFAULT_RPC_WORKERS);

        std::env::set_var("MERGER_RPC_WORKERS", "nope");
        assert_eq!(rpc_worker_count(), DEFAULT_RPC_WORKERS);
        std::env::remove_var("MERGER_RPC_WORKERS");
    }
}
