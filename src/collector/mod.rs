//! Live mempool collector.
//!
//! Fans heterogeneous upstream subscriptions (peer nodes, vendor streams)
//! into a single bounded queue feeding one processor task that dedupes,
//! decodes and appends to hourly-rotated CSV outputs.

pub mod node;
pub mod processor;
pub mod vendor;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::types::{
    TxObservation, SOURCE_PEER, SOURCE_VENDOR_A, SOURCE_VENDOR_B, SOURCE_VENDOR_C,
};
use node::NodeConnection;
use processor::TxProcessor;
use vendor::VendorConnection;

/// Capacity of the fan-in queue. Sized so a ~50 ms processor stall at peak
/// mempool rates (~1k tx/s per source) loses nothing.
pub const PROCESSOR_QUEUE_CAPACITY: usize = 100_000;

/// Initial reconnect delay for all connectors.
pub const RECONNECT_INITIAL: Duration = Duration::from_secs(1);
/// Reconnect delay cap.
pub const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// Collector configuration, assembled by the CLI front-end.
#[derive(Debug, Clone, Default)]
pub struct CollectorConfig {
    /// Tag appended to output file names, so parallel collectors don't clash.
    pub uid: String,
    /// WebSocket URIs of execution clients to subscribe to.
    pub nodes: Vec<String>,
    pub out_dir: PathBuf,
    /// Optional JSON-RPC endpoint for advisory inclusion sampling.
    pub check_node_uri: Option<String>,
    pub vendor_a_token: Option<String>,
    pub vendor_b_token: Option<String>,
    pub vendor_c_api_key: Option<String>,
}

/// Per-connector counters. Owned by the connector, exported by copy.
#[derive(Debug, Default)]
pub struct SourceCounters {
    pub received: AtomicU64,
    pub dropped: AtomicU64,
}

/// Snapshot of one connector's counters.
#[derive(Debug, Clone)]
pub struct ConnectorStats {
    pub source: String,
    pub received: u64,
    pub dropped: u64,
}

/// Non-blocking publish into the fan-in queue.
///
/// A full queue drops the observation and bumps the drop counter; loss is
/// bounded by queue capacity rather than propagated upstream. Returns false
/// once the processor side is gone, signalling the connector to stop.
pub(crate) fn publish(
    queue: &mpsc::Sender<TxObservation>,
    obs: TxObservation,
    counters: &SourceCounters,
) -> bool {
    counters.received.fetch_add(1, Ordering::Relaxed);
    match queue.try_send(obs) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(obs)) => {
            let dropped = counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped == 1 || dropped % 10_000 == 0 {
                warn!(
                    source = %obs.source,
                    dropped,
                    "fan-in queue full, dropping observations"
                );
            }
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

/// Next reconnect delay: double up to the cap, then jitter by ±20% so a
/// burst of disconnected connectors doesn't thunder back in lockstep.
pub(crate) fn next_backoff(current: Duration) -> Duration {
    let doubled = (current * 2).min(RECONNECT_MAX);
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    Duration::from_millis((doubled.as_millis() as f64 * jitter) as u64)
}

/// Running collector: connector tasks plus the processor task.
pub struct Collector {
    connectors: Vec<JoinHandle<()>>,
    processor: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
    counters: Vec<(String, Arc<SourceCounters>)>,
}

impl Collector {
    /// Copy out the per-connector counters.
    pub fn stats(&self) -> Vec<ConnectorStats> {
        self.counters
            .iter()
            .map(|(source, c)| ConnectorStats {
                source: source.clone(),
                received: c.received.load(Ordering::Relaxed),
                dropped: c.dropped.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Stop connectors, let the processor drain the queue (bounded by its
    /// drain deadline), then flush and close the output files.
    pub async fn shutdown(mut self) {
        info!("shutting down collector");
        for handle in &self.connectors {
            handle.abort();
        }
        let _ = self.shutdown.send(true);
        if let Err(e) = (&mut self.processor).await {
            if !e.is_cancelled() {
                error!("processor task failed: {e}");
            }
        }
        for stats in self.stats() {
            info!(
                source = %stats.source,
                received = stats.received,
                dropped = stats.dropped,
                "connector totals"
            );
        }
    }

}

/// Start the processor and every configured connector in the background.
pub async fn start(cfg: CollectorConfig) -> Result<Collector> {
    std::fs::create_dir_all(&cfg.out_dir)
        .with_context(|| format!("failed to create output dir {}", cfg.out_dir.display()))?;

    let (obs_tx, obs_rx) = mpsc::channel(PROCESSOR_QUEUE_CAPACITY);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sample_tx = match &cfg.check_node_uri {
        Some(uri) if !uri.is_empty() => {
            let (tx, rx) = mpsc::channel(4);
            tokio::spawn(processor::run_inclusion_sampler(uri.clone(), rx));
            Some(tx)
        }
        _ => None,
    };

    let processor = TxProcessor::new(cfg.uid.clone(), cfg.out_dir.clone(), sample_tx);
    let processor_handle = tokio::spawn(processor.run(obs_rx, shutdown_rx));

    let mut connectors = Vec::new();
    let mut counters = Vec::new();

    for node_uri in &cfg.nodes {
        let c = Arc::new(SourceCounters::default());
        counters.push((format!("{SOURCE_PEER}:{node_uri}"), c.clone()));
        let conn = NodeConnection::new(node_uri.clone(), obs_tx.clone(), c);
        connectors.push(tokio::spawn(conn.run()));
    }

    if let Some(token) = cfg.vendor_a_token.clone() {
        let c = Arc::new(SourceCounters::default());
        counters.push((SOURCE_VENDOR_A.to_string(), c.clone()));
        let conn = VendorConnection::vendor_a(token, obs_tx.clone(), c)?;
        connectors.push(spawn_vendor(conn));
    }

    if let Some(token) = cfg.vendor_b_token.clone() {
        let c = Arc::new(SourceCounters::default());
        counters.push((SOURCE_VENDOR_B.to_string(), c.clone()));
        let conn = VendorConnection::vendor_b(token, obs_tx.clone(), c)?;
        connectors.push(spawn_vendor(conn));
    }

    if let Some(key) = cfg.vendor_c_api_key.clone() {
        let c = Arc::new(SourceCounters::default());
        counters.push((SOURCE_VENDOR_C.to_string(), c.clone()));
        let conn = VendorConnection::vendor_c(key, obs_tx.clone(), c)?;
        connectors.push(spawn_vendor(conn));
    }

    info!(
        nodes = cfg.nodes.len(),
        connectors = connectors.len(),
        out_dir = %cfg.out_dir.display(),
        "collector started"
    );

    Ok(Collector {
        connectors,
        processor: processor_handle,
        shutdown: shutdown_tx,
        counters,
    })
}

fn spawn_vendor(conn: VendorConnection) -> JoinHandle<()> {
    tokio::spawn(async move {
        let source = conn.source();
        if let Err(e) = conn.run().await {
            // Fatal configuration errors (bad credentials) land here; the
            // connector stays down until the operator fixes the config.
            error!(source, "vendor connector terminated: {e:#}");
        }
    })
}
