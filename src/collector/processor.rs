//! Live transaction processor.
//!
//! Single consumer of the fan-in queue. Owns the per-window dedupe set and
//! the open output files, so the hot path needs no locks: connectors only
//! ever touch the queue.

use std::collections::{HashSet, VecDeque};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::Duration;

use alloy::primitives::TxHash;
use alloy::providers::{Provider, ProviderBuilder};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::decode::parse_tx;
use crate::types::TxObservation;

/// How long the processor keeps draining the queue after shutdown.
const DRAIN_DEADLINE: Duration = Duration::from_secs(2);
/// Rotation check + writer flush cadence.
const FLUSH_INTERVAL: Duration = Duration::from_secs(10);
/// Advisory inclusion sampling cadence.
const SAMPLE_INTERVAL: Duration = Duration::from_secs(300);
/// How many recently first-seen hashes to keep for sampling.
const RECENT_CAP: usize = 4096;
/// Hashes per inclusion sample.
const SAMPLE_SIZE: usize = 32;

/// Output files of one rotation window.
struct WindowFiles {
    key: String,
    txs: BufWriter<File>,
    sourcelog: BufWriter<File>,
}

impl WindowFiles {
    fn flush(&mut self) -> Result<()> {
        self.txs.flush().context("flush transactions csv")?;
        self.sourcelog.flush().context("flush sourcelog csv")?;
        Ok(())
    }
}

pub struct TxProcessor {
    uid: String,
    out_dir: PathBuf,
    window: Option<WindowFiles>,

    /// Hashes seen in the current window. Cleared on rotation; cross-window
    /// duplicates are resolved by the merger.
    seen: HashSet<String>,
    recent: VecDeque<String>,

    cnt_total: u64,
    cnt_unique: u64,
    cnt_decode_failures: u64,

    sample_tx: Option<mpsc::Sender<Vec<String>>>,
}

impl TxProcessor {
    pub fn new(uid: String, out_dir: PathBuf, sample_tx: Option<mpsc::Sender<Vec<String>>>) -> Self {
        Self {
            uid,
            out_dir,
            window: None,
            seen: HashSet::new(),
            recent: VecDeque::with_capacity(RECENT_CAP),
            cnt_total: 0,
            cnt_unique: 0,
            cnt_decode_failures: 0,
            sample_tx,
        }
    }

    /// Consume observations until the queue closes or shutdown is signalled,
    /// then drain up to [`DRAIN_DEADLINE`] and close the output files.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<TxObservation>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut flush_tick = tokio::time::interval(FLUSH_INTERVAL);
        let mut sample_tick = tokio::time::interval(SAMPLE_INTERVAL);

        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(obs) => {
                        if let Err(e) = self.process_observation(&obs) {
                            // Output I/O failure is fatal to the run; partial
                            // files stay on disk.
                            error!("processor write failed, aborting: {e:#}");
                            return;
                        }
                    }
                    None => break,
                },
                _ = flush_tick.tick() => {
                    if let Err(e) = self.rotate_and_flush() {
                        error!("rotation failed, aborting: {e:#}");
                        return;
                    }
                }
                _ = sample_tick.tick() => self.dispatch_sample(),
                _ = shutdown.changed() => break,
            }
        }

        debug!("draining fan-in queue");
        let _ = tokio::time::timeout(DRAIN_DEADLINE, async {
            while let Some(obs) = rx.recv().await {
                if self.process_observation(&obs).is_err() {
                    break;
                }
            }
        })
        .await;

        if let Err(e) = self.close() {
            error!("failed to close output files: {e:#}");
        }
    }

    /// Admit one observation: sourcelog line always, transactions line on
    /// first sight with a decodable payload.
    fn process_observation(&mut self, obs: &TxObservation) -> Result<()> {
        self.roll_window(Utc::now())?;

        let hash = obs.hash.to_lowercase();
        self.cnt_total += 1;

        if self.seen.insert(hash.clone()) {
            match parse_tx(obs.received_at_ms, &obs.raw_tx) {
                Ok(summary) => {
                    if summary.hash != hash {
                        warn!(
                            advertised = %hash,
                            canonical = %summary.hash,
                            source = %obs.source,
                            "advertised hash does not match payload, archiving canonical hash"
                        );
                    }
                    let canonical = summary.hash;
                    let window = self.window.as_mut().context("output window not open")?;
                    writeln!(
                        window.txs,
                        "{},{},0x{}",
                        obs.received_at_ms,
                        canonical,
                        hex::encode(&obs.raw_tx)
                    )
                    .context("append transactions csv")?;
                    self.cnt_unique += 1;
                    self.push_recent(canonical);
                }
                Err(e) => {
                    // Hash stays in the seen-set so we don't retry the decode
                    // on every re-observation.
                    self.cnt_decode_failures += 1;
                    warn!(%hash, source = %obs.source, "failed to decode transaction: {e}");
                }
            }
        }

        let window = self.window.as_mut().context("output window not open")?;
        writeln!(
            window.sourcelog,
            "{},{},{}",
            hash, obs.received_at_ms, obs.source
        )
        .context("append sourcelog csv")?;

        Ok(())
    }

    /// Open the window for `now`, rotating away from the previous one if the
    /// wall-clock hour changed.
    fn roll_window(&mut self, now: DateTime<Utc>) -> Result<()> {
        let key = window_key(now);
        let stale = self.window.as_ref().map(|w| w.key != key).unwrap_or(true);
        if stale {
            self.rotate_to(key)?;
        }
        Ok(())
    }

    fn rotate_to(&mut self, key: String) -> Result<()> {
        if let Some(mut old) = self.window.take() {
            old.flush()?;
            info!(
                window = %old.key,
                observations = self.cnt_total,
                unique = self.cnt_unique,
                decode_failures = self.cnt_decode_failures,
                "closed output window"
            );
        }
        self.seen.clear();
        self.cnt_total = 0;
        self.cnt_unique = 0;
        self.cnt_decode_failures = 0;

        let txs_path = self
            .out_dir
            .join(format!("transactions_{key}_{}.csv", self.uid));
        let sourcelog_path = self
            .out_dir
            .join(format!("sourcelog_{key}_{}.csv", self.uid));

        let txs = BufWriter::new(
            File::options()
                .create(true)
                .append(true)
                .open(&txs_path)
                .with_context(|| format!("failed to open {}", txs_path.display()))?,
        );
        let sourcelog = BufWriter::new(
            File::options()
                .create(true)
                .append(true)
                .open(&sourcelog_path)
                .with_context(|| format!("failed to open {}", sourcelog_path.display()))?,
        );

        info!(
            transactions = %txs_path.display(),
            sourcelog = %sourcelog_path.display(),
            "opened output window"
        );
        self.window = Some(WindowFiles {
            key,
            txs,
            sourcelog,
        });
        Ok(())
    }

    fn rotate_and_flush(&mut self) -> Result<()> {
        self.roll_window(Utc::now())?;
        if let Some(window) = self.window.as_mut() {
            window.flush()?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut window) = self.window.take() {
            window.flush()?;
            info!(
                window = %window.key,
                observations = self.cnt_total,
                unique = self.cnt_unique,
                "collector output closed"
            );
        }
        Ok(())
    }

    fn push_recent(&mut self, hash: String) {
        if self.recent.len() == RECENT_CAP {
            self.recent.pop_front();
        }
        self.recent.push_back(hash);
    }

    /// Hand a copy of recently seen hashes to the inclusion sampler. Advisory
    /// only; a busy sampler just skips a round.
    fn dispatch_sample(&mut self) {
        let Some(tx) = &self.sample_tx else { return };
        if self.recent.is_empty() {
            return;
        }
        let batch: Vec<String> = self
            .recent
            .iter()
            .rev()
            .take(SAMPLE_SIZE)
            .cloned()
            .collect();
        if tx.try_send(batch).is_err() {
            debug!("inclusion sampler busy, skipping sample round");
        }
    }
}

fn window_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d_%H-00").to_string()
}

/// Background task resolving sampled hashes against a JSON-RPC node and
/// logging how many already landed on-chain. Never affects output.
pub(crate) async fn run_inclusion_sampler(
    check_node_uri: String,
    mut rx: mpsc::Receiver<Vec<String>>,
) {
    let url = match check_node_uri.parse() {
        Ok(url) => url,
        Err(e) => {
            error!(endpoint = %check_node_uri, "invalid check-node URI: {e}");
            return;
        }
    };
    let provider = ProviderBuilder::new().connect_http(url);
    info!(endpoint = %check_node_uri, "inclusion sampler ready");

    while let Some(batch) = rx.recv().await {
        let sampled = batch.len();
        let mut included = 0usize;
        for hash in batch {
            let Ok(h) = hash.parse::<TxHash>() else {
                continue;
            };
            match provider.get_transaction_by_hash(h).await {
                Ok(Some(tx)) if tx.block_number.is_some() => included += 1,
                Ok(_) => {}
                Err(e) => debug!(%hash, "inclusion sample lookup failed: {e}"),
            }
        }
        info!(sampled, included, "advisory inclusion sample");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::consensus::{SignableTransaction, TxEip1559, TxEnvelope};
    use alloy::eips::eip2718::Encodable2718;
    use alloy::primitives::{address, keccak256, Bytes, TxKind, B256, U256};
    use alloy::signers::local::PrivateKeySigner;
    use alloy::signers::SignerSync;
    use tempfile::tempdir;

    fn raw_tx(nonce: u64) -> (String, Vec<u8>) {
        let signer = PrivateKeySigner::from_bytes(&B256::repeat_byte(0x17)).unwrap();
        let tx = TxEip1559 {
            chain_id: 1,
            nonce,
            gas_limit: 21_000,
            max_fee_per_gas: 10_000_000_000,
            max_priority_fee_per_gas: 1_000_000_000,
            to: TxKind::Call(address!("d8dA6BF26964aF9D7eEd9e03E53415D37aA96045")),
            value: U256::from(1u64),
            access_list: Default::default(),
            input: Bytes::default(),
        };
        let sig = signer.sign_hash_sync(&tx.signature_hash()).unwrap();
        let envelope: TxEnvelope = tx.into_signed(sig).into();
        let raw = envelope.encoded_2718();
        let hash = format!("0x{}", hex::encode(keccak256(&raw)));
        (hash, raw)
    }

    fn obs(ts: i64, hash: &str, raw: &[u8]) -> TxObservation {
        TxObservation {
            received_at_ms: ts,
            hash: hash.to_string(),
            raw_tx: raw.to_vec(),
            source: "peer".to_string(),
        }
    }

    fn window_paths(dir: &std::path::Path, uid: &str) -> (PathBuf, PathBuf) {
        let key = window_key(Utc::now());
        (
            dir.join(format!("transactions_{key}_{uid}.csv")),
            dir.join(format!("sourcelog_{key}_{uid}.csv")),
        )
    }

    #[test]
    fn test_single_source_ingest_dedupes_transactions_not_sourcelog() {
        let dir = tempdir().unwrap();
        let mut p = TxProcessor::new("t".to_string(), dir.path().to_path_buf(), None);

        let (h1, raw1) = raw_tx(1);
        let (h2, raw2) = raw_tx(2);

        p.process_observation(&obs(1000, &h1, &raw1)).unwrap();
        p.process_observation(&obs(1001, &h2, &raw2)).unwrap();
        p.process_observation(&obs(1002, &h1, &raw1)).unwrap();
        p.close().unwrap();

        let (txs_path, sourcelog_path) = window_paths(dir.path(), "t");
        let txs = std::fs::read_to_string(txs_path).unwrap();
        let sourcelog = std::fs::read_to_string(sourcelog_path).unwrap();

        let tx_lines: Vec<&str> = txs.lines().collect();
        assert_eq!(tx_lines.len(), 2);
        assert!(tx_lines[0].starts_with(&format!("1000,{h1},0x")));
        assert!(tx_lines[1].starts_with(&format!("1001,{h2},0x")));

        let sl_lines: Vec<&str> = sourcelog.lines().collect();
        assert_eq!(sl_lines.len(), 3);
        assert_eq!(sl_lines[0], format!("{h1},1000,peer"));
        assert_eq!(sl_lines[1], format!("{h2},1001,peer"));
        assert_eq!(sl_lines[2], format!("{h1},1002,peer"));
    }

    #[test]
    fn test_rotation_clears_seen_set() {
        let dir = tempdir().unwrap();
        let mut p = TxProcessor::new("t".to_string(), dir.path().to_path_buf(), None);

        let (h1, raw1) = raw_tx(1);
        p.process_observation(&obs(1000, &h1, &raw1)).unwrap();
        assert_eq!(p.cnt_unique, 1);
        assert!(p.seen.contains(&h1));

        p.rotate_to("rotated".to_string()).unwrap();
        assert!(p.seen.is_empty(), "rotation clears the dedupe set");
        assert_eq!(p.cnt_unique, 0);

        // The next observation re-opens the wall-clock window (appending to
        // the earlier file) and treats the hash as first-sight again.
        p.process_observation(&obs(2000, &h1, &raw1)).unwrap();
        assert_eq!(p.cnt_unique, 1);
        p.close().unwrap();

        let (txs_path, _) = window_paths(dir.path(), "t");
        let txs = std::fs::read_to_string(txs_path).unwrap();
        assert_eq!(txs.lines().count(), 2, "one line per first sight");
    }

    #[test]
    fn test_decode_failure_is_remembered_and_sourcelogged() {
        let dir = tempdir().unwrap();
        let mut p = TxProcessor::new("t".to_string(), dir.path().to_path_buf(), None);

        let bad = obs(1000, "0xdead", &[0xff, 0xff]);
        p.process_observation(&bad).unwrap();
        p.process_observation(&bad).unwrap();
        assert_eq!(p.cnt_decode_failures, 1, "decode is not retried");
        p.close().unwrap();

        let (txs_path, sourcelog_path) = window_paths(dir.path(), "t");
        assert_eq!(
            std::fs::read_to_string(txs_path).unwrap().lines().count(),
            0
        );
        assert_eq!(
            std::fs::read_to_string(sourcelog_path)
                .unwrap()
                .lines()
                .count(),
            2
        );
    }
}
