//! Raw-archive loading for the merger.
//!
//! Scans the hourly transactions CSVs line-wise (they can be far larger than
//! memory-friendly CSV readers enjoy), dedupes across files keeping the
//! earliest timestamp per hash, drops blacklisted hashes, and loads the
//! sourcelogs that drive source-arrival ordering.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::decode::parse_tx;
use crate::types::{hex_to_bytes, Sourcelog, TxRecord};

/// Shortest well-formed transactions-CSV line: anything under this cannot
/// even hold a timestamp plus a 66-char hash.
const MIN_LINE_BYTES: usize = 66;

/// Load transactions CSV files into a map keyed by lowercase hash.
///
/// Hashes found in any blacklist file are dropped entirely. Duplicates keep
/// the earliest observed timestamp. Lines that are short, malformed or carry
/// an undecodable payload are skipped entry-locally.
pub fn load_transaction_csv_files(
    files: &[PathBuf],
    blacklist_files: &[PathBuf],
) -> Result<HashMap<String, TxRecord>> {
    let blacklist = load_tx_blacklist(blacklist_files)?;

    let mut txs: HashMap<String, TxRecord> = HashMap::new();
    for filename in files {
        info!(file = %filename.display(), "loading transactions");
        let file = File::open(filename)
            .with_context(|| format!("failed to open {}", filename.display()))?;

        let mut cnt_in_file = 0u64;
        let mut cnt_new = 0u64;

        for line in BufReader::new(file).lines() {
            let line = line.context("read line")?;
            if line.is_empty() {
                continue;
            }
            if line.len() < MIN_LINE_BYTES {
                warn!(file = %filename.display(), "skipping short line ({} bytes)", line.len());
                continue;
            }

            let items: Vec<&str> = line.split(',').collect();
            if items.len() != 3 {
                warn!(file = %filename.display(), line, "invalid line, expected 3 fields");
                continue;
            }
            cnt_in_file += 1;

            let ts_ms: i64 = match items[0].parse() {
                Ok(ts) => ts,
                Err(_) => {
                    warn!(file = %filename.display(), line, "invalid timestamp");
                    continue;
                }
            };
            let hash = items[1].to_lowercase();

            if blacklist.contains(&hash) {
                debug!(%hash, "skipping blacklisted transaction");
                continue;
            }

            if let Some(existing) = txs.get_mut(&hash) {
                // Earliest sighting across all input files wins.
                if ts_ms < existing.summary.timestamp_ms {
                    existing.summary.timestamp_ms = ts_ms;
                }
                continue;
            }

            let raw = match hex_to_bytes(items[2]) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(%hash, "invalid raw tx hex: {e}");
                    continue;
                }
            };
            match parse_tx(ts_ms, &raw) {
                Ok(summary) => {
                    txs.insert(
                        hash,
                        TxRecord {
                            raw_tx: items[2].to_string(),
                            summary,
                        },
                    );
                    cnt_new += 1;
                }
                Err(e) => {
                    warn!(%hash, "failed to decode transaction: {e}");
                }
            }
        }

        info!(
            file = %filename.display(),
            tx_in_file = cnt_in_file,
            tx_new = cnt_new,
            tx_total = txs.len(),
            "processed file"
        );
    }
    Ok(txs)
}

/// Load already-known transaction hashes from metadata CSVs (the hash lives
/// in column index 1).
pub fn load_tx_blacklist(files: &[PathBuf]) -> Result<HashSet<String>> {
    let mut hashes = HashSet::new();
    for filename in files {
        info!(file = %filename.display(), "loading tx blacklist");
        let file = File::open(filename)
            .with_context(|| format!("failed to open {}", filename.display()))?;
        for line in BufReader::new(file).lines() {
            let line = line.context("read line")?;
            let items: Vec<&str> = line.split(',').collect();
            if items.len() < 2 {
                warn!(file = %filename.display(), line, "invalid blacklist line");
                continue;
            }
            hashes.insert(items[1].to_lowercase());
        }
    }
    Ok(hashes)
}

/// Load sourcelog CSVs (`hash,timestamp_ms,source`) keeping the earliest
/// timestamp per `(hash, source)` pair.
pub fn load_sourcelog_files(files: &[PathBuf]) -> Result<Sourcelog> {
    let mut sourcelog: Sourcelog = HashMap::new();
    let mut cnt_rows = 0u64;
    for filename in files {
        info!(file = %filename.display(), "loading sourcelog");
        let file = File::open(filename)
            .with_context(|| format!("failed to open {}", filename.display()))?;
        for line in BufReader::new(file).lines() {
            let line = line.context("read line")?;
            if line.is_empty() {
                continue;
            }
            let items: Vec<&str> = line.split(',').collect();
            if items.len() != 3 {
                warn!(file = %filename.display(), line, "invalid sourcelog line");
                continue;
            }
            let ts_ms: i64 = match items[1].parse() {
                Ok(ts) => ts,
                Err(_) => {
                    warn!(file = %filename.display(), line, "invalid sourcelog timestamp");
                    continue;
                }
            };
            let hash = items[0].to_lowercase();
            let source = items[2].to_string();

            let earliest = sourcelog
                .entry(hash)
                .or_default()
                .entry(source)
                .or_insert(ts_ms);
            if ts_ms < *earliest {
                *earliest = ts_ms;
            }
            cnt_rows += 1;
        }
    }
    info!(rows = cnt_rows, hashes = sourcelog.len(), "sourcelog loaded");
    Ok(sourcelog)
}

/// Source tags for one hash, ascending by each source's earliest timestamp.
/// Ties break on the tag itself so output is deterministic.
pub fn sources_by_arrival(sourcelog: &Sourcelog, hash: &str) -> Vec<String> {
    let Some(times) = sourcelog.get(hash) else {
        return Vec::new();
    };
    let mut with_ts: Vec<(&String, i64)> = times.iter().map(|(s, &ts)| (s, ts)).collect();
    with_ts.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));
    with_ts.into_iter().map(|(s, _)| s.clone()).collect()
}
