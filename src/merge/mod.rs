//! Offline merger.
//!
//! Joins many hourly transaction CSVs into one deduplicated, chronologically
//! sorted, inclusion-annotated Parquet dataset plus a metadata CSV, with the
//! sourcelogs providing per-source arrival ordering.

pub mod inclusion;
pub mod loader;
pub mod writer;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::info;

use crate::types::TxRecord;
use writer::OutputPaths;

/// Merger configuration, assembled by the CLI front-end.
#[derive(Debug, Clone, Default)]
pub struct MergerConfig {
    pub out_dir: PathBuf,
    /// Optional filename prefix for the output artifacts.
    pub fn_prefix: Option<String>,
    /// Metadata CSVs whose hashes are dropped from this merge.
    pub tx_blacklist_files: Vec<PathBuf>,
    pub sourcelog_files: Vec<PathBuf>,
    /// Also write a `timestamp_ms,hash,raw_tx` CSV for re-hydration.
    pub write_tx_csv: bool,
    /// JSON-RPC endpoint for inclusion annotation; empty skips annotation.
    pub check_node_uri: Option<String>,
    pub input_files: Vec<PathBuf>,
}

fn must_be_file(path: &Path) -> Result<()> {
    if !path.is_file() {
        bail!("not a file: {}", path.display());
    }
    Ok(())
}

/// Run one merge: load, order sources, annotate inclusion, sort, write.
pub async fn run(cfg: MergerConfig) -> Result<()> {
    if cfg.input_files.is_empty() {
        bail!("no input files specified");
    }
    for f in cfg
        .input_files
        .iter()
        .chain(&cfg.sourcelog_files)
        .chain(&cfg.tx_blacklist_files)
    {
        must_be_file(f)?;
    }

    std::fs::create_dir_all(&cfg.out_dir)
        .with_context(|| format!("failed to create output dir {}", cfg.out_dir.display()))?;
    let paths = OutputPaths::new(&cfg.out_dir, cfg.fn_prefix.as_deref());
    writer::must_not_exist(&paths.parquet)?;
    writer::must_not_exist(&paths.metadata_csv)?;
    if cfg.write_tx_csv {
        writer::must_not_exist(&paths.transactions_csv)?;
    }

    info!(
        inputs = cfg.input_files.len(),
        sourcelogs = cfg.sourcelog_files.len(),
        blacklists = cfg.tx_blacklist_files.len(),
        out = %cfg.out_dir.display(),
        "merging transactions"
    );

    let mut txs = loader::load_transaction_csv_files(&cfg.input_files, &cfg.tx_blacklist_files)?;
    info!(tx_total = txs.len(), "loaded all input files");

    let sourcelog = loader::load_sourcelog_files(&cfg.sourcelog_files)?;
    for (hash, record) in txs.iter_mut() {
        record.summary.sources = loader::sources_by_arrival(&sourcelog, hash);
    }

    match cfg.check_node_uri.as_deref() {
        Some(uri) if !uri.is_empty() => inclusion::update_inclusion_status(uri, &mut txs).await?,
        _ => info!("no check node configured, skipping inclusion annotation"),
    }

    let records: Vec<TxRecord> = txs.into_values().collect();
    let summary = writer::write_outputs(records, &paths, cfg.write_tx_csv)?;
    info!(
        written = summary.written,
        skipped_outliers = summary.skipped_outliers,
        "merge complete"
    );
    Ok(())
}
