//! Merged-dataset output: Parquet, metadata CSV and optional transactions CSV.
//!
//! Entries are sorted by `(timestamp_ms, hash)` before writing so the
//! columnar file is non-decreasing in time and reproducible within a run.
//! Gzip is the codec of choice: every analytical tool downstream reads it.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arrow::array::{ArrayRef, Int64Array, StringArray, TimestampMillisecondArray};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, GzipLevel};
use parquet::file::properties::{EnabledStatistics, WriterProperties};
use parquet::schema::types::ColumnPath;
use tracing::info;

use crate::types::{TxRecord, TX_SUMMARY_CSV_HEADER};

/// Entries included this long (or longer) before first observation are
/// data-quality outliers and dropped from output.
pub const INCLUSION_DELAY_OUTLIER_MS: i64 = -12_000;

/// Parquet page size: 1 MiB.
const PAGE_SIZE_BYTES: usize = 1024 * 1024;
/// Row-group cap in rows; parquet-rs sizes groups by row count, and at the
/// typical ~500 byte row this lands near the 128 MiB target.
const MAX_ROW_GROUP_ROWS: usize = 256 * 1024;
/// Rows buffered per Arrow record batch.
const BATCH_ROWS: usize = 65_536;

/// High-cardinality string columns where per-column statistics buy nothing.
const NO_STATS_COLUMNS: &[&str] = &[
    "hash",
    "from",
    "value",
    "nonce",
    "gas",
    "gasPrice",
    "gasTipCap",
    "gasFeeCap",
];
/// Low-cardinality columns worth dictionary-encoding.
const DICT_COLUMNS: &[&str] = &["to", "data4Bytes"];

/// Output locations for one merge run.
#[derive(Debug, Clone)]
pub struct OutputPaths {
    pub parquet: PathBuf,
    pub metadata_csv: PathBuf,
    pub transactions_csv: PathBuf,
}

impl OutputPaths {
    pub fn new(out_dir: &Path, fn_prefix: Option<&str>) -> Self {
        match fn_prefix {
            Some(prefix) if !prefix.is_empty() => Self {
                parquet: out_dir.join(format!("{prefix}.parquet")),
                metadata_csv: out_dir.join(format!("{prefix}.csv")),
                transactions_csv: out_dir.join(format!("{prefix}_transactions.csv")),
            },
            _ => Self {
                parquet: out_dir.join("transactions.parquet"),
                metadata_csv: out_dir.join("metadata.csv"),
                transactions_csv: out_dir.join("transactions.csv"),
            },
        }
    }
}

/// Refuse to clobber previous runs.
pub fn must_not_exist(path: &Path) -> Result<()> {
    if path.exists() {
        bail!("output file already exists: {}", path.display());
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct WriteSummary {
    pub written: usize,
    pub skipped_outliers: usize,
}

fn parquet_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new(
            "timestamp",
            DataType::Timestamp(TimeUnit::Millisecond, None),
            false,
        ),
        Field::new("hash", DataType::Utf8, false),
        Field::new("chainId", DataType::Utf8, false),
        Field::new("from", DataType::Utf8, false),
        Field::new("to", DataType::Utf8, false),
        Field::new("value", DataType::Utf8, false),
        Field::new("nonce", DataType::Utf8, false),
        Field::new("gas", DataType::Utf8, false),
        Field::new("gasPrice", DataType::Utf8, false),
        Field::new("gasTipCap", DataType::Utf8, false),
        Field::new("gasFeeCap", DataType::Utf8, false),
        Field::new("dataSize", DataType::Int64, false),
        Field::new("data4Bytes", DataType::Utf8, false),
    ]))
}

fn writer_properties() -> WriterProperties {
    let mut builder = WriterProperties::builder()
        .set_compression(Compression::GZIP(GzipLevel::default()))
        .set_data_page_size_limit(PAGE_SIZE_BYTES)
        .set_max_row_group_size(MAX_ROW_GROUP_ROWS)
        .set_dictionary_enabled(false);
    for col in DICT_COLUMNS {
        builder = builder.set_column_dictionary_enabled(ColumnPath::from(*col), true);
    }
    for col in NO_STATS_COLUMNS {
        builder = builder.set_column_statistics_enabled(ColumnPath::from(*col), EnabledStatistics::None);
    }
    builder.build()
}

/// Column accumulator for one Arrow batch.
#[derive(Default)]
struct ColumnBuffers {
    timestamp: Vec<i64>,
    hash: Vec<String>,
    chain_id: Vec<String>,
    from: Vec<String>,
    to: Vec<String>,
    value: Vec<String>,
    nonce: Vec<String>,
    gas: Vec<String>,
    gas_price: Vec<String>,
    gas_tip_cap: Vec<String>,
    gas_fee_cap: Vec<String>,
    data_size: Vec<i64>,
    data_4bytes: Vec<String>,
}

impl ColumnBuffers {
    fn push(&mut self, record: &TxRecord) {
        let s = &record.summary;
        self.timestamp.push(s.timestamp_ms);
        self.hash.push(s.hash.clone());
        self.chain_id.push(s.chain_id.clone());
        self.from.push(s.from.clone());
        self.to.push(s.to.clone());
        self.value.push(s.value.clone());
        self.nonce.push(s.nonce.clone());
        self.gas.push(s.gas.clone());
        self.gas_price.push(s.gas_price.clone());
        self.gas_tip_cap.push(s.gas_tip_cap.clone());
        self.gas_fee_cap.push(s.gas_fee_cap.clone());
        self.data_size.push(s.data_size);
        self.data_4bytes.push(s.data_4bytes.clone());
    }

    fn len(&self) -> usize {
        self.timestamp.len()
    }

    fn into_batch(self, schema: Arc<Schema>) -> Result<RecordBatch> {
        let columns: Vec<ArrayRef> = vec![
            Arc::new(TimestampMillisecondArray::from(self.timestamp)),
            Arc::new(StringArray::from(self.hash)),
            Arc::new(StringArray::from(self.chain_id)),
            Arc::new(StringArray::from(self.from)),
            Arc::new(StringArray::from(self.to)),
            Arc::new(StringArray::from(self.value)),
            Arc::new(StringArray::from(self.nonce)),
            Arc::new(StringArray::from(self.gas)),
            Arc::new(StringArray::from(self.gas_price)),
            Arc::new(StringArray::from(self.gas_tip_cap)),
            Arc::new(StringArray::from(self.gas_fee_cap)),
            Arc::new(Int64Array::from(self.data_size)),
            Arc::new(StringArray::from(self.data_4bytes)),
        ];
        RecordBatch::try_new(schema, columns).context("build record batch")
    }
}

/// Sort, filter outliers and write every output artifact.
pub fn write_outputs(
    mut records: Vec<TxRecord>,
    paths: &OutputPaths,
    write_tx_csv: bool,
) -> Result<WriteSummary> {
    records.sort_by(|a, b| {
        a.summary
            .timestamp_ms
            .cmp(&b.summary.timestamp_ms)
            .then_with(|| a.summary.hash.cmp(&b.summary.hash))
    });

    let mut meta_csv = BufWriter::new(
        File::create(&paths.metadata_csv)
            .with_context(|| format!("failed to create {}", paths.metadata_csv.display()))?,
    );
    writeln!(meta_csv, "{TX_SUMMARY_CSV_HEADER}").context("write metadata header")?;

    let mut tx_csv = if write_tx_csv {
        let mut w = BufWriter::new(
            File::create(&paths.transactions_csv).with_context(|| {
                format!("failed to create {}", paths.transactions_csv.display())
            })?,
        );
        writeln!(w, "timestamp_ms,hash,raw_tx").context("write transactions header")?;
        Some(w)
    } else {
        None
    };

    let schema = parquet_schema();
    let parquet_file = File::create(&paths.parquet)
        .with_context(|| format!("failed to create {}", paths.parquet.display()))?;
    let mut parquet = ArrowWriter::try_new(parquet_file, schema.clone(), Some(writer_properties()))
        .context("open parquet writer")?;

    let total = records.len();
    let mut summary = WriteSummary::default();
    let mut buffers = ColumnBuffers::default();

    for record in &records {
        if record.summary.inclusion_delay_ms <= INCLUSION_DELAY_OUTLIER_MS {
            info!(
                hash = %record.summary.hash,
                block = record.summary.included_at_block_height,
                inclusion_delay_ms = record.summary.inclusion_delay_ms,
                "skipping transaction included long before first sighting"
            );
            summary.skipped_outliers += 1;
            continue;
        }

        buffers.push(record);
        if buffers.len() == BATCH_ROWS {
            let batch = std::mem::take(&mut buffers).into_batch(schema.clone())?;
            parquet.write(&batch).context("write parquet batch")?;
        }

        writeln!(meta_csv, "{}", record.summary.to_csv_row()).context("write metadata row")?;
        if let Some(w) = tx_csv.as_mut() {
            writeln!(
                w,
                "{},{},{}",
                record.summary.timestamp_ms, record.summary.hash, record.raw_tx
            )
            .context("write transactions row")?;
        }

        summary.written += 1;
        if summary.written % 100_000 == 0 {
            info!(written = summary.written, total, "writing transactions");
        }
    }

    if buffers.len() > 0 {
        let batch = buffers.into_batch(schema)?;
        parquet.write(&batch).context("write parquet batch")?;
    }

    parquet.close().context("close parquet writer")?;
    meta_csv.flush().context("flush metadata csv")?;
    if let Some(mut w) = tx_csv {
        w.flush().context("flush transactions csv")?;
    }

    info!(
        written = summary.written,
        skipped = summary.skipped_outliers,
        parquet = %paths.parquet.display(),
        "output files written"
    );
    Ok(summary)
}
