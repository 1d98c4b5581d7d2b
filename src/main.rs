//! Mempool Archiver CLI
//!
//! Two stages plus a reporting tool:
//!   collect - subscribe to mempool sources, write hourly CSV archives
//!   merge   - join hourly archives into Parquet + metadata CSV
//!   analyze - per-source stats and latency comparisons over raw archives
//!
//! Vendor credentials can be passed as flags or environment variables
//! (VENDOR_A_AUTH_TOKEN, VENDOR_B_AUTH_TOKEN, VENDOR_C_API_KEY).

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use dotenv::dotenv;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mempool_archiver::analyze::Analyzer;
use mempool_archiver::collector::{self, CollectorConfig};
use mempool_archiver::merge::{self, loader, MergerConfig};
use mempool_archiver::types::{SourceComp, TxSummaryEntry};

#[derive(Parser, Debug)]
#[command(name = "mempool-archiver", version)]
#[command(about = "Collect, merge and analyze Ethereum mempool transactions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Collect mempool transactions from all configured sources
    Collect(CollectArgs),

    /// Merge hourly archives into a Parquet dataset + metadata CSV
    Merge(MergeArgs),

    /// Analyze raw archives and print a summary report
    Analyze(AnalyzeArgs),
}

#[derive(Args, Debug)]
struct CollectArgs {
    /// Output directory for hourly CSV archives
    #[arg(long, default_value = "out")]
    out_dir: PathBuf,

    /// Tag appended to output filenames (random if omitted)
    #[arg(long)]
    uid: Option<String>,

    /// Execution client WebSocket URI (repeatable)
    #[arg(long = "node")]
    nodes: Vec<String>,

    /// JSON-RPC endpoint for advisory inclusion sampling
    #[arg(long)]
    check_node: Option<String>,

    /// Bearer token for the vendor A stream
    #[arg(long)]
    vendor_a_token: Option<String>,

    /// Bearer token for the vendor B stream
    #[arg(long)]
    vendor_b_token: Option<String>,

    /// API key for the vendor C stream
    #[arg(long)]
    vendor_c_api_key: Option<String>,
}

#[derive(Args, Debug)]
struct MergeArgs {
    /// Output directory
    #[arg(long, default_value = "out")]
    out: PathBuf,

    /// Filename prefix for output artifacts
    #[arg(long)]
    fn_prefix: Option<String>,

    /// Metadata CSV with already-known hashes to drop (repeatable)
    #[arg(long = "tx-blacklist")]
    tx_blacklist: Vec<PathBuf>,

    /// Sourcelog CSV (repeatable)
    #[arg(long = "sourcelog")]
    sourcelog: Vec<PathBuf>,

    /// Also write a timestamp_ms,hash,raw_tx CSV for re-hydration
    #[arg(long)]
    write_tx_csv: bool,

    /// JSON-RPC endpoint for inclusion annotation (skipped if omitted)
    #[arg(long)]
    check_node: Option<String>,

    /// Raw transactions CSV inputs
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
}

#[derive(Args, Debug)]
struct AnalyzeArgs {
    /// Sourcelog CSV (repeatable)
    #[arg(long = "sourcelog", required = true)]
    sourcelog: Vec<PathBuf>,

    /// Latency comparison pair as source:reference (repeatable)
    #[arg(long = "cmp")]
    cmp: Vec<String>,

    /// Metadata CSV with already-known hashes to drop (repeatable)
    #[arg(long = "tx-blacklist")]
    tx_blacklist: Vec<PathBuf>,

    /// JSON-RPC endpoint for inclusion annotation (skipped if omitted)
    #[arg(long)]
    check_node: Option<String>,

    /// Raw transactions CSV inputs
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Collect(args) => run_collect(args).await,
        Commands::Merge(args) => run_merge(args).await,
        Commands::Analyze(args) => run_analyze(args).await,
    }
}

fn env_opt(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.is_empty())
}

async fn run_collect(args: CollectArgs) -> Result<()> {
    let uid = args
        .uid
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| format!("{:04x}", rand::random::<u16>()));

    let cfg = CollectorConfig {
        uid: uid.clone(),
        nodes: args.nodes,
        out_dir: args.out_dir,
        check_node_uri: args.check_node.or_else(|| env_opt("CHECK_NODE_URI")),
        vendor_a_token: args
            .vendor_a_token
            .or_else(|| env_opt("VENDOR_A_AUTH_TOKEN")),
        vendor_b_token: args
            .vendor_b_token
            .or_else(|| env_opt("VENDOR_B_AUTH_TOKEN")),
        vendor_c_api_key: args.vendor_c_api_key.or_else(|| env_opt("VENDOR_C_API_KEY")),
    };

    if cfg.nodes.is_empty()
        && cfg.vendor_a_token.is_none()
        && cfg.vendor_b_token.is_none()
        && cfg.vendor_c_api_key.is_none()
    {
        bail!("no sources configured, pass --node or a vendor credential");
    }

    info!(uid, "starting collector");
    let collector = collector::start(cfg).await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    collector.shutdown().await;
    Ok(())
}

async fn run_merge(args: MergeArgs) -> Result<()> {
    merge::run(MergerConfig {
        out_dir: args.out,
        fn_prefix: args.fn_prefix,
        tx_blacklist_files: args.tx_blacklist,
        sourcelog_files: args.sourcelog,
        write_tx_csv: args.write_tx_csv,
        check_node_uri: args.check_node,
        input_files: args.inputs,
    })
    .await
}

async fn run_analyze(args: AnalyzeArgs) -> Result<()> {
    let comps = args
        .cmp
        .iter()
        .map(|pair| match pair.split_once(':') {
            Some((source, reference)) if !source.is_empty() && !reference.is_empty() => {
                Ok(SourceComp::new(source, reference))
            }
            _ => bail!("invalid --cmp '{pair}', expected source:reference"),
        })
        .collect::<Result<Vec<_>>>()?;

    let mut txs = loader::load_transaction_csv_files(&args.inputs, &args.tx_blacklist)?;
    let sourcelog = loader::load_sourcelog_files(&args.sourcelog)?;
    for (hash, record) in txs.iter_mut() {
        record.summary.sources = loader::sources_by_arrival(&sourcelog, hash);
    }

    match args.check_node.as_deref() {
        Some(uri) if !uri.is_empty() => {
            merge::inclusion::update_inclusion_status(uri, &mut txs).await?
        }
        _ => info!("no check node configured, inclusion columns stay empty"),
    }

    let summaries: std::collections::HashMap<String, TxSummaryEntry> = txs
        .into_iter()
        .map(|(hash, record)| (hash, record.summary))
        .collect();

    let analyzer = Analyzer::new(&summaries, &sourcelog, comps);
    println!("{}", analyzer.report()?);
    Ok(())
}
