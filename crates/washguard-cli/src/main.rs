use std::time::Duration;

use alloy::network::EthereumWallet;
use alloy::primitives::Address;
use alloy::providers::ProviderBuilder;
use alloy::signers::local::PrivateKeySigner;
use chrono::Utc;
use clap::{ArgAction, Args, Parser, Subcommand};
use color_eyre::eyre::{eyre, Context, Result};
use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::Table;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;
use washguard_analysis::classify::TrackingMode;
use washguard_analysis::detector::{average_hold_blocks, evaluate, trades_per_hour, DetectorConfig};
use washguard_analysis::dispatch::{ActionSink, ContractSink, DetectionLog, Dispatcher};
use washguard_analysis::scan::{ScanConfig, ScanReport, Scanner};
use washguard_data::source::{connect_all, EventSource, FallbackSource};
use washguard_data::state::GuardState;
use washguard_data::store::SnapshotStore;

#[derive(Parser, Debug)]
#[command(name = "washguard")]
#[command(about = "Batch detector for wash-trading bots on an ERC-20 token")]
#[command(version)]
struct Cli {
    #[arg(long, short = 'v', action = ArgAction::Count, global = true)]
    verbose: u8,

    #[arg(long, short = 'q', global = true)]
    quiet: bool,

    #[arg(long, global = true, env = "WASHGUARD_DB", default_value = "data/washguard.sqlite")]
    db_path: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Scan new blocks, update trader histories, and act on detections.
    Run(RunArgs),
    /// Show the persisted snapshot summary.
    Status,
    /// Show one trader's history statistics and current verdict.
    Inspect(InspectArgs),
}

/// Detection thresholds shared by `run` and `inspect`.
#[derive(Args, Debug, Clone)]
struct DetectorArgs {
    /// Trades required before a trader is evaluated.
    #[arg(long, default_value_t = 8)]
    min_trades: usize,

    /// Incoming/outgoing balance ratio treated as wash trading.
    #[arg(long, default_value_t = 0.85)]
    wash_ratio: f64,

    /// Average hold time (blocks) below which trading is rapid.
    #[arg(long, default_value_t = 100.0)]
    max_avg_hold: f64,

    /// Trades per hour above which trading is high frequency.
    #[arg(long, default_value_t = 20.0)]
    max_trades_per_hour: f64,

    /// Chain block time in seconds.
    #[arg(long, default_value_t = 3)]
    seconds_per_block: u64,
}

impl DetectorArgs {
    fn to_config(&self) -> DetectorConfig {
        DetectorConfig {
            min_trades: self.min_trades,
            wash_ratio: self.wash_ratio,
            max_avg_hold_blocks: self.max_avg_hold,
            max_trades_per_hour: self.max_trades_per_hour,
            seconds_per_block: self.seconds_per_block,
        }
    }
}

#[derive(Args, Debug)]
struct RunArgs {
    /// RPC endpoints in priority order.
    #[arg(long = "rpc-url", env = "WASHGUARD_RPC_URLS", value_delimiter = ',', required = true)]
    rpc_urls: Vec<String>,

    /// Token contract whose transfers are monitored.
    #[arg(long, env = "WASHGUARD_TOKEN")]
    token: Address,

    /// Liquidity pair; when set only swaps against it are tracked.
    #[arg(long, env = "WASHGUARD_PAIR")]
    pair: Option<Address>,

    #[command(flatten)]
    detector: DetectorArgs,

    /// Blocks per chunk.
    #[arg(long, default_value_t = 50)]
    chunk_size: u64,

    /// Chunks fetched per run at most.
    #[arg(long, default_value_t = 20)]
    max_chunks: usize,

    /// Blocks behind head to start from on the first run.
    #[arg(long, default_value_t = 50)]
    lookback: u64,

    /// JSON Lines file receiving one record per detection.
    #[arg(long, default_value = "data/detections.jsonl")]
    detections_log: String,

    /// Submit detected addresses to the token's blacklist (needs WASHGUARD_OPERATOR_KEY).
    #[arg(long)]
    blacklist: bool,

    /// Seconds to wait for a blacklist receipt.
    #[arg(long, default_value_t = 60)]
    receipt_timeout_secs: u64,

    /// Retry the log or blacklist action for earlier detections whose action failed.
    #[arg(long)]
    retry_pending: bool,
}

impl RunArgs {
    fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            chunk_size: self.chunk_size,
            max_chunks: self.max_chunks,
            lookback_blocks: self.lookback,
        }
    }
}

#[derive(Args, Debug)]
struct InspectArgs {
    /// Trader address.
    #[arg(long)]
    address: Address,

    #[command(flatten)]
    detector: DetectorArgs,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet)?;

    match cli.command {
        Commands::Run(args) => handle_run(&cli.db_path, args).await,
        Commands::Status => handle_status(&cli.db_path),
        Commands::Inspect(args) => handle_inspect(&cli.db_path, args),
    }
}

fn init_tracing(verbose: u8, quiet: bool) -> Result<()> {
    let level = if quiet {
        Level::WARN
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.as_str()))
        .wrap_err("failed to initialize tracing filter")?;

    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

async fn handle_run(db_path: &str, args: RunArgs) -> Result<()> {
    let started = Utc::now();
    ensure_parent_dir(db_path)?;
    let store = SnapshotStore::new(db_path).wrap_err("failed to open snapshot store")?;

    let source = connect_all(&args.rpc_urls, args.token)
        .await
        .wrap_err("no RPC endpoint reachable")?;
    let head = source
        .head_block()
        .await
        .wrap_err("failed to read chain head")?;

    let scan_config = args.scan_config();
    let state = match store.load().wrap_err("failed to load snapshot")? {
        Some(state) => state,
        None => {
            info!(
                head,
                lookback = scan_config.lookback_blocks,
                "no previous snapshot, starting fresh"
            );
            scan_config.initial_state(head)
        }
    };
    info!(
        watermark = state.watermark(),
        traders = state.traders().len(),
        detected = state.detected().len(),
        endpoints = %source.endpoints().collect::<Vec<_>>().join(", "),
        "state loaded"
    );

    let log = DetectionLog::new(&args.detections_log);
    if args.blacklist {
        let key = std::env::var("WASHGUARD_OPERATOR_KEY")
            .map_err(|_| eyre!("WASHGUARD_OPERATOR_KEY is required with --blacklist"))?;
        let signer: PrivateKeySigner = key.parse().wrap_err("invalid operator key")?;
        // Blacklist calls go to the first endpoint that answered at startup.
        let rpc_url = source
            .primary()
            .map(|endpoint| endpoint.label())
            .ok_or_else(|| eyre!("no reachable RPC endpoint for blacklist calls"))?;
        info!(rpc_url, "blacklist mode enabled");
        let provider = ProviderBuilder::new()
            .wallet(EthereumWallet::from(signer))
            .on_http(rpc_url.parse().wrap_err("invalid RPC URL format")?);
        let sink = ContractSink::new(
            args.token,
            provider,
            Duration::from_secs(args.receipt_timeout_secs),
        );
        let dispatcher = Dispatcher::with_sink(log, sink);
        execute(&store, &source, state, &dispatcher, &args, head, started).await
    } else {
        let dispatcher = Dispatcher::monitor(log);
        execute(&store, &source, state, &dispatcher, &args, head, started).await
    }
}

async fn execute<S: EventSource, K: ActionSink>(
    store: &SnapshotStore,
    source: &FallbackSource<S>,
    mut state: GuardState,
    dispatcher: &Dispatcher<K>,
    args: &RunArgs,
    head: u64,
    started: chrono::DateTime<Utc>,
) -> Result<()> {
    if args.retry_pending {
        let completed = dispatcher.retry_pending(&mut state).await;
        info!(completed, "retried pending detection actions");
    }

    let scanner = Scanner::new(
        source,
        dispatcher,
        TrackingMode::from_pair(args.pair),
        args.detector.to_config(),
        args.scan_config(),
    );

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} {msg}")
            .wrap_err("failed to create progress style")?,
    );
    pb.set_message(format!(
        "scanning blocks {} → {}",
        state.watermark().saturating_add(1),
        head
    ));
    pb.enable_steady_tick(Duration::from_millis(100));

    let report = scanner.run(&mut state, head).await;
    pb.finish_and_clear();

    state.touch(Utc::now());
    store.save(&state).wrap_err("failed to persist snapshot")?;

    print_run_summary(&state, &report, started);
    Ok(())
}

fn print_run_summary(state: &GuardState, report: &ScanReport, started: chrono::DateTime<Utc>) {
    if !report.detections.is_empty() {
        let mut detections = Table::new();
        detections.load_preset(UTF8_BORDERS_ONLY);
        detections.set_header(vec!["Address", "Block", "Reasons", "Action"]);
        for detection in &report.detections {
            detections.add_row(vec![
                detection.address.to_checksum(None),
                detection.block_number.to_string(),
                detection.reasons.join("\n"),
                detection.outcome.label(),
            ]);
        }
        println!("{}\n", detections);
    }

    let summary = state.summary();
    let duration = Utc::now().signed_duration_since(started);
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Metric", "Value"]);
    table.add_row(vec!["Addresses tracked".to_string(), summary.addresses_tracked.to_string()]);
    table.add_row(vec!["Bots detected".to_string(), summary.bots_detected.to_string()]);
    table.add_row(vec!["New detections".to_string(), report.detections.len().to_string()]);
    table.add_row(vec!["Actions pending".to_string(), summary.actions_pending.to_string()]);
    table.add_row(vec![
        "Chunks scanned".to_string(),
        format!("{}/{}", report.chunks_scanned, report.chunks_planned),
    ]);
    table.add_row(vec!["Transfers processed".to_string(), report.events_processed.to_string()]);
    table.add_row(vec!["Last block scanned".to_string(), summary.watermark.to_string()]);
    table.add_row(vec!["Chain head".to_string(), report.head.to_string()]);
    table.add_row(vec![
        "Duration".to_string(),
        format!("{:.2}s", duration.num_milliseconds() as f64 / 1000.0),
    ]);
    println!("{}\n", table);

    if let Some(failed) = &report.failed_chunk {
        println!(
            "Chunk {}..={} failed on all {} endpoint(s); it will be retried next run.",
            failed.from_block,
            failed.to_block,
            failed.attempts.len()
        );
    } else if !report.reached_head() && report.chunks_planned > 0 {
        println!("Chunk budget exhausted before reaching head; continuing next run.");
    }
}

fn handle_status(db_path: &str) -> Result<()> {
    let store = SnapshotStore::new(db_path).wrap_err("failed to open snapshot store")?;
    let Some(state) = store.load().wrap_err("failed to load snapshot")? else {
        println!("No snapshot in {db_path} yet.");
        return Ok(());
    };

    let summary = state.summary();
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Metric", "Value"]);
    table.add_row(vec!["Watermark".to_string(), summary.watermark.to_string()]);
    table.add_row(vec![
        "Last update".to_string(),
        state
            .last_update()
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "-".to_string()),
    ]);
    table.add_row(vec!["Addresses tracked".to_string(), summary.addresses_tracked.to_string()]);
    table.add_row(vec!["Bots detected".to_string(), summary.bots_detected.to_string()]);
    table.add_row(vec!["Actions pending".to_string(), summary.actions_pending.to_string()]);
    println!("{}\n", table);

    if !state.detected().is_empty() {
        let mut bots = Table::new();
        bots.load_preset(UTF8_BORDERS_ONLY);
        bots.set_header(vec!["Bot", "Trades", "First seen", "Actioned"]);
        for address in state.detected() {
            let (trades, first_seen) = state
                .trader(address)
                .map(|h| (h.trade_count().to_string(), h.first_seen().to_string()))
                .unwrap_or_else(|| ("-".to_string(), "-".to_string()));
            bots.add_row(vec![
                address.to_checksum(None),
                trades,
                first_seen,
                state.is_actioned(address).to_string(),
            ]);
        }
        println!("{}\n", bots);
    }

    Ok(())
}

fn handle_inspect(db_path: &str, args: InspectArgs) -> Result<()> {
    let store = SnapshotStore::new(db_path).wrap_err("failed to open snapshot store")?;
    let state = store
        .load()
        .wrap_err("failed to load snapshot")?
        .ok_or_else(|| eyre!("no snapshot in {db_path}"))?;
    let history = state
        .trader(&args.address)
        .ok_or_else(|| eyre!("address {} has no recorded trades", args.address))?;

    let cfg = args.detector.to_config();
    let verdict = evaluate(history, &cfg);

    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Field", "Value"]);
    table.add_row(vec!["Address".to_string(), args.address.to_checksum(None)]);
    table.add_row(vec!["Trades".to_string(), history.trade_count().to_string()]);
    table.add_row(vec![
        "Incoming / outgoing".to_string(),
        format!("{} / {}", history.incoming_count(), history.outgoing_count()),
    ]);
    table.add_row(vec!["First seen".to_string(), history.first_seen().to_string()]);
    table.add_row(vec![
        "Last trade block".to_string(),
        history
            .last_block()
            .map(|b| b.to_string())
            .unwrap_or_else(|| "-".to_string()),
    ]);
    table.add_row(vec![
        "Average hold".to_string(),
        average_hold_blocks(history)
            .map(|avg| format!("{avg:.1} blocks"))
            .unwrap_or_else(|| "n/a".to_string()),
    ]);
    table.add_row(vec![
        "Trades per hour".to_string(),
        trades_per_hour(history, &cfg)
            .map(|rate| format!("{rate:.1}"))
            .unwrap_or_else(|| "n/a".to_string()),
    ]);
    table.add_row(vec![
        "Signals".to_string(),
        if verdict.signals.is_empty() {
            "none".to_string()
        } else {
            verdict.reasons().join("\n")
        },
    ]);
    table.add_row(vec!["Classified bot".to_string(), state.is_detected(&args.address).to_string()]);
    table.add_row(vec!["Verdict now".to_string(), verdict.is_bot().to_string()]);
    println!("{}\n", table);
    Ok(())
}

fn ensure_parent_dir(path: &str) -> Result<()> {
    if path == ":memory:" {
        return Ok(());
    }
    if let Some(parent) = std::path::Path::new(path)
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
    {
        std::fs::create_dir_all(parent)
            .wrap_err_with(|| format!("failed to create directory {}", parent.display()))?;
    }
    Ok(())
}
