//! Atlas CLI
//!
//! Collects database performance snapshots and inspects the stored history.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use atlas_lib::bus::{Capability, PipelineError};
use atlas_lib::config::AtlasConfig;
use atlas_lib::metrics::{MetricSchema, ReplaySource};
use atlas_lib::pipeline::Pipeline;
use atlas_lib::sinks::{AlertSubscriber, LogAlertSink};
use atlas_lib::store::{SnapshotStore, StoreError};
use atlas_lib::thresholds::{PerformanceThresholds, ThresholdEvaluator, ThresholdMode};
use bytesize::ByteSize;
use chrono::{DateTime, Duration, Utc};
use clap::{Args, Parser, Subcommand};
use log::{error, info, LevelFilter};

#[derive(Debug, Parser)]
#[command(name = "atlas")]
#[command(about = "Atlas - database performance snapshots", long_about = None)]
struct Cli {
    /// Log at debug level regardless of RUST_LOG
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Snapshot database (overrides ATLAS_DB_PATH)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Env file read before the process environment (default: ./.env if present)
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Collect snapshots until interrupted
    Run(RunArgs),
    /// Print stored snapshots as JSON lines
    History(HistoryArgs),
    /// Show store size and span
    Stats,
    /// Delete old snapshots
    Prune(PruneArgs),
    /// Show or write performance thresholds
    Thresholds(ThresholdsArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Recorded rounds to replay as the database source
    #[arg(long)]
    replay: PathBuf,

    /// Restart the recording when it runs out
    #[arg(long = "loop")]
    looping: bool,

    /// Collection interval in seconds (overrides COLLECTION_LAPSE)
    #[arg(long)]
    interval: Option<u64>,
}

#[derive(Debug, Args)]
struct HistoryArgs {
    /// Only snapshots strictly after this RFC 3339 timestamp
    #[arg(long)]
    since: Option<DateTime<Utc>>,

    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
struct PruneArgs {
    #[arg(long, default_value_t = 30)]
    older_than_days: i64,
}

#[derive(Debug, Args)]
struct ThresholdsArgs {
    /// Preset to show or write (default, conservative, aggressive)
    #[arg(long)]
    preset: Option<ThresholdMode>,

    /// Write the preset to ATLAS_THRESHOLDS
    #[arg(long, requires = "preset")]
    write: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{:#}", err);
            eprintln!("Error: {:#}", err);
            if is_corruption(&err) {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn init_logging(verbose: bool) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if verbose {
        builder.filter_level(LevelFilter::Debug);
    }
    builder.init();
}

fn is_corruption(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<PipelineError>(),
            Some(PipelineError::StoreCorruption(_))
        ) || matches!(cause.downcast_ref::<StoreError>(), Some(e) if e.is_corruption())
    })
}

async fn execute(cli: Cli) -> Result<()> {
    let mut config =
        AtlasConfig::load(cli.env_file.as_deref()).context("failed to load configuration")?;
    if let Some(db) = cli.db {
        config.database_path = db;
    }

    match cli.command {
        Commands::Run(args) => run(config, args).await,
        Commands::History(args) => history(&config, args),
        Commands::Stats => stats(&config),
        Commands::Prune(args) => prune(&config, args),
        Commands::Thresholds(args) => thresholds(&config, args),
    }
}

fn open_store(config: &AtlasConfig) -> Result<SnapshotStore> {
    SnapshotStore::open(&config.database_path, config.store_options()).with_context(|| {
        format!(
            "failed to open snapshot store {}",
            config.database_path.display()
        )
    })
}

fn load_thresholds(config: &AtlasConfig) -> Result<PerformanceThresholds> {
    match &config.thresholds_path {
        Some(path) => PerformanceThresholds::load_or_init(path, config.threshold_mode)
            .with_context(|| format!("failed to load thresholds {}", path.display())),
        None => Ok(PerformanceThresholds::preset(config.threshold_mode)),
    }
}

async fn run(mut config: AtlasConfig, args: RunArgs) -> Result<()> {
    if let Some(secs) = args.interval {
        config.collection_interval = std::time::Duration::from_secs(secs.max(1));
    }
    let source = ReplaySource::from_path(&args.replay, args.looping)
        .with_context(|| format!("failed to read replay {}", args.replay.display()))?;
    info!(
        "replaying {} recorded rounds from {}",
        source.rounds_recorded(),
        args.replay.display()
    );

    let pipeline = Pipeline::open(
        &config,
        Arc::new(source),
        MetricSchema::sql_server_default(),
    )
    .context("failed to open pipeline")?;

    let alerts = AlertSubscriber::new(
        "alerts",
        ThresholdEvaluator::new(load_thresholds(&config)?),
        Arc::new(LogAlertSink),
    );
    pipeline
        .subscribe(Arc::new(alerts), Capability::Incremental)
        .await
        .context("failed to attach alerts")?;

    attach_bridge(&pipeline, &config).await?;

    pipeline
        .run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!("failed to listen for ctrl-c: {}", err);
            }
        })
        .await
        .context("collection stopped")?;
    Ok(())
}

#[cfg(feature = "mq")]
async fn attach_bridge(pipeline: &Pipeline, config: &AtlasConfig) -> Result<()> {
    use atlas_lib::sinks::{LogPublisher, MqBridge};

    if !config.mq.enabled {
        return Ok(());
    }
    let bridge = MqBridge::new(config.mq.clone(), Arc::new(LogPublisher));
    pipeline
        .subscribe(Arc::new(bridge), Capability::Incremental)
        .await
        .context("failed to attach message bridge")?;
    Ok(())
}

#[cfg(not(feature = "mq"))]
async fn attach_bridge(_pipeline: &Pipeline, config: &AtlasConfig) -> Result<()> {
    if config.mq.enabled {
        log::warn!("RABBITMQ is set but atlas was built without the mq feature");
    }
    Ok(())
}

fn history(config: &AtlasConfig, args: HistoryArgs) -> Result<()> {
    let store = open_store(config)?;
    let cursor = match args.since {
        Some(since) => store.all_since(since)?,
        None => store.history()?,
    };
    for snapshot in cursor.take(args.limit.unwrap_or(usize::MAX)) {
        let snapshot = snapshot.context("failed to read history")?;
        println!("{}", serde_json::to_string(&snapshot)?);
    }
    Ok(())
}

fn stats(config: &AtlasConfig) -> Result<()> {
    let stats = open_store(config)?.stats()?;
    println!("database:  {}", config.database_path.display());
    println!("snapshots: {}", stats.snapshot_count);
    println!("sources:   {}", stats.source_count);
    println!("size:      {}", ByteSize::b(stats.size_bytes));
    match (stats.oldest, stats.newest) {
        (Some(oldest), Some(newest)) => println!("span:      {} .. {}", oldest, newest),
        _ => println!("span:      empty"),
    }
    Ok(())
}

fn prune_cutoff(now: DateTime<Utc>, older_than_days: i64) -> Result<DateTime<Utc>> {
    Duration::try_days(older_than_days.max(0))
        .and_then(|age| now.checked_sub_signed(age))
        .with_context(|| format!("--older-than-days {} is out of range", older_than_days))
}

fn prune(config: &AtlasConfig, args: PruneArgs) -> Result<()> {
    let cutoff = prune_cutoff(Utc::now(), args.older_than_days)?;
    let removed = open_store(config)?.prune_before(cutoff)?;
    println!("removed {} snapshots older than {}", removed, cutoff);
    Ok(())
}

fn thresholds(config: &AtlasConfig, args: ThresholdsArgs) -> Result<()> {
    let thresholds = match args.preset {
        Some(mode) => PerformanceThresholds::preset(mode),
        None => load_thresholds(config)?,
    };
    if args.write {
        let path = config
            .thresholds_path
            .as_ref()
            .context("ATLAS_THRESHOLDS is not set")?;
        thresholds
            .save(path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!("thresholds written to {}", path.display());
    }
    println!("{}", serde_json::to_string_pretty(&thresholds)?);
    Ok(())
}
