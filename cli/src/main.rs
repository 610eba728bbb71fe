//! BmapIndex CLI — crawl BMAP transactions into block files and ingest them.
//!
//! # Commands
//! ```text
//! bmapindex crawl    --source <events.ndjson> [--data-dir data] [--start-height H]
//! bmapindex ingest   [--data-dir data]
//! bmapindex progress [--set H]
//! bmapindex info
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use bmapindex_core::{
    Collaborators, CrawlOutcome, CrawlSummary, FileProgressStore, Indexer, IndexerBuilder,
    IndexerConfig, JsonTransactionDecoder, ProgressStore, ProgressTracker, ReplaySource,
};
use bmapindex_storage::SqliteStorage;

mod logging;

#[derive(Parser)]
#[command(
    name = "bmapindex",
    about = "BMAP transaction indexer — crawl, block-file handoff, and ingestion",
    long_about = "
BmapIndex crawls a transaction subscription into per-block NDJSON files and
ingests sealed files into a document store.

ENVIRONMENT VARIABLES:
  BMAPINDEX_DB              Document store path (SQLite)
  BMAPINDEX_SUBSCRIPTION    Subscription id (also the progress key)
  BMAPINDEX_DATA_DIR        Block file directory
  RUST_LOG                  Log filter directives (overrides --log-level)
",
    version
)]
struct Cli {
    /// SQLite database holding documents (and progress with --progress-in-db)
    #[arg(long, env = "BMAPINDEX_DB", default_value = "bmap.db", global = true)]
    db: String,

    /// Subscription id; progress is stored under this key
    #[arg(long, env = "BMAPINDEX_SUBSCRIPTION", default_value = "bmap", global = true)]
    subscription_id: String,

    /// File holding the progress marker
    #[arg(long, default_value = "./block.tmp", global = true)]
    progress_file: PathBuf,

    /// Keep the progress marker in the database instead of a file
    #[arg(long, global = true)]
    progress_in_db: bool,

    /// Default log level
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Emit JSON structured logs
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct PipelineArgs {
    /// Directory for block files
    #[arg(long, env = "BMAPINDEX_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Concurrent upserts per block file
    #[arg(long, default_value_t = 32)]
    concurrency: usize,

    /// Move ingested block files to <data-dir>/done instead of deleting them
    #[arg(long)]
    retain: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl a subscription and ingest its blocks
    Crawl {
        /// Recorded event log to replay (one JSON event per line)
        #[arg(long)]
        source: PathBuf,

        /// Event source endpoint (recorded in logs)
        #[arg(long, env = "BMAPINDEX_SOURCE_URL", default_value = "https://junglebus.gorillapool.io")]
        source_url: String,

        /// Block to start from when no progress is stored
        #[arg(long, default_value_t = 400_000)]
        from_block: u32,

        /// Start here regardless of stored progress
        #[arg(long)]
        start_height: Option<u32>,

        /// Consecutive failures before a block is skipped
        #[arg(long, default_value_t = 5)]
        max_retries: u32,

        #[command(flatten)]
        pipeline: PipelineArgs,
    },

    /// Ingest sealed block files only (no crawling)
    Ingest {
        #[command(flatten)]
        pipeline: PipelineArgs,
    },

    /// Show or overwrite the progress marker
    Progress {
        /// Overwrite the marker with this height
        #[arg(long)]
        set: Option<u32>,
    },

    /// Show configuration defaults and store contents
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_tracing(&cli.log_level, cli.log_json);

    match &cli.command {
        Commands::Crawl {
            source,
            source_url,
            from_block,
            start_height,
            max_retries,
            pipeline,
        } => {
            let mut builder = IndexerBuilder::new()
                .subscription_id(&cli.subscription_id)
                .source_url(source_url)
                .from_block(*from_block)
                .max_block_retries(*max_retries);
            if let Some(h) = start_height {
                builder = builder.start_height(*h);
            }
            let config = apply_pipeline(builder, pipeline).build_config();
            cmd_crawl(&cli, config, source).await
        }

        Commands::Ingest { pipeline } => {
            let builder = IndexerBuilder::new().subscription_id(&cli.subscription_id);
            let config = apply_pipeline(builder, pipeline).build_config();
            cmd_ingest(&cli, config).await
        }

        Commands::Progress { set } => cmd_progress(&cli, *set).await,

        Commands::Info => cmd_info(&cli).await,
    }
}

fn apply_pipeline(builder: IndexerBuilder, args: &PipelineArgs) -> IndexerBuilder {
    let builder = builder
        .data_dir(&args.data_dir)
        .ingest_concurrency(args.concurrency);
    if args.retain {
        builder.retain_files()
    } else {
        builder
    }
}

async fn open_store(cli: &Cli) -> Result<Arc<SqliteStorage>> {
    let store = SqliteStorage::open(&cli.db)
        .await
        .with_context(|| format!("opening document store {}", cli.db))?;
    Ok(Arc::new(store))
}

fn progress_tracker(cli: &Cli, store: &Arc<SqliteStorage>, default_height: u32) -> Arc<ProgressTracker> {
    let backend: Arc<dyn ProgressStore> = if cli.progress_in_db {
        Arc::clone(store) as Arc<dyn ProgressStore>
    } else {
        Arc::new(FileProgressStore::new(&cli.progress_file))
    };
    Arc::new(ProgressTracker::new(backend, &cli.subscription_id, default_height))
}

async fn cmd_crawl(cli: &Cli, config: IndexerConfig, source: &Path) -> Result<()> {
    let replay = ReplaySource::open(source)
        .with_context(|| format!("loading event log {}", source.display()))?;
    info!(events = replay.len(), path = %source.display(), "Loaded event log");

    let store = open_store(cli).await?;
    let progress = progress_tracker(cli, &store, config.from_block);
    let deps = Collaborators {
        source: Arc::new(replay),
        decoder: Arc::new(JsonTransactionDecoder),
        store,
        progress,
    };

    let mut indexer = Indexer::spawn(config, deps)
        .await
        .context("starting indexer")?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted; shutting down");
            let summary = indexer.shutdown().await?;
            report(&summary);
            Ok(())
        }
        joined = &mut indexer.crawler => {
            indexer.watcher.abort();
            indexer.ingestion.abort();
            let summary = joined.map_err(|e| anyhow!("crawler task: {e}"))??;
            report(&summary);
            if summary.outcome == CrawlOutcome::Reset {
                warn!("Subscription was reset by the source; restart to continue");
            }
            Ok(())
        }
        joined = &mut indexer.ingestion => {
            indexer.crawl.shutdown().await;
            indexer.watcher.abort();
            match joined.map_err(|e| anyhow!("ingestion task: {e}"))? {
                Ok(stats) => bail!("ingestion stopped unexpectedly after {} files", stats.files),
                Err(e) => Err(e).context("ingestion failed"),
            }
        }
        joined = &mut indexer.watcher => {
            indexer.crawl.shutdown().await;
            indexer.ingestion.abort();
            joined.map_err(|e| anyhow!("watcher task: {e}"))?
                .context("watching data directory")?;
            bail!("watcher stopped unexpectedly")
        }
    }
}

async fn cmd_ingest(cli: &Cli, config: IndexerConfig) -> Result<()> {
    let store = open_store(cli).await?;
    let progress = progress_tracker(cli, &store, 0);
    let (mut watcher, mut ingestion) = Indexer::spawn_worker(&config, store, progress)
        .context("starting ingestion worker")?;
    info!(data_dir = %config.data_dir.display(), "Ingestion worker running");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted; shutting down");
            watcher.abort();
            ingestion.abort();
            Ok(())
        }
        joined = &mut ingestion => {
            watcher.abort();
            let stats = joined.map_err(|e| anyhow!("ingestion task: {e}"))?
                .context("ingestion failed")?;
            info!(files = stats.files, documents = stats.documents, "Ingestion stopped");
            Ok(())
        }
        joined = &mut watcher => {
            ingestion.abort();
            joined.map_err(|e| anyhow!("watcher task: {e}"))?
                .context("watching data directory")?;
            Ok(())
        }
    }
}

async fn cmd_progress(cli: &Cli, set: Option<u32>) -> Result<()> {
    let store = open_store(cli).await?;
    let tracker = progress_tracker(cli, &store, 0);

    if let Some(height) = set {
        tracker.force_save(height).await.context("saving progress")?;
        println!("Progress for '{}' set to {height}", cli.subscription_id);
        return Ok(());
    }

    match tracker.marker().await.context("loading progress")? {
        Some(marker) => {
            println!("Subscription: {}", cli.subscription_id);
            println!("  Height:     {}", marker.height);
            println!("  Updated at: {}", marker.updated_at);
        }
        None => println!("No progress recorded for '{}'", cli.subscription_id),
    }
    Ok(())
}

async fn cmd_info(cli: &Cli) -> Result<()> {
    let defaults = IndexerConfig::default();
    println!("BmapIndex v{}", env!("CARGO_PKG_VERSION"));
    println!("  Default start block:        {}", defaults.from_block);
    println!("  Default retries per block:  {}", defaults.max_block_retries);
    println!("  Default ingest concurrency: {}", defaults.ingest_concurrency);
    println!("  Max string length:          {}", defaults.transform.max_string_len);
    println!(
        "  Allowed content types:      {}",
        defaults.transform.allowed_content_types.join(", ")
    );

    let store = open_store(cli).await?;
    let collections = store.collections().await.context("listing collections")?;
    println!("  Store: {}", cli.db);
    if collections.is_empty() {
        println!("    (empty)");
    }
    for (name, count) in collections {
        println!("    {name:<24} {count}");
    }
    Ok(())
}

fn report(summary: &CrawlSummary) {
    let stats = &summary.stats;
    info!(
        outcome = ?summary.outcome,
        resume = summary.resume_height,
        transactions = stats.transactions,
        written = stats.written,
        filtered = stats.filtered,
        rejected = stats.rejected,
        blocks = stats.blocks_finalized,
        empty_blocks = stats.empty_blocks,
        skipped_blocks = stats.skipped_blocks,
        "Crawl summary"
    );
}
