//! Indexer configuration and pipeline assembly.
//!
//! [`Indexer`] wires the crawl state machine, the readiness watcher, and the
//! ingestion pool together around one data directory:
//!
//! ```text
//! subscription → CrawlStateMachine → BlockWriter → <data_dir>/<height>.json
//!                       │                                │ chmod a-w
//!                       │ block notices (unbounded)      ▼
//!                       │                        ReadinessWatcher
//!                       │                                │ ready files (bounded)
//!                       ▼                                ▼
//!               IngestionWorkerPool → DocumentStore + ProgressTracker
//! ```
//!
//! The crawler never waits on ingestion: a stalled store backs up the
//! ready-file queue and the watcher, not the crawl.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::crawler::{CrawlHandle, CrawlStateMachine, CrawlSummary};
use crate::decoder::TransactionDecoder;
use crate::error::IndexerError;
use crate::ingest::{BlockNotice, IngestConfig, IngestStats, IngestionWorkerPool, ReadyFile};
use crate::progress::ProgressTracker;
use crate::retry::BackoffConfig;
use crate::store::DocumentStore;
use crate::subscription::SubscriptionSource;
use crate::transform::{TransactionTransformer, TransformConfig};
use crate::watcher::ReadinessWatcher;
use crate::writer::BlockWriter;

/// Configuration for an indexer instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerConfig {
    /// Subscription identifier at the event source; also the progress key.
    pub subscription_id: String,
    /// Event source endpoint.
    pub source_url: String,
    /// First block to crawl when no progress is stored.
    pub from_block: u32,
    /// Explicit starting height; overrides stored progress.
    pub start_height: Option<u32>,
    /// Directory holding per-block NDJSON files.
    pub data_dir: PathBuf,
    /// Consecutive failures tolerated at one height before it is skipped.
    pub max_block_retries: u32,
    /// Maximum in-flight upserts while ingesting one file.
    pub ingest_concurrency: usize,
    /// Delete block files once ingested; otherwise move them under `done/`.
    pub delete_after_ingest: bool,
    /// Capacity of the ordered event queue.
    pub event_queue_capacity: usize,
    /// Capacity of the ready-file queue.
    pub ready_queue_capacity: usize,
    /// Reconnect backoff.
    pub backoff: BackoffConfig,
    /// Document sanitization.
    pub transform: TransformConfig,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            subscription_id: "bmap".into(),
            source_url: "https://junglebus.gorillapool.io".into(),
            from_block: 400_000,
            start_height: None,
            data_dir: PathBuf::from("data"),
            max_block_retries: 5,
            ingest_concurrency: 32,
            delete_after_ingest: true,
            event_queue_capacity: 1_000,
            ready_queue_capacity: 1_000,
            backoff: BackoffConfig::default(),
            transform: TransformConfig::default(),
        }
    }
}

impl IndexerConfig {
    /// Check the settings that would otherwise fail at runtime.
    pub fn validate(&self) -> Result<(), IndexerError> {
        if self.subscription_id.trim().is_empty() {
            return Err(IndexerError::Config("subscription id is empty".into()));
        }
        if self.ingest_concurrency == 0 {
            return Err(IndexerError::Config("ingest concurrency must be > 0".into()));
        }
        if self.event_queue_capacity == 0 || self.ready_queue_capacity == 0 {
            return Err(IndexerError::Config("queue capacities must be > 0".into()));
        }
        Ok(())
    }

    /// Height to subscribe from given the stored progress marker.
    pub fn resolve_start_height(&self, progress: u32) -> u32 {
        self.start_height
            .unwrap_or_else(|| progress.max(self.from_block))
    }

    pub fn ingest_config(&self) -> IngestConfig {
        IngestConfig {
            concurrency: self.ingest_concurrency,
            delete_after_ingest: self.delete_after_ingest,
        }
    }
}

/// Everything the pipeline talks to outside this crate.
pub struct Collaborators {
    pub source: Arc<dyn SubscriptionSource>,
    pub decoder: Arc<dyn TransactionDecoder>,
    pub store: Arc<dyn DocumentStore>,
    pub progress: Arc<ProgressTracker>,
}

pub type CrawlerTask = JoinHandle<Result<CrawlSummary, IndexerError>>;
pub type WatcherTask = JoinHandle<Result<(), IndexerError>>;
pub type IngestionTask = JoinHandle<Result<IngestStats, IndexerError>>;

/// A running pipeline.
pub struct Indexer {
    pub crawl: CrawlHandle,
    pub crawler: CrawlerTask,
    pub watcher: WatcherTask,
    pub ingestion: IngestionTask,
}

impl Indexer {
    /// Start crawler, watcher, and ingestion pool as independent tasks.
    pub async fn spawn(config: IndexerConfig, deps: Collaborators) -> Result<Self, IndexerError> {
        config.validate()?;

        let start = config.resolve_start_height(deps.progress.load().await?);

        let (notice_tx, notice_rx) = mpsc::unbounded_channel::<BlockNotice>();
        let (watcher, ingestion) = Self::spawn_ingestion(
            &config,
            Arc::clone(&deps.store),
            Arc::clone(&deps.progress),
            notice_rx,
        );

        info!(
            subscription = %config.subscription_id,
            source = %config.source_url,
            start,
            data_dir = %config.data_dir.display(),
            "Starting indexer"
        );

        let transformer = Arc::new(TransactionTransformer::new(
            deps.decoder,
            config.transform.clone(),
        ));
        let writer = Arc::new(BlockWriter::new(&config.data_dir));
        let (machine, crawl) =
            CrawlStateMachine::new(&config, deps.source, transformer, writer, notice_tx, start);
        let crawler = tokio::spawn(machine.run());

        Ok(Self {
            crawl,
            crawler,
            watcher,
            ingestion,
        })
    }

    /// Start only the watcher and ingestion pool (no crawling).
    pub fn spawn_worker(
        config: &IndexerConfig,
        store: Arc<dyn DocumentStore>,
        progress: Arc<ProgressTracker>,
    ) -> Result<(WatcherTask, IngestionTask), IndexerError> {
        config.validate()?;
        // No crawler: every sealed file on disk is complete.
        let (_, notice_rx) = mpsc::unbounded_channel::<BlockNotice>();
        Ok(Self::spawn_ingestion(config, store, progress, notice_rx))
    }

    fn spawn_ingestion(
        config: &IndexerConfig,
        store: Arc<dyn DocumentStore>,
        progress: Arc<ProgressTracker>,
        notices: mpsc::UnboundedReceiver<BlockNotice>,
    ) -> (WatcherTask, IngestionTask) {
        let (files_tx, files_rx) = mpsc::channel::<ReadyFile>(config.ready_queue_capacity);
        let watcher = ReadinessWatcher::new(&config.data_dir, files_tx);
        let watcher = tokio::spawn(watcher.run());

        let pool = IngestionWorkerPool::new(store, progress, config.ingest_config());
        let ingestion = tokio::spawn(pool.run(files_rx, notices));
        (watcher, ingestion)
    }

    /// Stop crawling and wait for the crawler to return.
    pub async fn shutdown(self) -> Result<CrawlSummary, IndexerError> {
        self.crawl.shutdown().await;
        let summary = self
            .crawler
            .await
            .map_err(|e| IndexerError::Other(format!("crawler task: {e}")))??;
        self.watcher.abort();
        self.ingestion.abort();
        Ok(summary)
    }
}
