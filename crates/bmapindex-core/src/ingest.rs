//! Ingestion worker pool — loads sealed block files into the document store.
//!
//! Files are processed one at a time in arrival order. Within a file, upserts
//! run concurrently under a semaphore and are all joined before the file is
//! deleted (or archived) and the block counts as complete.
//!
//! The crawler announces every block before sealing it. Progress for a block
//! is recorded only after every announced block below it has completed, so
//! an empty block never moves the marker past a lower file still in flight.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::IndexerError;
use crate::progress::ProgressTracker;
use crate::store::{Document, DocumentStore};

/// Subdirectory of the data directory that retained block files move to.
pub const ARCHIVE_DIR: &str = "done";

/// A sealed block file found by the readiness watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyFile {
    pub height: u32,
    pub path: PathBuf,
}

/// What the crawler reports about each block it finalizes, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockNotice {
    /// Sent before the block is sealed. Its file, if any, arrives through
    /// the watcher.
    Finalizing(u32),
    /// The block produced no file and is complete.
    Empty(u32),
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Maximum in-flight upserts per file.
    pub concurrency: usize,
    /// Delete each file after it is fully ingested. When `false` the file is
    /// moved to [`ARCHIVE_DIR`] instead.
    pub delete_after_ingest: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            concurrency: 32,
            delete_after_ingest: true,
        }
    }
}

/// Outcome of ingesting one block file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileReport {
    pub height: u32,
    /// Non-blank lines read.
    pub lines: usize,
    pub upserted: usize,
    /// Lines that failed to parse or upsert.
    pub skipped: usize,
}

/// Running totals for a [`IngestionWorkerPool::run`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub files: u64,
    pub empty_blocks: u64,
    pub documents: u64,
    pub skipped: u64,
    /// Highest height recorded in the progress marker.
    pub last_height: Option<u32>,
}

impl IngestStats {
    fn record(&mut self, report: &FileReport) {
        self.files += 1;
        self.documents += report.upserted as u64;
        self.skipped += report.skipped as u64;
    }
}

// ─── Progress ordering ────────────────────────────────────────────────────────

/// Orders progress updates by height.
///
/// Announced blocks are outstanding until completed. A completed block is
/// held while any lower block is outstanding.
#[derive(Debug, Default)]
pub struct ProgressGate {
    outstanding: BTreeSet<u32>,
    held: BTreeSet<u32>,
    released: Option<u32>,
}

impl ProgressGate {
    /// Register a block that will complete later. Heights already completed
    /// are ignored.
    pub fn announce(&mut self, height: u32) {
        if self.released.is_some_and(|r| height <= r) || self.held.contains(&height) {
            return;
        }
        self.outstanding.insert(height);
    }

    pub fn is_outstanding(&self, height: u32) -> bool {
        self.outstanding.contains(&height)
    }

    /// Mark `height` complete. Returns the heights now safe to record,
    /// lowest first.
    pub fn complete(&mut self, height: u32) -> Vec<u32> {
        self.outstanding.remove(&height);
        self.held.insert(height);

        let floor = self.outstanding.first().copied();
        let mut ready = Vec::new();
        while let Some(&lowest) = self.held.first() {
            if floor.is_some_and(|f| lowest >= f) {
                break;
            }
            self.held.pop_first();
            ready.push(lowest);
        }
        if let Some(&top) = ready.last() {
            self.released = Some(self.released.map_or(top, |r| r.max(top)));
        }
        ready
    }
}

// ─── Worker pool ──────────────────────────────────────────────────────────────

pub struct IngestionWorkerPool {
    store: Arc<dyn DocumentStore>,
    progress: Arc<ProgressTracker>,
    config: IngestConfig,
    limiter: Arc<Semaphore>,
}

impl IngestionWorkerPool {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        progress: Arc<ProgressTracker>,
        config: IngestConfig,
    ) -> Self {
        let limiter = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            store,
            progress,
            config,
            limiter,
        }
    }

    /// Consume ready files and crawler notices until the file queue closes.
    ///
    /// Returns early only on a fatal error; the failing file stays on disk.
    pub async fn run(
        self,
        mut files: mpsc::Receiver<ReadyFile>,
        mut notices: mpsc::UnboundedReceiver<BlockNotice>,
    ) -> Result<IngestStats, IndexerError> {
        let mut gate = ProgressGate::default();
        let mut stats = IngestStats::default();
        let mut notices_open = true;

        loop {
            tokio::select! {
                biased;
                notice = notices.recv(), if notices_open => match notice {
                    Some(notice) => self.on_notice(notice, &mut gate, &mut stats).await?,
                    None => notices_open = false,
                },
                file = files.recv() => match file {
                    Some(file) => {
                        // A block is announced before it is sealed, so its
                        // notice is already queued.
                        while let Ok(notice) = notices.try_recv() {
                            self.on_notice(notice, &mut gate, &mut stats).await?;
                        }
                        self.on_file(&file, &mut gate, &mut stats).await?;
                    }
                    None => break,
                },
            }
        }
        while let Ok(notice) = notices.try_recv() {
            self.on_notice(notice, &mut gate, &mut stats).await?;
        }

        info!(
            files = stats.files,
            empty_blocks = stats.empty_blocks,
            documents = stats.documents,
            skipped = stats.skipped,
            "Ingestion queue closed"
        );
        Ok(stats)
    }

    async fn on_notice(
        &self,
        notice: BlockNotice,
        gate: &mut ProgressGate,
        stats: &mut IngestStats,
    ) -> Result<(), IndexerError> {
        match notice {
            BlockNotice::Finalizing(height) => gate.announce(height),
            BlockNotice::Empty(height) => {
                debug!(height, "empty block");
                stats.empty_blocks += 1;
                self.release(gate.complete(height), stats).await?;
            }
        }
        Ok(())
    }

    async fn on_file(
        &self,
        file: &ReadyFile,
        gate: &mut ProgressGate,
        stats: &mut IngestStats,
    ) -> Result<(), IndexerError> {
        let height = file.height;
        match self.process(file).await {
            Ok(Some(report)) => {
                stats.record(&report);
                self.release(gate.complete(height), stats).await
            }
            Ok(None) if gate.is_outstanding(height) => {
                warn!(height, path = %file.path.display(), "Sealed block file vanished before ingestion");
                self.release(gate.complete(height), stats).await
            }
            Ok(None) => Ok(()),
            Err(e) if e.is_fatal() => {
                error!(height, error = %e, "Ingestion halted");
                Err(e)
            }
            Err(e) => {
                warn!(height, error = %e, "Block ingestion failed; file retained");
                Ok(())
            }
        }
    }

    async fn release(&self, heights: Vec<u32>, stats: &mut IngestStats) -> Result<(), IndexerError> {
        for height in heights {
            self.progress.advance(height).await?;
            stats.last_height = Some(height);
        }
        Ok(())
    }

    /// Ingest one sealed file, then delete or archive it.
    ///
    /// Returns `None` if the file no longer exists (already ingested).
    pub async fn process(&self, file: &ReadyFile) -> Result<Option<FileReport>, IndexerError> {
        let report = match self.ingest_file(file.height, &file.path).await {
            Ok(report) => report,
            Err(IndexerError::FileSystem { .. })
                if !tokio::fs::try_exists(&file.path).await.unwrap_or(false) =>
            {
                debug!(height = file.height, path = %file.path.display(), "block file already ingested");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        if self.config.delete_after_ingest {
            remove_file(&file.path).await?;
        } else {
            archive_file(&file.path).await?;
        }
        info!(
            height = file.height,
            upserted = report.upserted,
            skipped = report.skipped,
            "Block ingested"
        );
        Ok(Some(report))
    }

    /// Upsert every line of `path`, skipping lines that fail.
    ///
    /// Fails only when the file cannot be read or the store is unavailable.
    pub async fn ingest_file(&self, height: u32, path: &Path) -> Result<FileReport, IndexerError> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| IndexerError::fs(path, e))?;
        let mut lines = BufReader::new(file).split(b'\n');

        let mut report = FileReport {
            height,
            ..Default::default()
        };
        let mut tasks: JoinSet<Result<(), (String, IndexerError)>> = JoinSet::new();

        while let Some(raw) = lines
            .next_segment()
            .await
            .map_err(|e| IndexerError::fs(path, e))?
        {
            if raw.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            report.lines += 1;

            let (collection, id, document) = match parse_line(&raw) {
                Ok(parsed) => parsed,
                Err(bad) => {
                    warn!(
                        height,
                        id = bad.id.as_deref().unwrap_or("-"),
                        reason = %bad.reason,
                        line = %String::from_utf8_lossy(&raw),
                        "Skipping unparseable line"
                    );
                    report.skipped += 1;
                    continue;
                }
            };

            let permit = Arc::clone(&self.limiter)
                .acquire_owned()
                .await
                .map_err(|_| IndexerError::Other("ingest limiter closed".into()))?;
            let store = Arc::clone(&self.store);
            tasks.spawn(async move {
                let _permit = permit;
                upsert_first_seen(store.as_ref(), &collection, &id, document)
                    .await
                    .map_err(|e| (id, e))
            });
        }

        let mut fatal = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => report.upserted += 1,
                Ok(Err((id, e))) => {
                    report.skipped += 1;
                    if matches!(e, IndexerError::StoreUnavailable(_)) {
                        if fatal.is_none() {
                            fatal = Some(e);
                        }
                    } else {
                        warn!(height, id = %id, error = %e, "Skipping document that failed to upsert");
                    }
                }
                Err(e) => {
                    report.skipped += 1;
                    warn!(height, error = %e, "Upsert task failed");
                }
            }
        }
        match fatal {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}

struct BadLine {
    id: Option<String>,
    reason: String,
}

impl BadLine {
    fn new(id: Option<String>, reason: impl Into<String>) -> Self {
        Self {
            id,
            reason: reason.into(),
        }
    }
}

/// Split a block-file line into `(collection, _id, document)`.
fn parse_line(raw: &[u8]) -> Result<(String, String, Document), BadLine> {
    let mut record: Map<String, Value> = match serde_json::from_slice(raw) {
        Ok(Value::Object(map)) => map,
        Ok(_) => return Err(BadLine::new(None, "not a JSON object")),
        Err(e) => return Err(BadLine::new(None, e.to_string())),
    };
    let id = match record.get("_id") {
        Some(Value::String(id)) if !id.is_empty() => Some(id.clone()),
        _ => None,
    };
    let collection = match record.remove("collection") {
        Some(Value::String(c)) if !c.is_empty() => c,
        _ => return Err(BadLine::new(id, "missing collection")),
    };
    match id {
        Some(id) => Ok((collection, id, record)),
        None => Err(BadLine::new(None, "missing _id")),
    }
}

/// Upsert, keeping the stored `timestamp` if the document was seen before.
async fn upsert_first_seen(
    store: &dyn DocumentStore,
    collection: &str,
    id: &str,
    mut document: Document,
) -> Result<(), IndexerError> {
    let mut filter = Map::new();
    filter.insert("_id".into(), Value::String(id.to_string()));
    let existing = store.find_many(collection, &filter, 1, 0).await?;
    if let Some(seen) = existing
        .first()
        .and_then(|doc| doc.get("timestamp"))
        .filter(|ts| ts.as_i64().is_some_and(|t| t != 0))
    {
        document.insert("timestamp".into(), seen.clone());
    }
    store.upsert_one(collection, id, document).await?;
    Ok(())
}

async fn remove_file(path: &Path) -> Result<(), IndexerError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(IndexerError::fs(path, e)),
    }
}

/// Move an ingested file into [`ARCHIVE_DIR`] next to it, out of reach of
/// the watcher and its startup scan.
async fn archive_file(path: &Path) -> Result<PathBuf, IndexerError> {
    let (Some(dir), Some(name)) = (path.parent(), path.file_name()) else {
        return Err(IndexerError::fs(path, "not a block file path"));
    };
    let archive = dir.join(ARCHIVE_DIR);
    tokio::fs::create_dir_all(&archive)
        .await
        .map_err(|e| IndexerError::fs(&archive, e))?;
    let target = archive.join(name);
    tokio::fs::rename(path, &target)
        .await
        .map_err(|e| IndexerError::fs(path, e))?;
    Ok(target)
}
