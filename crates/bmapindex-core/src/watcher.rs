//! File-readiness watcher — turns "block file became read-only" into an
//! ordered stream of [`ReadyFile`]s.
//!
//! The watcher never reads file contents. It only checks permission bits, so
//! a file is handed to ingestion strictly after the writer has sealed it.
//! Only the top level of the data directory is watched; archived files in
//! [`ARCHIVE_DIR`](crate::ingest::ARCHIVE_DIR) are never offered again.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::IndexerError;
use crate::ingest::ReadyFile;
use crate::writer::{block_height, is_read_only};

pub struct ReadinessWatcher {
    dir: PathBuf,
    out: mpsc::Sender<ReadyFile>,
    /// Paths already handed out; cleared once the file is gone or writable.
    enqueued: HashSet<PathBuf>,
}

impl ReadinessWatcher {
    pub fn new(dir: impl Into<PathBuf>, out: mpsc::Sender<ReadyFile>) -> Self {
        Self {
            dir: dir.into(),
            out,
            enqueued: HashSet::new(),
        }
    }

    /// Watch until the ready queue's consumer goes away.
    ///
    /// Fails with [`IndexerError::FileSystem`] if the directory cannot be
    /// created or watched.
    pub async fn run(mut self) -> Result<(), IndexerError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| IndexerError::fs(&self.dir, e))?;
        self.dir = tokio::fs::canonicalize(&self.dir)
            .await
            .map_err(|e| IndexerError::fs(&self.dir, e))?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher: RecommendedWatcher =
            notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
                let _ = tx.send(res);
            })
            .map_err(|e| IndexerError::fs(&self.dir, e))?;
        watcher
            .watch(&self.dir, RecursiveMode::NonRecursive)
            .map_err(|e| IndexerError::fs(&self.dir, e))?;

        info!(dir = %self.dir.display(), "Watching for sealed block files");

        // Watch first, then scan: a file sealed in between is seen twice and
        // deduplicated rather than missed.
        if !self.scan_existing().await? {
            return Ok(());
        }

        while let Some(res) = rx.recv().await {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "watch error");
                    continue;
                }
            };
            match event.kind {
                EventKind::Create(_) | EventKind::Modify(_) => {
                    for path in event.paths {
                        if !self.offer(path).await {
                            return Ok(());
                        }
                    }
                }
                EventKind::Remove(_) => {
                    for path in &event.paths {
                        if self.enqueued.remove(path) {
                            debug!(path = %path.display(), "block file removed");
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Enqueue every sealed block file already present, lowest height first.
    ///
    /// Returns `false` if the consumer is gone.
    pub async fn scan_existing(&mut self) -> Result<bool, IndexerError> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| IndexerError::fs(&self.dir, e))?;
        let mut sealed: Vec<(u32, PathBuf)> = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| IndexerError::fs(&self.dir, e))?
        {
            let path = entry.path();
            if let Some(height) = block_height(&path) {
                if sealed_file(&path).await {
                    sealed.push((height, path));
                }
            }
        }
        sealed.sort();

        if !sealed.is_empty() {
            info!(count = sealed.len(), "Recovering sealed block files");
        }
        for (_, path) in sealed {
            if !self.offer(path).await {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Send `path` if it is a sealed block file not yet handed out.
    async fn offer(&mut self, path: PathBuf) -> bool {
        let Some(height) = block_height(&path) else {
            return true;
        };
        if !sealed_file(&path).await {
            // Moved away, deleted, or recreated by a re-delivered block.
            self.enqueued.remove(&path);
            return true;
        }
        if self.enqueued.contains(&path) {
            return true;
        }
        debug!(height, path = %path.display(), "block file ready");
        self.enqueued.insert(path.clone());
        self.out.send(ReadyFile { height, path }).await.is_ok()
    }
}

async fn sealed_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .is_ok_and(|meta| meta.is_file() && is_read_only(&meta))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;

    use crate::ingest::ARCHIVE_DIR;
    use crate::writer::block_path;

    fn seal(path: &Path) {
        let mut perms = fs::metadata(path).unwrap().permissions();
        perms.set_readonly(true);
        fs::set_permissions(path, perms).unwrap();
    }

    async fn next(rx: &mut mpsc::Receiver<ReadyFile>) -> ReadyFile {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for ready block")
            .expect("watcher closed")
    }

    #[tokio::test]
    async fn startup_scan_is_height_ordered() {
        let dir = tempfile::tempdir().unwrap();
        for h in [30u32, 10, 20] {
            let p = block_path(dir.path(), h);
            fs::write(&p, "{}\n").unwrap();
            seal(&p);
        }
        fs::write(block_path(dir.path(), 5), "{}\n").unwrap();
        fs::write(dir.path().join("notes.txt"), "x").unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let task = tokio::spawn(ReadinessWatcher::new(dir.path(), tx).run());

        let heights: Vec<u32> = vec![
            next(&mut rx).await.height,
            next(&mut rx).await.height,
            next(&mut rx).await.height,
        ];
        assert_eq!(heights, vec![10, 20, 30]);
        assert!(rx.try_recv().is_err());
        task.abort();
    }

    #[tokio::test]
    async fn emits_once_when_sealed() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let task = tokio::spawn(ReadinessWatcher::new(dir.path(), tx).run());
        tokio::time::sleep(Duration::from_millis(200)).await;

        let path = block_path(dir.path(), 574287);
        fs::write(&path, "{}\n").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err(), "writable file must not be emitted");

        seal(&path);
        let ready = next(&mut rx).await;
        assert_eq!(ready.height, 574287);
        assert_eq!(ready.path.file_name(), path.file_name());

        // Repeated metadata events for the same file are ignored.
        seal(&path);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(rx.try_recv().is_err());
        task.abort();
    }

    #[tokio::test]
    async fn startup_scan_skips_archived_files() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join(ARCHIVE_DIR);
        fs::create_dir_all(&archive).unwrap();
        for h in [1u32, 2] {
            let p = block_path(&archive, h);
            fs::write(&p, "{}\n").unwrap();
            seal(&p);
        }
        let pending = block_path(dir.path(), 3);
        fs::write(&pending, "{}\n").unwrap();
        seal(&pending);

        let (tx, mut rx) = mpsc::channel(8);
        let task = tokio::spawn(ReadinessWatcher::new(dir.path(), tx).run());

        assert_eq!(next(&mut rx).await.height, 3);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
        task.abort();
    }

    #[tokio::test]
    async fn recreated_file_is_offered_again() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let task = tokio::spawn(ReadinessWatcher::new(dir.path(), tx).run());
        tokio::time::sleep(Duration::from_millis(200)).await;

        let path = block_path(dir.path(), 40);
        fs::write(&path, "{}\n").unwrap();
        seal(&path);
        assert_eq!(next(&mut rx).await.height, 40);

        fs::remove_file(&path).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        fs::write(&path, "{}\n").unwrap();
        seal(&path);
        assert_eq!(next(&mut rx).await.height, 40);
        task.abort();
    }

    #[tokio::test]
    async fn missing_parent_is_filesystem_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, "x").unwrap();

        let (tx, _rx) = mpsc::channel(1);
        let err = ReadinessWatcher::new(blocker.join("data"), tx)
            .run()
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
