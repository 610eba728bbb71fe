//! Progress tracking — persists the highest fully ingested block height.
//!
//! On restart the crawler resumes from the stored marker rather than
//! re-crawling from the configured start block. The marker only moves
//! forward.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::IndexerError;

/// A persisted progress marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressMarker {
    /// Highest block height whose file was fully ingested.
    pub height: u32,
    /// Unix timestamp of when this marker was saved.
    pub updated_at: i64,
}

impl ProgressMarker {
    pub fn now(height: u32) -> Self {
        Self {
            height,
            updated_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// Trait for storing and loading progress markers, keyed by subscription.
///
/// Implementations include [`MemoryProgressStore`], [`FileProgressStore`],
/// and `SqliteStorage`.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Load the marker for `key` (returns `None` if none exists).
    async fn load(&self, key: &str) -> Result<Option<ProgressMarker>, IndexerError>;

    /// Save (upsert) the marker for `key`.
    async fn save(&self, key: &str, marker: ProgressMarker) -> Result<(), IndexerError>;
}

/// Manages progress reads/writes for one subscription.
pub struct ProgressTracker {
    store: Arc<dyn ProgressStore>,
    key: String,
    default_height: u32,
    /// Last height known to be persisted.
    current: tokio::sync::Mutex<Option<u32>>,
}

impl ProgressTracker {
    pub fn new(store: Arc<dyn ProgressStore>, key: impl Into<String>, default_height: u32) -> Self {
        Self {
            store,
            key: key.into(),
            default_height,
            current: tokio::sync::Mutex::new(None),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The stored height, or the configured default when nothing is stored.
    pub async fn load(&self) -> Result<u32, IndexerError> {
        let mut current = self.current.lock().await;
        let height = match self.store.load(&self.key).await? {
            Some(marker) => marker.height,
            None => self.default_height,
        };
        *current = Some(height);
        Ok(height)
    }

    /// The full stored marker, if any.
    pub async fn marker(&self) -> Result<Option<ProgressMarker>, IndexerError> {
        self.store.load(&self.key).await
    }

    /// Persist `height` if it is above the current marker.
    ///
    /// Returns `true` if the marker moved.
    pub async fn advance(&self, height: u32) -> Result<bool, IndexerError> {
        let mut current = self.current.lock().await;
        let known = match *current {
            Some(h) => h,
            None => self
                .store
                .load(&self.key)
                .await?
                .map_or(0, |m| m.height),
        };
        if height <= known {
            *current = Some(known);
            return Ok(false);
        }
        self.store.save(&self.key, ProgressMarker::now(height)).await?;
        *current = Some(height);
        debug!(key = %self.key, height, "progress advanced");
        Ok(true)
    }

    /// Overwrite the marker unconditionally (operator reset).
    pub async fn force_save(&self, height: u32) -> Result<(), IndexerError> {
        let mut current = self.current.lock().await;
        self.store.save(&self.key, ProgressMarker::now(height)).await?;
        *current = Some(height);
        Ok(())
    }
}

// ─── In-memory store (for testing) ────────────────────────────────────────────

/// In-memory progress store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryProgressStore {
    data: parking_lot::Mutex<HashMap<String, ProgressMarker>>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProgressStore for MemoryProgressStore {
    async fn load(&self, key: &str) -> Result<Option<ProgressMarker>, IndexerError> {
        Ok(self.data.lock().get(key).copied())
    }

    async fn save(&self, key: &str, marker: ProgressMarker) -> Result<(), IndexerError> {
        self.data.lock().insert(key.to_string(), marker);
        Ok(())
    }
}

// ─── File store ───────────────────────────────────────────────────────────────

/// Keeps markers in a small JSON file (`{"<key>": {"height": …}}`).
///
/// Writes go to a sibling temp file which is then renamed over the original,
/// so a crash never leaves a half-written marker.
pub struct FileProgressStore {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl FileProgressStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn read_all(&self) -> Result<HashMap<String, ProgressMarker>, IndexerError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| IndexerError::Storage(format!("{}: {e}", self.path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(IndexerError::fs(&self.path, e)),
        }
    }
}

#[async_trait]
impl ProgressStore for FileProgressStore {
    async fn load(&self, key: &str) -> Result<Option<ProgressMarker>, IndexerError> {
        let _guard = self.lock.lock().await;
        Ok(self.read_all().await?.get(key).copied())
    }

    async fn save(&self, key: &str, marker: ProgressMarker) -> Result<(), IndexerError> {
        let _guard = self.lock.lock().await;
        let mut all = self.read_all().await?;
        all.insert(key.to_string(), marker);
        let body = serde_json::to_vec_pretty(&all)
            .map_err(|e| IndexerError::Storage(e.to_string()))?;

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| IndexerError::fs(dir, e))?;
        }
        let tmp = self.path.with_extension("tmp.partial");
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| IndexerError::fs(&tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| IndexerError::fs(&self.path, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn default_when_absent() {
        let tracker = ProgressTracker::new(Arc::new(MemoryProgressStore::new()), "sub", 400_000);
        assert_eq!(tracker.load().await.unwrap(), 400_000);
        assert!(tracker.marker().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn advance_is_monotonic() {
        let store = Arc::new(MemoryProgressStore::new());
        let tracker = ProgressTracker::new(store.clone(), "sub", 0);

        assert!(tracker.advance(574287).await.unwrap());
        assert!(!tracker.advance(574200).await.unwrap());
        assert!(!tracker.advance(574287).await.unwrap());
        assert!(tracker.advance(574300).await.unwrap());

        let stored = store.load("sub").await.unwrap().unwrap();
        assert_eq!(stored.height, 574300);
        assert_eq!(tracker.load().await.unwrap(), 574300);
    }

    #[tokio::test]
    async fn force_save_can_rewind() {
        let tracker = ProgressTracker::new(Arc::new(MemoryProgressStore::new()), "sub", 0);
        tracker.advance(100).await.unwrap();
        tracker.force_save(50).await.unwrap();
        assert_eq!(tracker.load().await.unwrap(), 50);
        assert!(tracker.advance(60).await.unwrap());
    }

    #[tokio::test]
    async fn file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("block.tmp");
        let store = FileProgressStore::new(&path);

        assert!(store.load("sub").await.unwrap().is_none());
        store.save("sub", ProgressMarker::now(574287)).await.unwrap();
        store.save("other", ProgressMarker::now(1)).await.unwrap();

        let reopened = FileProgressStore::new(&path);
        assert_eq!(reopened.load("sub").await.unwrap().unwrap().height, 574287);
        assert_eq!(reopened.load("other").await.unwrap().unwrap().height, 1);
        assert!(!path.with_extension("tmp.partial").exists());
    }

    #[tokio::test]
    async fn file_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("block.tmp");
        std::fs::write(&path, b"not json").unwrap();
        let err = FileProgressStore::new(&path).load("sub").await.unwrap_err();
        assert!(matches!(err, IndexerError::Storage(_)));
    }
}
