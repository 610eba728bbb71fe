//! SQLite storage backend for BmapIndex.
//!
//! Persists documents and progress markers to a single SQLite file.
//! Uses `sqlx` with WAL mode for concurrent read performance.
//!
//! # Usage
//! ```rust,no_run
//! use bmapindex_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open("./bmap.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;
use tracing::debug;

use bmapindex_core::error::IndexerError;
use bmapindex_core::progress::{ProgressMarker, ProgressStore};
use bmapindex_core::store::{matches_filter, merge_fields, Document, DocumentStore};

/// SQLite-backed document and progress storage.
pub struct SqliteStorage {
    pool: SqlitePool,
    /// Upserts are read-merge-write; this keeps them atomic per process.
    write_lock: Mutex<()>,
}

/// Connection-level failures mean the store is unreachable; everything
/// else is a per-operation storage error.
fn db_err(e: sqlx::Error) -> IndexerError {
    match e {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => IndexerError::StoreUnavailable(e.to_string()),
        other => IndexerError::Storage(other.to_string()),
    }
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./bmap.db"`) or a full
    /// SQLite URL (`"sqlite:./bmap.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, IndexerError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url)
            .await
            .map_err(|e| IndexerError::StoreUnavailable(format!("{path}: {e}")))?;

        let storage = Self::from_pool(pool);
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Open an in-memory SQLite database.
    ///
    /// All data is lost when the pool is dropped. Ideal for tests.
    pub async fn in_memory() -> Result<Self, IndexerError> {
        // Every connection to `:memory:` is a separate database, so the pool
        // must hold exactly one connection for its whole lifetime.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| IndexerError::StoreUnavailable(e.to_string()))?;

        let storage = Self::from_pool(pool);
        storage.init_schema().await?;
        Ok(storage)
    }

    fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Mutex::new(()),
        }
    }

    /// Create tables and enable WAL mode.
    async fn init_schema(&self) -> Result<(), IndexerError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS documents (
                collection TEXT    NOT NULL,
                id         TEXT    NOT NULL,
                body       TEXT    NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (collection, id)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS progress (
                key        TEXT    PRIMARY KEY,
                height     INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    /// Document counts per collection, ordered by name.
    pub async fn collections(&self) -> Result<Vec<(String, u64)>, IndexerError> {
        let rows = sqlx::query(
            "SELECT collection, COUNT(*) AS cnt FROM documents
             GROUP BY collection ORDER BY collection",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(|r| (r.get("collection"), r.get::<i64, _>("cnt") as u64))
            .collect())
    }

    async fn load_body(&self, collection: &str, id: &str) -> Result<Option<Document>, IndexerError> {
        let row = sqlx::query("SELECT body FROM documents WHERE collection = ? AND id = ?")
            .bind(collection)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|r| parse_body(&r.get::<String, _>("body")))
            .transpose()
    }
}

fn parse_body(body: &str) -> Result<Document, IndexerError> {
    match serde_json::from_str(body) {
        Ok(Value::Object(doc)) => Ok(doc),
        Ok(_) => Err(IndexerError::Storage("stored body is not an object".into())),
        Err(e) => Err(IndexerError::Storage(e.to_string())),
    }
}

// ─── DocumentStore impl ──────────────────────────────────────────────────────

#[async_trait]
impl DocumentStore for SqliteStorage {
    async fn upsert_one(
        &self,
        collection: &str,
        id: &str,
        mut document: Document,
    ) -> Result<String, IndexerError> {
        document.insert("_id".into(), Value::String(id.to_string()));

        let _guard = self.write_lock.lock().await;
        let merged = match self.load_body(collection, id).await? {
            Some(mut existing) => {
                merge_fields(&mut existing, document);
                existing
            }
            None => document,
        };
        let body = serde_json::to_string(&merged).map_err(|e| IndexerError::Storage(e.to_string()))?;

        sqlx::query(
            "INSERT OR REPLACE INTO documents (collection, id, body, updated_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(collection)
        .bind(id)
        .bind(&body)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        debug!(collection, id, "document upserted");
        Ok(id.to_string())
    }

    async fn find_many(
        &self,
        collection: &str,
        filter: &Document,
        limit: usize,
        skip: usize,
    ) -> Result<Vec<Document>, IndexerError> {
        let rows = match filter.get("_id").and_then(Value::as_str) {
            Some(id) => sqlx::query("SELECT body FROM documents WHERE collection = ? AND id = ?")
                .bind(collection)
                .bind(id)
                .fetch_all(&self.pool)
                .await,
            None => sqlx::query("SELECT body FROM documents WHERE collection = ? ORDER BY id")
                .bind(collection)
                .fetch_all(&self.pool)
                .await,
        }
        .map_err(db_err)?;

        let mut docs = Vec::new();
        for row in rows {
            let doc = parse_body(&row.get::<String, _>("body"))?;
            if matches_filter(&doc, filter) {
                docs.push(doc);
            }
        }
        Ok(docs.into_iter().skip(skip).take(limit).collect())
    }

    async fn count(&self, collection: &str) -> Result<u64, IndexerError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM documents WHERE collection = ?")
            .bind(collection)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;

        let cnt: i64 = row.get("cnt");
        Ok(cnt as u64)
    }
}

// ─── ProgressStore impl ──────────────────────────────────────────────────────

#[async_trait]
impl ProgressStore for SqliteStorage {
    async fn load(&self, key: &str) -> Result<Option<ProgressMarker>, IndexerError> {
        let row = sqlx::query("SELECT height, updated_at FROM progress WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(row.map(|r| ProgressMarker {
            height: r.get::<i64, _>("height") as u32,
            updated_at: r.get("updated_at"),
        }))
    }

    async fn save(&self, key: &str, marker: ProgressMarker) -> Result<(), IndexerError> {
        sqlx::query(
            "INSERT OR REPLACE INTO progress (key, height, updated_at)
             VALUES (?, ?, ?)",
        )
        .bind(key)
        .bind(marker.height as i64)
        .bind(marker.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        debug!(key, height = marker.height, "progress saved");
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Document {
        match v {
            Value::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    // ── DocumentStore ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn upsert_and_find_by_id() {
        let store = SqliteStorage::in_memory().await.unwrap();
        store
            .upsert_one("post", "abc", obj(json!({ "tx": { "h": "abc" }, "timestamp": 10 })))
            .await
            .unwrap();

        let filter = obj(json!({ "_id": "abc" }));
        let found = store.find_many("post", &filter, 1, 0).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["_id"], "abc");
        assert_eq!(found[0]["tx"]["h"], "abc");
        assert!(store.find_many("like", &filter, 1, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn upsert_merges_top_level_fields() {
        let store = SqliteStorage::in_memory().await.unwrap();
        store
            .upsert_one("post", "a", obj(json!({ "x": { "keep": 1 }, "y": 1 })))
            .await
            .unwrap();
        store
            .upsert_one("post", "a", obj(json!({ "x": { "new": 2 } })))
            .await
            .unwrap();

        let doc = store
            .find_many("post", &obj(json!({ "_id": "a" })), 1, 0)
            .await
            .unwrap()
            .remove(0);
        assert_eq!(doc["x"], json!({ "new": 2 }));
        assert_eq!(doc["y"], 1);
        assert_eq!(store.count("post").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn find_many_filters_and_pages() {
        let store = SqliteStorage::in_memory().await.unwrap();
        for (id, app) in [("a", "one"), ("b", "two"), ("c", "one"), ("d", "one")] {
            store
                .upsert_one("post", id, obj(json!({ "app": app })))
                .await
                .unwrap();
        }
        let page = store
            .find_many("post", &obj(json!({ "app": "one" })), 2, 1)
            .await
            .unwrap();
        let ids: Vec<_> = page.iter().map(|d| d["_id"].clone()).collect();
        assert_eq!(ids, vec![json!("c"), json!("d")]);
    }

    #[tokio::test]
    async fn collection_counts() {
        let store = SqliteStorage::in_memory().await.unwrap();
        store.upsert_one("post", "a", Document::new()).await.unwrap();
        store.upsert_one("post", "b", Document::new()).await.unwrap();
        store.upsert_one("like", "c", Document::new()).await.unwrap();

        assert_eq!(
            store.collections().await.unwrap(),
            vec![("like".to_string(), 1), ("post".to_string(), 2)]
        );
    }

    // ── ProgressStore ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn progress_roundtrip() {
        let store = SqliteStorage::in_memory().await.unwrap();
        assert!(store.load("bmap").await.unwrap().is_none());

        store
            .save("bmap", ProgressMarker { height: 574287, updated_at: 1_700_000_000 })
            .await
            .unwrap();
        store
            .save("bmap", ProgressMarker { height: 574300, updated_at: 1_700_000_100 })
            .await
            .unwrap();

        let loaded = store.load("bmap").await.unwrap().unwrap();
        assert_eq!(loaded.height, 574300);
        assert_eq!(loaded.updated_at, 1_700_000_100);
    }

    #[tokio::test]
    async fn file_backed_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bmap.db");
        let path = path.to_str().unwrap();

        let store = SqliteStorage::open(path).await.unwrap();
        store.upsert_one("post", "a", obj(json!({ "v": 1 }))).await.unwrap();
        store
            .save("bmap", ProgressMarker { height: 9, updated_at: 0 })
            .await
            .unwrap();
        drop(store);

        let reopened = SqliteStorage::open(path).await.unwrap();
        assert_eq!(reopened.count("post").await.unwrap(), 1);
        assert_eq!(reopened.load("bmap").await.unwrap().unwrap().height, 9);
    }
}
