//! Document store collaborator — where ingested documents are persisted.
//!
//! Implementations include [`MemoryDocumentStore`] (here) and
//! `SqliteStorage` in `bmapindex-storage`.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::error::IndexerError;

/// A stored document: a JSON object keyed by `_id`.
pub type Document = Map<String, Value>;

/// Trait for persisting and querying documents by collection.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert the document, or merge its top-level fields into the existing
    /// document with the same `_id`. Returns the id.
    async fn upsert_one(
        &self,
        collection: &str,
        id: &str,
        document: Document,
    ) -> Result<String, IndexerError>;

    /// Documents whose top-level fields equal every entry of `filter`,
    /// ordered by `_id`.
    async fn find_many(
        &self,
        collection: &str,
        filter: &Document,
        limit: usize,
        skip: usize,
    ) -> Result<Vec<Document>, IndexerError>;

    /// Number of documents in a collection.
    async fn count(&self, collection: &str) -> Result<u64, IndexerError>;
}

/// Returns `true` if every filter field equals the document's field.
pub fn matches_filter(document: &Document, filter: &Document) -> bool {
    filter
        .iter()
        .all(|(key, want)| document.get(key) == Some(want))
}

/// `$set`-style merge of `update` into `existing`.
pub fn merge_fields(existing: &mut Document, update: Document) {
    for (key, value) in update {
        existing.insert(key, value);
    }
}

/// In-memory document store for tests and ephemeral runs.
///
/// All data is lost when the process exits.
#[derive(Default)]
pub struct MemoryDocumentStore {
    collections: Mutex<HashMap<String, BTreeMap<String, Document>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of collections holding at least one document.
    pub fn collections(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .collections
            .lock()
            .iter()
            .filter(|(_, docs)| !docs.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Fetch a single document by id.
    pub fn get(&self, collection: &str, id: &str) -> Option<Document> {
        self.collections
            .lock()
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn upsert_one(
        &self,
        collection: &str,
        id: &str,
        mut document: Document,
    ) -> Result<String, IndexerError> {
        document.insert("_id".into(), Value::String(id.to_string()));
        let mut collections = self.collections.lock();
        let docs = collections.entry(collection.to_string()).or_default();
        match docs.get_mut(id) {
            Some(existing) => merge_fields(existing, document),
            None => {
                docs.insert(id.to_string(), document);
            }
        }
        Ok(id.to_string())
    }

    async fn find_many(
        &self,
        collection: &str,
        filter: &Document,
        limit: usize,
        skip: usize,
    ) -> Result<Vec<Document>, IndexerError> {
        let collections = self.collections.lock();
        let Some(docs) = collections.get(collection) else {
            return Ok(vec![]);
        };
        Ok(docs
            .values()
            .filter(|d| matches_filter(d, filter))
            .skip(skip)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count(&self, collection: &str) -> Result<u64, IndexerError> {
        Ok(self
            .collections
            .lock()
            .get(collection)
            .map_or(0, |docs| docs.len() as u64))
    }
}
