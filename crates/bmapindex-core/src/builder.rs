//! Fluent builder API for indexer configuration.
//!
//! # Example
//!
//! ```rust
//! use bmapindex_core::IndexerBuilder;
//!
//! let config = IndexerBuilder::new()
//!     .subscription_id("bmap")
//!     .from_block(574_000)
//!     .data_dir("/var/lib/bmapindex/data")
//!     .ingest_concurrency(16)
//!     .build_config();
//! assert_eq!(config.ingest_concurrency, 16);
//! ```

use std::path::PathBuf;

use crate::indexer::IndexerConfig;
use crate::retry::BackoffConfig;

/// Fluent builder for `IndexerConfig`.
#[derive(Default)]
pub struct IndexerBuilder {
    config: IndexerConfig,
}

impl IndexerBuilder {
    pub fn new() -> Self {
        Self {
            config: IndexerConfig::default(),
        }
    }

    /// Set the subscription id (also the progress key).
    pub fn subscription_id(mut self, id: impl Into<String>) -> Self {
        self.config.subscription_id = id.into();
        self
    }

    /// Set the event source endpoint.
    pub fn source_url(mut self, url: impl Into<String>) -> Self {
        self.config.source_url = url.into();
        self
    }

    /// Set the block to crawl from when nothing is stored.
    pub fn from_block(mut self, block: u32) -> Self {
        self.config.from_block = block;
        self
    }

    /// Start at `height` regardless of stored progress.
    pub fn start_height(mut self, height: u32) -> Self {
        self.config.start_height = Some(height);
        self
    }

    /// Set the directory block files are written to.
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.data_dir = dir.into();
        self
    }

    /// Set how many consecutive failures a height may cause before it is skipped.
    pub fn max_block_retries(mut self, n: u32) -> Self {
        self.config.max_block_retries = n;
        self
    }

    /// Set the number of concurrent upserts per block file.
    pub fn ingest_concurrency(mut self, n: usize) -> Self {
        self.config.ingest_concurrency = n;
        self
    }

    /// Move ingested block files under `<data_dir>/done/` instead of deleting them.
    pub fn retain_files(mut self) -> Self {
        self.config.delete_after_ingest = false;
        self
    }

    pub fn event_queue_capacity(mut self, n: usize) -> Self {
        self.config.event_queue_capacity = n;
        self
    }

    pub fn ready_queue_capacity(mut self, n: usize) -> Self {
        self.config.ready_queue_capacity = n;
        self
    }

    /// Set the reconnect backoff.
    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.config.backoff = backoff;
        self
    }

    /// Set the media types whose content is kept (as truncated text).
    pub fn allowed_content_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.transform.allowed_content_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Set the maximum length (in characters) of stored strings.
    pub fn max_string_len(mut self, n: usize) -> Self {
        self.config.transform.max_string_len = n;
        self
    }

    /// Build the `IndexerConfig`.
    pub fn build_config(self) -> IndexerConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let cfg = IndexerBuilder::new().build_config();
        assert_eq!(cfg.from_block, 400_000);
        assert_eq!(cfg.max_block_retries, 5);
        assert_eq!(cfg.transform.max_string_len, 255);
        assert!(cfg.start_height.is_none());
    }

    #[test]
    fn builder_custom() {
        let cfg = IndexerBuilder::new()
            .subscription_id("my-sub")
            .start_height(574_300)
            .data_dir("/tmp/blocks")
            .max_block_retries(3)
            .retain_files()
            .allowed_content_types(["text/plain"])
            .max_string_len(64)
            .build_config();

        assert_eq!(cfg.subscription_id, "my-sub");
        assert_eq!(cfg.resolve_start_height(600_000), 574_300);
        assert_eq!(cfg.data_dir, PathBuf::from("/tmp/blocks"));
        assert_eq!(cfg.max_block_retries, 3);
        assert!(!cfg.delete_after_ingest);
        assert_eq!(cfg.transform.allowed_content_types, vec!["text/plain".to_string()]);
        assert_eq!(cfg.transform.max_string_len, 64);
    }
}
