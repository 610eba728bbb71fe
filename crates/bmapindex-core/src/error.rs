//! Error types for the bmapindex pipeline.

use thiserror::Error;

/// Errors that can occur while crawling or ingesting.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("Source error: {0}")]
    Source(String),

    #[error("Subscription error at height {height}: {reason}")]
    Subscription { height: u32, reason: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Document store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Filesystem error on {path}: {reason}")]
    FileSystem { path: String, reason: String },

    #[error("Block {height} is finalized; refusing to append")]
    BlockFinalized { height: u32 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    pub(crate) fn fs(path: &std::path::Path, err: impl std::fmt::Display) -> Self {
        Self::FileSystem {
            path: path.display().to_string(),
            reason: err.to_string(),
        }
    }

    /// Returns `true` if the process cannot make progress after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable(_) | Self::FileSystem { .. } | Self::Config(_)
        )
    }
}

/// Errors raised by a [`TransactionDecoder`](crate::decoder::TransactionDecoder).
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Empty transaction payload")]
    Empty,

    #[error("Invalid transaction encoding: {reason}")]
    InvalidEncoding { reason: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Why a transaction did not become a document.
///
/// Rejections are routine outcomes of the transformer, not pipeline errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("malformed transaction: {0}")]
    Malformed(String),

    #[error("missing classification field '{0}'")]
    MissingClassification(&'static str),

    #[error("invalid text in field '{field}'")]
    EncodingViolation { field: String },
}
