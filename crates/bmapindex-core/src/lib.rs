//! bmapindex-core — crawl, block-file handoff, and ingestion for BMAP
//! transactions.
//!
//! # Architecture
//!
//! ```text
//! SubscriptionSource ─► EventSink ─► bounded event queue
//!                                          │ (single consumer)
//!                                          ▼
//!                                  CrawlStateMachine
//!                                   ├── TransactionTransformer (decode, sanitize, classify)
//!                                   └── BlockWriter            (<data_dir>/<height>.json, seal on block-done)
//!                                          │
//!                     read-only file ──────┤────── block notices (unbounded)
//!                            ▼                                │
//!                    ReadinessWatcher ─► ready-file queue     │
//!                                          │                  │
//!                                          ▼                  │
//!                                IngestionWorkerPool ◄────────┘
//!                                  ├─► DocumentStore
//!                                  └─► ProgressGate ─► ProgressTracker
//! ```
//!
//! Write access to a block file means the crawler still owns it; once every
//! write bit is cleared it belongs to ingestion. No other lock is shared
//! between the two sides. Progress only moves past a height once every lower
//! block the crawler announced has been ingested.

pub mod builder;
pub mod crawler;
pub mod decoder;
pub mod document;
pub mod error;
pub mod event;
pub mod indexer;
pub mod ingest;
pub mod progress;
pub mod replay;
pub mod retry;
pub mod store;
pub mod subscription;
pub mod transform;
pub mod watcher;
pub mod writer;

pub use builder::IndexerBuilder;
pub use crawler::{CrawlHandle, CrawlOutcome, CrawlPhase, CrawlStateMachine, CrawlStats, CrawlSummary};
pub use decoder::{DecodedTransaction, JsonTransactionDecoder, TransactionDecoder};
pub use document::SanitizedDocument;
pub use error::{DecodeError, IndexerError, Rejection};
pub use event::{Event, EventSink, StatusKind};
pub use indexer::{Collaborators, Indexer, IndexerConfig};
pub use ingest::{
    BlockNotice, IngestConfig, IngestStats, IngestionWorkerPool, ProgressGate, ReadyFile, ARCHIVE_DIR,
};
pub use progress::{FileProgressStore, MemoryProgressStore, ProgressMarker, ProgressStore, ProgressTracker};
pub use replay::ReplaySource;
pub use retry::BackoffConfig;
pub use store::{Document, DocumentStore, MemoryDocumentStore};
pub use subscription::{Subscription, SubscriptionSource};
pub use transform::{TransactionTransformer, TransformConfig};
pub use watcher::ReadinessWatcher;
pub use writer::BlockWriter;
