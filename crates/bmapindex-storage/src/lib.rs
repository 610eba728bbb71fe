//! bmapindex-storage — persistent backends for BmapIndex.
//!
//! Backends:
//! - [`sqlite`] — SQLite via `sqlx`: documents keyed by collection and `_id`,
//!   plus the progress marker table.
//!
//! In-memory stores for tests live in `bmapindex-core`.

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;
