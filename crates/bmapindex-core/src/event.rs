//! Normalized subscription events and the sink that feeds the event queue.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::IndexerError;

// ─── StatusKind ───────────────────────────────────────────────────────────────

/// Control status reported by the subscription service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatusKind {
    Connected,
    Waiting,
    BlockDone,
    Disconnected,
    Error,
}

impl std::fmt::Display for StatusKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::Waiting => write!(f, "waiting"),
            Self::BlockDone => write!(f, "block-done"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Error => write!(f, "error"),
        }
    }
}

// ─── Event ────────────────────────────────────────────────────────────────────

/// One event from the subscription, consumed exactly once in arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Event {
    /// A mined transaction matching the subscription filter.
    Transaction {
        height: u32,
        time: u32,
        id: String,
        #[serde(with = "hex")]
        raw: Vec<u8>,
    },
    /// An unconfirmed transaction.
    Mempool {
        id: String,
        #[serde(with = "hex")]
        raw: Vec<u8>,
    },
    Status {
        kind: StatusKind,
        height: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tx_count: Option<u64>,
    },
    SourceError { message: String },
}

impl Event {
    /// Block height the event refers to, if any.
    pub fn height(&self) -> Option<u32> {
        match self {
            Self::Transaction { height, .. } | Self::Status { height, .. } => Some(*height),
            Self::Mempool { .. } | Self::SourceError { .. } => None,
        }
    }

    pub fn status(kind: StatusKind, height: u32) -> Self {
        Self::Status {
            kind,
            height,
            tx_count: None,
        }
    }

    pub fn block_done(height: u32, tx_count: u64) -> Self {
        Self::Status {
            kind: StatusKind::BlockDone,
            height,
            tx_count: Some(tx_count),
        }
    }
}

// ─── Envelope / EventSink ─────────────────────────────────────────────────────

/// An event tagged with the subscription generation that produced it.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub generation: u64,
    pub event: Event,
}

/// Callback-style producer handle given to a subscription.
///
/// Every callback pushes onto the same bounded, ordered queue; a full queue
/// applies backpressure to the subscription.
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: u64,
    tx: mpsc::Sender<Envelope>,
}

impl EventSink {
    pub fn new(generation: u64, tx: mpsc::Sender<Envelope>) -> Self {
        Self { generation, tx }
    }

    /// The subscription generation this sink belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns `true` once the consumer has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn emit(&self, event: Event) -> Result<(), IndexerError> {
        self.tx
            .send(Envelope {
                generation: self.generation,
                event,
            })
            .await
            .map_err(|_| IndexerError::Source("event queue closed".into()))
    }

    pub async fn on_transaction(
        &self,
        height: u32,
        time: u32,
        id: impl Into<String>,
        raw: Vec<u8>,
    ) -> Result<(), IndexerError> {
        self.emit(Event::Transaction {
            height,
            time,
            id: id.into(),
            raw,
        })
        .await
    }

    pub async fn on_mempool(&self, id: impl Into<String>, raw: Vec<u8>) -> Result<(), IndexerError> {
        self.emit(Event::Mempool { id: id.into(), raw }).await
    }

    pub async fn on_status(
        &self,
        kind: StatusKind,
        height: u32,
        tx_count: Option<u64>,
    ) -> Result<(), IndexerError> {
        self.emit(Event::Status {
            kind,
            height,
            tx_count,
        })
        .await
    }

    pub async fn on_error(&self, message: impl Into<String>) -> Result<(), IndexerError> {
        self.emit(Event::SourceError {
            message: message.into(),
        })
        .await
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
