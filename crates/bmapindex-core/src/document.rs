//! The sanitized document written to block files.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::decoder::{Edge, TxCore, TxIo};

/// Block coordinates of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    /// Block height.
    pub i: u32,
    /// Block time (unix seconds).
    pub t: u32,
}

/// An input or output with script trace data stripped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanitizedIo {
    pub i: u32,
    pub e: Edge,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u32>,
}

impl From<TxIo> for SanitizedIo {
    fn from(io: TxIo) -> Self {
        Self {
            i: io.i,
            e: io.e,
            seq: io.seq,
        }
    }
}

/// One line of a block file.
///
/// `id` and `collection` are always non-empty; the transformer never builds
/// a document without them. Overlay sections (`MAP`, `AIP`, `BAP`, `B`,
/// `Ord`, `BOOST`) live in the open `overlays` map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SanitizedDocument {
    #[serde(rename = "_id")]
    pub id: String,
    pub collection: String,
    pub tx: TxCore,
    pub blk: BlockRef,
    /// First-seen time (unix seconds).
    pub timestamp: i64,
    #[serde(rename = "in", default)]
    pub inputs: Vec<SanitizedIo>,
    #[serde(rename = "out", default)]
    pub outputs: Vec<SanitizedIo>,
    #[serde(flatten)]
    pub overlays: Map<String, Value>,
}

impl SanitizedDocument {
    /// Serialize to a single NDJSON line (without the trailing newline).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
