//! The `TransactionDecoder` collaborator and the decoded transaction model.
//!
//! Wire-level decoding lives outside this crate. A decoder turns raw
//! transaction bytes into core fields plus zero or more semantic overlays;
//! the [`TransactionTransformer`](crate::transform::TransactionTransformer)
//! then sanitizes that into a storable document.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DecodeError;

/// Core transaction identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxCore {
    /// Transaction hash.
    pub h: String,
}

/// Semantic edge of an input or output: address, value, index, linked tx.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub a: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<u64>,
    pub i: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub h: Option<String>,
}

/// A decoded input or output, including low-level script trace data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxIo {
    pub i: u32,
    #[serde(default)]
    pub e: Edge,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u32>,
    /// Script trace (push-data cells, opcodes). Never persisted.
    #[serde(default)]
    pub tape: Vec<Value>,
}

/// A content-payload overlay (`B`): inline file content with a media type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentPayload {
    #[serde(with = "hex", default)]
    pub content: Vec<u8>,
    #[serde(rename = "content-type", default)]
    pub media_type: String,
    #[serde(default)]
    pub encoding: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

/// An ordinal-inscription overlay (`Ord`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inscription {
    #[serde(with = "hex", default)]
    pub data: Vec<u8>,
    #[serde(rename = "contentType", default)]
    pub content_type: String,
}

/// Output of a [`TransactionDecoder`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedTransaction {
    pub tx: TxCore,
    #[serde(rename = "in", default)]
    pub inputs: Vec<TxIo>,
    #[serde(rename = "out", default)]
    pub outputs: Vec<TxIo>,
    /// Classification overlay; the first entry carries `type` and `app`.
    #[serde(rename = "MAP", default)]
    pub map: Vec<Map<String, Value>>,
    /// Identity attestation.
    #[serde(rename = "AIP", default)]
    pub aip: Vec<Value>,
    /// Social claim.
    #[serde(rename = "BAP", default)]
    pub bap: Vec<Value>,
    #[serde(rename = "B", default)]
    pub b: Vec<ContentPayload>,
    #[serde(rename = "Ord", default)]
    pub ord: Vec<Inscription>,
    /// Proof-of-work boost.
    #[serde(rename = "BOOST", default)]
    pub boost: Vec<Value>,
}

/// Decodes raw transaction bytes.
///
/// Implementations must be `Send + Sync`; the crawler calls them from
/// blocking worker tasks.
pub trait TransactionDecoder: Send + Sync {
    fn decode(&self, raw: &[u8]) -> Result<DecodedTransaction, DecodeError>;
}

/// Decoder for transactions that were decoded upstream and shipped as JSON.
///
/// Binary fields (`B.content`, `Ord.data`) are hex strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonTransactionDecoder;

impl TransactionDecoder for JsonTransactionDecoder {
    fn decode(&self, raw: &[u8]) -> Result<DecodedTransaction, DecodeError> {
        if raw.is_empty() {
            return Err(DecodeError::Empty);
        }
        let tx: DecodedTransaction = serde_json::from_slice(raw)?;
        if tx.tx.h.is_empty() {
            return Err(DecodeError::MissingField { field: "tx.h".into() });
        }
        Ok(tx)
    }
}
