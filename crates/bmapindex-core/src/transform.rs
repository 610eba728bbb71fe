//! Transaction transformer — raw bytes + block metadata → sanitized document.
//!
//! Sanitization runs in a fixed order:
//! 1. script trace data is dropped from every input and output;
//! 2. content-bearing overlays keep their content only when the declared
//!    media type is allow-listed (otherwise it is redacted);
//! 3. the first `MAP` entry must carry string `type` and `app` fields;
//! 4. every string must be well-formed text, and every overlay string value
//!    is truncated to `max_string_len` characters;
//! 5. the document is keyed by the transaction hash and filed under the
//!    `type` classifier.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::decoder::{ContentPayload, DecodedTransaction, Inscription, TransactionDecoder};
use crate::document::{BlockRef, SanitizedDocument, SanitizedIo};
use crate::error::Rejection;

/// Default media types whose content is kept.
pub const DEFAULT_ALLOWED_CONTENT_TYPES: &[&str] =
    &["text/plain", "text/markdown", "text/html", "application/json"];

/// Default cap on overlay string length, in characters.
pub const DEFAULT_MAX_STRING_LEN: usize = 255;

/// Sanitization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformConfig {
    /// Media types whose content survives redaction.
    pub allowed_content_types: Vec<String>,
    /// Maximum characters kept in any overlay string value.
    pub max_string_len: usize,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            allowed_content_types: DEFAULT_ALLOWED_CONTENT_TYPES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_string_len: DEFAULT_MAX_STRING_LEN,
        }
    }
}

/// Turns raw transactions into [`SanitizedDocument`]s.
///
/// Stateless apart from its configuration; safe to share across threads.
pub struct TransactionTransformer {
    decoder: Arc<dyn TransactionDecoder>,
    config: TransformConfig,
}

impl TransactionTransformer {
    pub fn new(decoder: Arc<dyn TransactionDecoder>, config: TransformConfig) -> Self {
        Self { decoder, config }
    }

    pub fn config(&self) -> &TransformConfig {
        &self.config
    }

    /// Transform a transaction first seen now.
    pub fn transform(
        &self,
        raw: &[u8],
        height: u32,
        time: u32,
    ) -> Result<SanitizedDocument, Rejection> {
        self.transform_at(raw, height, time, chrono::Utc::now().timestamp())
    }

    /// Transform a transaction first seen at `seen_at` (unix seconds).
    pub fn transform_at(
        &self,
        raw: &[u8],
        height: u32,
        time: u32,
        seen_at: i64,
    ) -> Result<SanitizedDocument, Rejection> {
        let decoded = self
            .decoder
            .decode(raw)
            .map_err(|e| Rejection::Malformed(e.to_string()))?;
        let DecodedTransaction {
            tx,
            inputs,
            outputs,
            map,
            aip,
            bap,
            b,
            ord,
            boost,
        } = decoded;

        // 1. strip script traces
        let inputs: Vec<SanitizedIo> = inputs.into_iter().map(SanitizedIo::from).collect();
        let outputs: Vec<SanitizedIo> = outputs.into_iter().map(SanitizedIo::from).collect();

        // 2. redact / truncate content overlays
        let b: Vec<_> = b
            .iter()
            .enumerate()
            .map(|(n, p)| self.sanitize_payload(n, p))
            .collect();
        let ord: Vec<_> = ord
            .iter()
            .enumerate()
            .map(|(n, ins)| self.sanitize_inscription(n, ins))
            .collect();

        // 3. classification
        let collection = classify(&map)?;

        // 4. text validation
        let b = b.into_iter().collect::<Result<Vec<_>, _>>()?;
        let ord = ord.into_iter().collect::<Result<Vec<_>, _>>()?;
        check_str("tx.h", &tx.h)?;
        for (label, ios) in [("in", &inputs), ("out", &outputs)] {
            for io in ios {
                for s in [&io.e.a, &io.e.h].into_iter().flatten() {
                    check_str(label, s)?;
                }
            }
        }

        let mut overlays = Map::new();
        overlays.insert(
            "MAP".into(),
            Value::Array(map.into_iter().map(Value::Object).collect()),
        );
        for (key, section) in [
            ("AIP", aip),
            ("BAP", bap),
            ("B", b),
            ("Ord", ord),
            ("BOOST", boost),
        ] {
            if !section.is_empty() {
                overlays.insert(key.into(), Value::Array(section));
            }
        }
        for (key, value) in overlays.iter_mut() {
            self.sanitize_value(key, value)?;
        }

        // 5. build
        Ok(SanitizedDocument {
            id: tx.h.clone(),
            collection,
            tx,
            blk: BlockRef { i: height, t: time },
            timestamp: seen_at,
            inputs,
            outputs,
            overlays,
        })
    }

    fn allows(&self, media_type: &str) -> bool {
        let essence = media_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        self.config
            .allowed_content_types
            .iter()
            .any(|t| t.eq_ignore_ascii_case(&essence))
    }

    fn truncate(&self, s: &str) -> String {
        truncate_chars(s, self.config.max_string_len)
    }

    /// Validate every string under `value` and truncate string values.
    fn sanitize_value(&self, path: &str, value: &mut Value) -> Result<(), Rejection> {
        match value {
            Value::String(s) => {
                check_str(path, s)?;
                if s.chars().nth(self.config.max_string_len).is_some() {
                    *s = self.truncate(s);
                }
                Ok(())
            }
            Value::Array(items) => items
                .iter_mut()
                .enumerate()
                .try_for_each(|(i, v)| self.sanitize_value(&format!("{path}[{i}]"), v)),
            Value::Object(fields) => fields.iter_mut().try_for_each(|(k, v)| {
                let path = format!("{path}.{k}");
                check_str(&path, k)?;
                self.sanitize_value(&path, v)
            }),
            _ => Ok(()),
        }
    }

    fn sanitize_payload(&self, n: usize, p: &ContentPayload) -> Result<Value, Rejection> {
        let mut out = Map::new();
        out.insert("content-type".into(), self.truncate(&p.media_type).into());
        out.insert("encoding".into(), self.truncate(&p.encoding).into());
        if let Some(name) = &p.filename {
            out.insert("filename".into(), self.truncate(name).into());
        }
        self.attach_content(&mut out, "content", &p.content, &p.media_type, || {
            format!("B[{n}].content")
        })?;
        Ok(Value::Object(out))
    }

    fn sanitize_inscription(&self, n: usize, ins: &Inscription) -> Result<Value, Rejection> {
        let mut out = Map::new();
        out.insert("contentType".into(), self.truncate(&ins.content_type).into());
        self.attach_content(&mut out, "data", &ins.data, &ins.content_type, || {
            format!("Ord[{n}].data")
        })?;
        Ok(Value::Object(out))
    }

    fn attach_content(
        &self,
        out: &mut Map<String, Value>,
        key: &str,
        bytes: &[u8],
        media_type: &str,
        field: impl Fn() -> String,
    ) -> Result<(), Rejection> {
        if self.allows(media_type) {
            let text = std::str::from_utf8(bytes)
                .map_err(|_| Rejection::EncodingViolation { field: field() })?;
            out.insert(key.into(), self.truncate(text).into());
        } else {
            out.insert("redacted".into(), Value::Bool(true));
        }
        Ok(())
    }
}

/// Returns the `type` classifier of the first `MAP` entry, requiring `app`.
fn classify(map: &[Map<String, Value>]) -> Result<String, Rejection> {
    let primary = map
        .first()
        .ok_or(Rejection::MissingClassification("type"))?;
    let kind = primary
        .get("type")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or(Rejection::MissingClassification("type"))?;
    primary
        .get("app")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or(Rejection::MissingClassification("app"))?;
    Ok(kind.to_string())
}

/// Keep at most `max` characters of `s`.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// NUL and U+FFFD (the mark of a lossy decode) are not well-formed text.
pub fn is_well_formed(s: &str) -> bool {
    !s.contains(['\0', char::REPLACEMENT_CHARACTER])
}

fn check_str(field: &str, s: &str) -> Result<(), Rejection> {
    if is_well_formed(s) {
        Ok(())
    } else {
        Err(Rejection::EncodingViolation {
            field: field.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::JsonTransactionDecoder;
    use serde_json::json;

    fn transformer() -> TransactionTransformer {
        TransactionTransformer::new(Arc::new(JsonTransactionDecoder), TransformConfig::default())
    }

    fn raw(v: Value) -> Vec<u8> {
        v.to_string().into_bytes()
    }

    fn post(extra: Value) -> Value {
        let mut tx = json!({
            "tx": { "h": "f00d" },
            "in": [{ "i": 0, "e": { "h": "beef", "i": 1, "a": "1Addr" }, "seq": 4294967295u32,
                     "tape": [{ "cell": [{ "b": "AAAA", "s": "...", "i": 0 }] }] }],
            "out": [{ "i": 0, "e": { "v": 0, "i": 0 }, "tape": [{ "cell": [] }] }],
            "MAP": [{ "app": "myApp", "type": "post", "cmd": "SET" }]
        });
        if let (Some(base), Value::Object(more)) = (tx.as_object_mut(), extra) {
            base.extend(more);
        }
        tx
    }

    #[test]
    fn builds_document() {
        let doc = transformer()
            .transform_at(&raw(post(json!({}))), 574287, 1554076800, 42)
            .unwrap();
        assert_eq!(doc.id, "f00d");
        assert_eq!(doc.collection, "post");
        assert_eq!(doc.blk, BlockRef { i: 574287, t: 1554076800 });
        assert_eq!(doc.timestamp, 42);
        assert_eq!(doc.overlays["MAP"][0]["app"], "myApp");
        assert!(!doc.overlays.contains_key("B"));
    }

    #[test]
    fn strips_script_traces() {
        let doc = transformer()
            .transform_at(&raw(post(json!({}))), 1, 1, 0)
            .unwrap();
        let line = doc.to_line().unwrap();
        assert!(!line.contains("tape"));
        assert_eq!(doc.inputs[0].e.h.as_deref(), Some("beef"));
        assert_eq!(doc.inputs[0].seq, Some(u32::MAX));
    }

    #[test]
    fn truncates_allow_listed_text() {
        let text = "x".repeat(2000);
        let tx = post(json!({
            "B": [{ "content": hex::encode(&text), "content-type": "text/plain", "encoding": "utf-8" }]
        }));
        let doc = transformer().transform_at(&raw(tx), 1, 1, 0).unwrap();
        let content = doc.overlays["B"][0]["content"].as_str().unwrap();
        assert_eq!(content.chars().count(), 255);
        assert!(doc.overlays["B"][0].get("redacted").is_none());
    }

    #[test]
    fn truncates_every_overlay_string() {
        let long = "y".repeat(300);
        let tx = json!({
            "tx": { "h": "a" },
            "MAP": [{ "app": "x", "type": "post", "content": long.clone() }],
            "AIP": [{ "signature": long.clone(), "fields": [long.clone(), "short"] }]
        });
        let doc = transformer().transform_at(&raw(tx), 1, 1, 0).unwrap();
        assert_eq!(doc.overlays["MAP"][0]["content"].as_str().unwrap().len(), 255);
        assert_eq!(doc.overlays["AIP"][0]["signature"].as_str().unwrap().len(), 255);
        assert_eq!(doc.overlays["AIP"][0]["fields"][0].as_str().unwrap().len(), 255);
        assert_eq!(doc.overlays["AIP"][0]["fields"][1], "short");
        assert_eq!(doc.overlays["MAP"][0]["type"], "post");
        assert_eq!(doc.tx.h, "a");
    }

    #[test]
    fn truncates_on_char_boundary() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 255), "abc");
    }

    #[test]
    fn redacts_other_media_types() {
        let tx = post(json!({
            "B": [{ "content": "89504e47", "content-type": "image/png", "encoding": "binary" }],
            "Ord": [{ "data": "ff00", "contentType": "image/webp" }]
        }));
        let doc = transformer().transform_at(&raw(tx), 1, 1, 0).unwrap();
        assert!(doc.overlays["B"][0].get("content").is_none());
        assert_eq!(doc.overlays["B"][0]["redacted"], true);
        assert_eq!(doc.overlays["Ord"][0]["redacted"], true);
        assert_eq!(doc.overlays["Ord"][0]["contentType"], "image/webp");
    }

    #[test]
    fn media_type_parameters_ignored() {
        let tx = post(json!({
            "B": [{ "content": hex::encode("hi"), "content-type": "Text/Plain; charset=utf-8", "encoding": "utf-8" }]
        }));
        let doc = transformer().transform_at(&raw(tx), 1, 1, 0).unwrap();
        assert_eq!(doc.overlays["B"][0]["content"], "hi");
    }

    #[test]
    fn missing_classification_filtered() {
        let t = transformer();
        let no_app = json!({ "tx": { "h": "a" }, "MAP": [{ "type": "post" }] });
        assert_eq!(
            t.transform_at(&raw(no_app), 1, 1, 0).unwrap_err(),
            Rejection::MissingClassification("app")
        );
        let no_map = json!({ "tx": { "h": "a" } });
        assert_eq!(
            t.transform_at(&raw(no_map), 1, 1, 0).unwrap_err(),
            Rejection::MissingClassification("type")
        );
        let numeric_type = json!({ "tx": { "h": "a" }, "MAP": [{ "type": 7, "app": "x" }] });
        assert_eq!(
            t.transform_at(&raw(numeric_type), 1, 1, 0).unwrap_err(),
            Rejection::MissingClassification("type")
        );
    }

    #[test]
    fn classification_checked_before_encoding() {
        let tx = json!({
            "tx": { "h": "a" },
            "MAP": [{ "app": "x" }],
            "B": [{ "content": "ff", "content-type": "text/plain" }]
        });
        assert_eq!(
            transformer().transform_at(&raw(tx), 1, 1, 0).unwrap_err(),
            Rejection::MissingClassification("type")
        );
    }

    #[test]
    fn invalid_text_rejected() {
        let bad_utf8 = post(json!({
            "B": [{ "content": "c328", "content-type": "text/plain", "encoding": "utf-8" }]
        }));
        assert_eq!(
            transformer().transform_at(&raw(bad_utf8), 1, 1, 0).unwrap_err(),
            Rejection::EncodingViolation {
                field: "B[0].content".into()
            }
        );

        let nul = json!({
            "tx": { "h": "a" },
            "MAP": [{ "app": "x", "type": "post", "context": "bad\u{0000}" }]
        });
        assert!(matches!(
            transformer().transform_at(&raw(nul), 1, 1, 0),
            Err(Rejection::EncodingViolation { .. })
        ));

        let lossy = json!({
            "tx": { "h": "a" },
            "MAP": [{ "app": "x", "type": "post" }],
            "AIP": [{ "signature": "\u{FFFD}" }]
        });
        assert!(matches!(
            transformer().transform_at(&raw(lossy), 1, 1, 0),
            Err(Rejection::EncodingViolation { .. })
        ));
    }

    #[test]
    fn malformed_bytes_rejected() {
        assert!(matches!(
            transformer().transform_at(&[0x01, 0x00, 0x00], 1, 1, 0),
            Err(Rejection::Malformed(_))
        ));
    }
}
