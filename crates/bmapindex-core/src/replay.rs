//! Replay source — re-emits a recorded NDJSON event log as a subscription.
//!
//! Each line of the log is one serialized [`Event`]. A subscription at height
//! `H` emits a `connected` status, then every logged event except
//! transactions and statuses below `H`. Events without a height (mempool
//! transactions, source errors) are delivered once per source, not once per
//! subscription. After the log is drained the subscription stays open and
//! idle, like a live feed waiting for new blocks.

use std::collections::HashSet;
use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::IndexerError;
use crate::event::{Event, EventSink, StatusKind};
use crate::subscription::{Subscription, SubscriptionSource};

/// Replays a fixed list of events on every subscription.
#[derive(Debug, Clone)]
pub struct ReplaySource {
    events: Arc<Vec<Event>>,
    /// Log positions of heightless events already delivered.
    delivered: Arc<Mutex<HashSet<usize>>>,
}

impl ReplaySource {
    pub fn new(events: Vec<Event>) -> Self {
        Self {
            events: Arc::new(events),
            delivered: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Load an NDJSON event log from disk.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, IndexerError> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|e| IndexerError::fs(path, e))?;
        Self::from_reader(std::io::BufReader::new(file))
    }

    /// Parse an NDJSON event log. Blank lines are ignored.
    pub fn from_reader(reader: impl BufRead) -> Result<Self, IndexerError> {
        let mut events = Vec::new();
        for (n, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| IndexerError::Source(e.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            let event: Event = serde_json::from_str(&line).map_err(|e| {
                IndexerError::Config(format!("event log line {}: {e}", n + 1))
            })?;
            events.push(event);
        }
        Ok(Self::new(events))
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

struct ReplaySubscription {
    task: JoinHandle<()>,
}

#[async_trait]
impl Subscription for ReplaySubscription {
    async fn unsubscribe(&mut self) -> Result<(), IndexerError> {
        self.task.abort();
        Ok(())
    }
}

impl Drop for ReplaySubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl SubscriptionSource for ReplaySource {
    async fn subscribe(
        &self,
        subscription_id: &str,
        from_height: u32,
        sink: EventSink,
    ) -> Result<Box<dyn Subscription>, IndexerError> {
        info!(
            subscription = subscription_id,
            from_height,
            events = self.events.len(),
            "Replaying event log"
        );
        let events = Arc::clone(&self.events);
        let delivered = Arc::clone(&self.delivered);
        let task = tokio::spawn(async move {
            if sink
                .on_status(StatusKind::Connected, from_height, None)
                .await
                .is_err()
            {
                return;
            }
            for (pos, event) in events.iter().enumerate() {
                match event.height() {
                    Some(h) if h < from_height => continue,
                    None if !delivered.lock().insert(pos) => continue,
                    _ => {}
                }
                if sink.emit(event.clone()).await.is_err() {
                    debug!("Replay consumer gone, stopping");
                    return;
                }
            }
        });
        Ok(Box::new(ReplaySubscription { task }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    const LOG: &str = r#"
{"type":"transaction","height":10,"time":1,"id":"a","raw":"00"}
{"type":"status","kind":"block-done","height":10,"tx_count":1}

{"type":"transaction","height":11,"time":2,"id":"b","raw":"01"}
{"type":"mempool","id":"m","raw":"02"}
{"type":"status","kind":"block-done","height":11,"tx_count":1}
"#;

    #[test]
    fn parses_ndjson_log() {
        let src = ReplaySource::from_reader(LOG.as_bytes()).unwrap();
        assert_eq!(src.len(), 5);
    }

    #[test]
    fn rejects_bad_line() {
        let err = ReplaySource::from_reader("{\"type\":\"nope\"}\n".as_bytes()).unwrap_err();
        assert!(matches!(err, IndexerError::Config(_)));
    }

    #[tokio::test]
    async fn skips_heights_below_start() {
        let src = ReplaySource::from_reader(LOG.as_bytes()).unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let _sub = src.subscribe("sub", 11, EventSink::new(1, tx)).await.unwrap();

        let first = rx.recv().await.unwrap().event;
        assert_eq!(first, Event::status(StatusKind::Connected, 11));

        let mut rest = Vec::new();
        for _ in 0..3 {
            rest.push(rx.recv().await.unwrap().event);
        }
        assert!(matches!(rest[0], Event::Transaction { height: 11, .. }));
        assert!(matches!(rest[1], Event::Mempool { .. }));
        assert_eq!(rest[2], Event::block_done(11, 1));
    }

    #[tokio::test]
    async fn heightless_events_replay_once() {
        let src = ReplaySource::new(vec![
            Event::SourceError {
                message: "feed dropped".into(),
            },
            Event::block_done(10, 0),
        ]);

        let (tx, mut rx) = mpsc::channel(16);
        let first = src.subscribe("sub", 10, EventSink::new(1, tx)).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().event, Event::status(StatusKind::Connected, 10));
        assert!(matches!(rx.recv().await.unwrap().event, Event::SourceError { .. }));
        assert_eq!(rx.recv().await.unwrap().event, Event::block_done(10, 0));
        drop(first);

        let (tx, mut rx) = mpsc::channel(16);
        let _second = src.subscribe("sub", 10, EventSink::new(2, tx)).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().event, Event::status(StatusKind::Connected, 10));
        assert_eq!(rx.recv().await.unwrap().event, Event::block_done(10, 0));
    }
}
