//! `SubscriptionSource` trait — abstraction over the real-time transaction feed.
//!
//! A source pushes its callbacks (`on_transaction`, `on_status`, `on_error`,
//! `on_mempool`) into an [`EventSink`]. The crawler owns the receiving end of
//! the queue and is its only consumer.

use async_trait::async_trait;

use crate::error::IndexerError;
use crate::event::EventSink;

/// An active subscription. Dropping it without unsubscribing is allowed but
/// may leave the producer running until the sink closes.
#[async_trait]
pub trait Subscription: Send {
    async fn unsubscribe(&mut self) -> Result<(), IndexerError>;
}

/// Abstracts over the external event-subscription service.
#[async_trait]
pub trait SubscriptionSource: Send + Sync {
    /// Start delivering events for `subscription_id` from `from_height` on.
    ///
    /// The service guarantees `block-done(H)` is emitted only after every
    /// transaction for `H`.
    async fn subscribe(
        &self,
        subscription_id: &str,
        from_height: u32,
        sink: EventSink,
    ) -> Result<Box<dyn Subscription>, IndexerError>;
}
