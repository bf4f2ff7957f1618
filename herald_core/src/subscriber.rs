//! Subscribers receive the messages of a topic.

use crate::message::{Headers, Message};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;

/// Error returned by a subscriber. Any error other than [`Discard`] goes through the topic's
/// retry and dead-letter policy.
pub type SubscriberError = Box<dyn std::error::Error + Send + Sync>;

/// Sentinel error a subscriber returns to drop an event without retrying or dead-lettering it.
///
/// ```ignore
/// topic.subscribe(|delivery: Delivery<OrderPlaced>| async move {
///     if delivery.message.total == 0 {
///         return Err(Discard.into());
///     }
///     Ok(())
/// }).await?;
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("event discarded by subscriber")]
pub struct Discard;

/// Whether a subscriber error is the [`Discard`] sentinel.
pub fn is_discard(error: &SubscriberError) -> bool {
    error.is::<Discard>()
}

/// A message handed to a subscriber together with its delivery metadata.
#[derive(Debug, Clone)]
pub struct Delivery<M> {
    /// Store-assigned event id.
    pub event_id: i64,
    /// The idempotency key the event was published with.
    pub key: String,
    /// Number of earlier failed attempts.
    pub attempt: u32,
    /// Headers published with the message.
    pub headers: Headers,
    /// When the event was published.
    pub created_at: DateTime<Utc>,
    /// The message itself.
    pub message: M,
}

/// Handles the messages of a topic.
///
/// Each event is delivered to one randomly chosen subscriber of the topic. Delivery is
/// at-least-once, so subscribers should be idempotent.
#[async_trait]
pub trait Subscriber<M: Message>: Send + Sync + 'static {
    /// Reacts to a delivered message.
    async fn on_message(&self, delivery: Delivery<M>) -> Result<(), SubscriberError>;
}

#[async_trait]
impl<M, F, Fut> Subscriber<M> for F
where
    M: Message,
    F: Fn(Delivery<M>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), SubscriberError>> + Send,
{
    async fn on_message(&self, delivery: Delivery<M>) -> Result<(), SubscriberError> {
        (self)(delivery).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Boom;

    impl std::fmt::Display for Boom {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "boom")
        }
    }

    impl std::error::Error for Boom {}

    #[test]
    fn discard_is_detected() {
        let err: SubscriberError = Discard.into();
        assert!(is_discard(&err));
    }

    #[test]
    fn other_errors_are_not_discards() {
        let err: SubscriberError = Box::new(Boom);
        assert!(!is_discard(&err));
        let err: SubscriberError = "plain message".into();
        assert!(!is_discard(&err));
    }
}
