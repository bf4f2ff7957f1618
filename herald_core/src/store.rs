//! This module defines the `EventStore` trait: the atomic operations the engine needs from the
//! store that holds topics, events and dead letters. The store is the sole arbiter of claim
//! ownership.

use crate::config::TopicConfig;
use crate::event::{DeadLetter, Event, EventStats, FailOutcome, NewEvent, TopicRecord};
use async_trait::async_trait;
use std::time::Duration;

/// Errors returned by an [`EventStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Nothing matched: no eligible event to claim, or no such dead letter.
    #[error("not found")]
    NotFound,
    /// The idempotency key is already used within the topic.
    #[error("duplicate event: idempotency key '{0}' already exists")]
    DuplicateEvent(String),
    /// The store failed, e.g. connection loss or a malformed row.
    #[error("unexpected store error: {0}")]
    Unexpected(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    /// Wraps any error as [`StoreError::Unexpected`].
    pub fn unexpected<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        StoreError::Unexpected(Box::new(error))
    }
}

/// The contract between the engine and a durable store.
///
/// Every method must be atomic on the store side. Implementations decide retries through
/// [`retry::decide`](crate::retry::decide) so the policy is the same for every backend.
#[async_trait]
pub trait EventStore: Send + Sync + 'static {
    /// Creates the topic or refreshes the configuration of an existing one with the same name.
    async fn create_or_update_topic(&self, config: &TopicConfig) -> Result<TopicRecord, StoreError>;

    /// Inserts a `pending` event and emits a notification. Fails with
    /// [`StoreError::DuplicateEvent`] if the idempotency key exists for the topic.
    async fn publish_event(&self, event: NewEvent) -> Result<i64, StoreError>;

    /// Moves the oldest eligible `pending` event of the topic to `active` and returns it.
    ///
    /// Rows held by concurrent claimants are skipped rather than waited on. Fails with
    /// [`StoreError::NotFound`] when nothing is eligible.
    async fn claim_next_event(&self, topic_id: i64) -> Result<Event, StoreError>;

    /// Marks an `active` event as `succeeded`. Returns `false` if the event was not active.
    async fn complete_event(&self, event_id: i64) -> Result<bool, StoreError>;

    /// Reports a failed delivery of an `active` event and applies the retry policy.
    async fn fail_event(&self, event_id: i64, error_message: &str)
    -> Result<FailOutcome, StoreError>;

    /// Deletes an `active` event without retrying or dead-lettering it. Returns `false` if the
    /// event was not active.
    async fn discard_event(&self, event_id: i64) -> Result<bool, StoreError>;

    /// Counts the events of a topic per state, its dead letters, and the active events whose last
    /// update is older than `stuck_threshold`.
    async fn get_event_stats(
        &self,
        topic_id: i64,
        stuck_threshold: Duration,
    ) -> Result<EventStats, StoreError>;

    /// Reverts up to `max_count` active events not updated for `older_than` back to `pending`.
    /// Returns how many were reverted.
    async fn clear_stuck_events(
        &self,
        topic_id: i64,
        max_count: u32,
        older_than: Duration,
    ) -> Result<u64, StoreError>;

    /// Removes dead letters older than their topic's `dlq_max_age`. Returns how many were removed.
    async fn cleanup_old_dead_letters(&self) -> Result<u64, StoreError>;

    /// Removes a dead letter and resets its event to `pending` with a zero attempt count.
    /// Fails with [`StoreError::NotFound`] if the key is not dead-lettered.
    async fn retry_dead_letter(&self, topic_id: i64, idempotency_key: &str)
    -> Result<(), StoreError>;

    /// Lists the dead letters of a topic, oldest first.
    async fn list_dead_letters(
        &self,
        topic_id: i64,
        limit: u32,
    ) -> Result<Vec<DeadLetter>, StoreError>;
}
