//! Records exchanged between the engine and the event store.

use crate::config::TopicConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A topic as persisted by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicRecord {
    /// Store-assigned identifier.
    pub id: i64,
    /// The configuration currently stored for the topic.
    pub config: TopicConfig,
}

/// Lifecycle state of an event.
///
/// An event moves `pending -> active -> {pending | succeeded | failed}`. Dead-lettered events stay
/// `failed` and get a separate dead letter record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventState {
    /// Eligible for claim once its retry delay, if any, has elapsed.
    Pending,
    /// Claimed by exactly one process and being dispatched.
    Active,
    /// Delivered successfully. Terminal.
    Succeeded,
    /// Retries exhausted. Terminal.
    Failed,
}

impl EventState {
    /// The name of the state as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventState::Pending => "pending",
            EventState::Active => "active",
            EventState::Succeeded => "succeeded",
            EventState::Failed => "failed",
        }
    }
}

impl fmt::Display for EventState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown event state.
#[derive(Debug, thiserror::Error)]
#[error("unknown event state '{0}'")]
pub struct UnknownEventState(pub String);

impl FromStr for EventState {
    type Err = UnknownEventState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EventState::Pending),
            "active" => Ok(EventState::Active),
            "succeeded" => Ok(EventState::Succeeded),
            "failed" => Ok(EventState::Failed),
            other => Err(UnknownEventState(other.to_string())),
        }
    }
}

/// An event to be inserted by [`EventStore::publish_event`](crate::store::EventStore::publish_event).
#[derive(Debug, Clone)]
pub struct NewEvent {
    /// The topic the event belongs to.
    pub topic_id: i64,
    /// Unique per topic.
    pub idempotency_key: String,
    /// Serialized message.
    pub message: Vec<u8>,
    /// Serialized headers.
    pub headers: Vec<u8>,
}

/// An event as persisted by the store.
#[derive(Debug, Clone)]
pub struct Event {
    /// Store-assigned, monotonically increasing identifier.
    pub id: i64,
    /// The topic the event belongs to.
    pub topic_id: i64,
    /// The natural identifier supplied by the publisher.
    pub idempotency_key: String,
    /// Current lifecycle state.
    pub state: EventState,
    /// Serialized message.
    pub message: Vec<u8>,
    /// Serialized headers.
    pub headers: Vec<u8>,
    /// Number of failed attempts so far.
    pub attempts: u32,
    /// The event is not claimable before this instant.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// When the event was published.
    pub created_at: DateTime<Utc>,
    /// When the event last changed state.
    pub updated_at: DateTime<Utc>,
}

/// Result of reporting a failed delivery to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// The event went back to `pending` and will be claimable after its backoff.
    Retrying,
    /// Retries exhausted; the event is `failed` and a dead letter was recorded.
    DeadLettered,
    /// Retries exhausted; the event is `failed` and dead-lettering is disabled.
    Failed,
}

/// Counters returned by [`EventStore::get_event_stats`](crate::store::EventStore::get_event_stats).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventStats {
    /// Events waiting to be claimed.
    pub pending: u64,
    /// Events currently claimed.
    pub active: u64,
    /// Events delivered successfully.
    pub succeeded: u64,
    /// Events that failed terminally.
    pub failed: u64,
    /// Dead letters recorded for the topic.
    pub dead_letters: u64,
    /// Active events whose last update is older than the stuck threshold.
    pub stuck: u64,
}

impl EventStats {
    /// Events that have not reached a terminal state yet.
    pub fn unresolved(&self) -> u64 {
        self.pending + self.active
    }
}

/// A terminally failed event retained for inspection or manual retry.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    /// The topic of the originating event.
    pub topic_id: i64,
    /// The idempotency key of the originating event.
    pub idempotency_key: String,
    /// The originating event.
    pub event_id: i64,
    /// Error reported by the last failed attempt.
    pub error_message: String,
    /// When the event was dead-lettered.
    pub created_at: DateTime<Utc>,
}

/// The payload of a store notification: "event `id` of topic `topic` changed".
///
/// Notifications are best effort. They never carry the message itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// The event that was published or re-enqueued.
    pub id: i64,
    /// The topic of that event.
    pub topic: i64,
}

impl Notification {
    /// Parses a notification payload.
    pub fn parse(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }

    /// Renders the notification payload.
    pub fn to_payload(&self) -> String {
        format!("{{\"id\":{},\"topic\":{}}}", self.id, self.topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_state_round_trips_through_its_name() {
        for state in [
            EventState::Pending,
            EventState::Active,
            EventState::Succeeded,
            EventState::Failed,
        ] {
            assert_eq!(state.as_str().parse::<EventState>().unwrap(), state);
        }
    }

    #[test]
    fn unknown_event_state_is_rejected() {
        let err = "dead".parse::<EventState>().unwrap_err();
        assert_eq!(err.to_string(), "unknown event state 'dead'");
    }

    #[test]
    fn notification_parses_store_payload() {
        let notification = Notification::parse(r#"{"id": 42, "topic": 7}"#).unwrap();
        assert_eq!(notification, Notification { id: 42, topic: 7 });
    }

    #[test]
    fn notification_payload_is_parseable() {
        let notification = Notification { id: 1, topic: 2 };
        assert_eq!(
            Notification::parse(&notification.to_payload()).unwrap(),
            notification
        );
    }

    #[test]
    fn malformed_notification_is_an_error() {
        assert!(Notification::parse("not json").is_err());
        assert!(Notification::parse(r#"{"id": "x"}"#).is_err());
    }

    #[test]
    fn unresolved_counts_pending_and_active() {
        let stats = EventStats {
            pending: 2,
            active: 1,
            succeeded: 10,
            failed: 3,
            dead_letters: 3,
            stuck: 1,
        };
        assert_eq!(stats.unresolved(), 3);
    }
}
