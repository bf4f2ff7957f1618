//! # Herald
//!
//! Durable, at-least-once publish/subscribe on top of a relational store's row locks and
//! asynchronous notifications.
//!
//! A [`Topic`](topic::Topic) publishes messages of one type into an [`EventStore`](store::EventStore)
//! and delivers each event to one of its subscribers. A single [`Listener`](listener::Listener)
//! per process turns store notifications into claims, and every topic runs a backlog reconciler
//! so that lost notifications only cost latency.

#![deny(missing_docs)]

/// Exponential backoff and jitter.
pub mod backoff;
/// Configuration types.
pub mod config;
/// Records exchanged with the store.
pub mod event;
/// The notification listener.
pub mod listener;
/// The message trait and (de)serialization helpers.
pub mod message;
/// Retry and dead-letter policy.
pub mod retry;
/// The event store contract.
pub mod store;
/// Subscribers and the discard sentinel.
pub mod subscriber;
/// Stuck-event and dead-letter maintenance.
pub mod sweeper;
/// Typed topics and the backlog reconciler.
pub mod topic;

pub use message::Message;

pub mod prelude {
    //! The prelude module for the `herald_core` crate.
    pub use super::config::{ListenerConfig, ReconcilerConfig, SweeperConfig, TopicConfig};
    pub use super::event::{
        DeadLetter, Event, EventState, EventStats, FailOutcome, NewEvent, Notification,
        TopicRecord,
    };
    pub use super::listener::{
        HandlerError, Listener, ListenerError, NotificationConnection, NotificationHandler,
        NotificationSource,
    };
    pub use super::message::{Headers, Message};
    pub use super::retry::{FailureDecision, decide, retry_delay};
    pub use super::store::{EventStore, StoreError};
    pub use super::subscriber::{Delivery, Discard, Subscriber, SubscriberError, is_discard};
    pub use super::sweeper::{SweepReport, Sweeper};
    pub use super::topic::{ProcessOutcome, Topic, TopicError};
}
