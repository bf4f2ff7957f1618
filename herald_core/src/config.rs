//! Configuration types for topics, the listener, the backlog reconciler and the sweeper.

use crate::message::Message;
use std::time::Duration;

/// Per-topic retry and dead-letter configuration.
///
/// The configuration is upserted into the store when a [`Topic`](crate::topic::Topic) is created,
/// so the last process to start wins.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicConfig {
    /// Unique topic name, usually [`Message::topic_name`].
    pub name: String,

    /// Number of retries after the first failed attempt.
    /// Once exhausted the event is dead-lettered or marked as failed.
    pub max_retries: u32,

    /// Delay before the first retry.
    pub initial_backoff: Duration,

    /// Upper bound for the retry delay.
    pub max_backoff: Duration,

    /// Factor applied to the delay for every further retry.
    pub backoff_multiplier: f64,

    /// Whether events that exhaust their retries are recorded as dead letters.
    pub dlq_enabled: bool,

    /// Dead letters older than this are removed by the cleanup.
    pub dlq_max_age: Duration,
}

impl TopicConfig {
    /// Creates a configuration with default settings for the given topic name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            dlq_enabled: true,
            dlq_max_age: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }

    /// Creates a configuration with default settings for the topic of `M`.
    pub fn for_message<M: Message>() -> Self {
        Self::new(M::topic_name())
    }

    /// Sets the maximum number of retries.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the initial and maximum backoff.
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables dead-lettering.
    pub fn with_dlq(mut self, enabled: bool) -> Self {
        self.dlq_enabled = enabled;
        self
    }

    /// Sets the maximum age of dead letters.
    pub fn with_dlq_max_age(mut self, max_age: Duration) -> Self {
        self.dlq_max_age = max_age;
        self
    }
}

/// Reconnect behaviour of the [`Listener`](crate::listener::Listener).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    /// Delay before the first reconnect attempt.
    pub min_backoff: Duration,
    /// Reconnect delay is doubled on every failure up to this value.
    pub max_backoff: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// Schedule of the per-topic backlog reconciler.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcilerConfig {
    /// Base period between ticks when the backlog is empty.
    pub interval: Duration,
    /// Fraction of the delay that is randomised, in `[0.0, 1.0]`.
    pub jitter: f64,
    /// Upper bound of the delay after consecutive failures.
    pub max_backoff: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            jitter: 0.2,
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// Configuration of the maintenance [`Sweeper`](crate::sweeper::Sweeper).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweeperConfig {
    /// Period between sweeps.
    pub interval: Duration,
    /// Active events not updated for this long are considered stuck.
    pub stuck_threshold: Duration,
    /// Maximum number of stuck events reverted per topic and sweep.
    pub max_count: u32,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stuck_threshold: Duration::from_secs(5 * 60),
            max_count: 100,
        }
    }
}
