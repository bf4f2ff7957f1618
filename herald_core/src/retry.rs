//! Retry and dead-letter policy.
//!
//! This is pure decision logic. Stores call [`decide`] when a failure is reported and apply the
//! resulting transition atomically.

use crate::config::TopicConfig;
use std::time::Duration;

/// What to do with an event whose delivery just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    /// Put the event back to `pending`, claimable after `delay`.
    Retry {
        /// Delay before the event becomes claimable again.
        delay: Duration,
    },
    /// Mark the event as `failed` and record a dead letter.
    DeadLetter,
    /// Mark the event as `failed`.
    Fail,
}

/// Calculates the retry delay: `min(initial_backoff * multiplier^attempt, max_backoff)`.
///
/// `attempt` is the number of failures recorded before the current one (0 for the first failure).
pub fn retry_delay(config: &TopicConfig, attempt: u32) -> Duration {
    let initial_ms = config.initial_backoff.as_millis() as f64;
    let max_ms = config.max_backoff.as_millis() as f64;

    // Cap the exponent so powi cannot overflow into infinity before the min()
    let exponent = attempt.min(63) as i32;
    let multiplier = config.backoff_multiplier.max(1.0);
    let delay_ms = (initial_ms * multiplier.powi(exponent)).min(max_ms);

    if !delay_ms.is_finite() || delay_ms < 0.0 {
        return config.max_backoff;
    }

    Duration::from_millis(delay_ms as u64)
}

/// Classifies a failed delivery.
///
/// `attempts` is the number of failures recorded for the event before this one. With
/// `max_retries = k` the first `k` failures retry and the `k + 1`-th is terminal.
pub fn decide(config: &TopicConfig, attempts: u32) -> FailureDecision {
    if attempts < config.max_retries {
        FailureDecision::Retry {
            delay: retry_delay(config, attempts),
        }
    } else if config.dlq_enabled {
        FailureDecision::DeadLetter
    } else {
        FailureDecision::Fail
    }
}
