//! Exponential backoff state shared by the listener reconnect loop and the backlog reconciler.

use rand::Rng;
use std::time::Duration;

/// Doubling backoff bounded by a maximum and reset to its base on success.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    current: Duration,
    max: Duration,
}

impl Backoff {
    /// Creates a backoff starting at `base` and never exceeding `max`.
    pub fn new(base: Duration, max: Duration) -> Self {
        let max = max.max(base);
        Self {
            base,
            current: base,
            max,
        }
    }

    /// The delay to wait before the next attempt.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Returns the current delay and doubles it for the next failure.
    pub fn next_failure(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    /// Goes back to the base delay.
    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

/// Randomises `delay` by up to `±factor` of its value to spread out ticks across processes.
pub fn jittered(delay: Duration, factor: f64) -> Duration {
    let delay_ms = delay.as_millis() as u64;
    let jitter_range = (delay_ms as f64 * factor.clamp(0.0, 1.0)) as u64;
    if jitter_range == 0 {
        return delay;
    }

    let mut rng = rand::thread_rng();
    let jitter: i64 = rng.gen_range(-(jitter_range as i64)..=(jitter_range as i64));
    Duration::from_millis((delay_ms as i64 + jitter).max(1) as u64)
}
