//! Periodic maintenance: recovers stuck events and removes expired dead letters.

use crate::config::SweeperConfig;
use crate::store::{EventStore, StoreError};
use log::{error, info};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Totals of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Stuck events reverted to pending, across all tracked topics.
    pub stuck_cleared: u64,
    /// Expired dead letters removed.
    pub dead_letters_removed: u64,
}

/// Reverts stuck events of the tracked topics and cleans up old dead letters.
pub struct Sweeper {
    store: Arc<dyn EventStore>,
    config: SweeperConfig,
    topics: Mutex<BTreeSet<i64>>,
}

impl Sweeper {
    /// Creates a sweeper tracking no topics.
    pub fn new<S: EventStore>(store: Arc<S>, config: SweeperConfig) -> Self {
        Self {
            store,
            config,
            topics: Mutex::new(BTreeSet::new()),
        }
    }

    /// Adds a topic whose stuck events should be recovered.
    pub async fn track(&self, topic_id: i64) {
        self.topics.lock().await.insert(topic_id);
    }

    /// Stops recovering stuck events of a topic.
    pub async fn untrack(&self, topic_id: i64) {
        self.topics.lock().await.remove(&topic_id);
    }

    /// Runs one sweep. Stops at the first store error.
    pub async fn run_once(&self) -> Result<SweepReport, StoreError> {
        let topics: Vec<i64> = self.topics.lock().await.iter().copied().collect();
        let mut report = SweepReport::default();

        for topic_id in topics {
            let cleared = self
                .store
                .clear_stuck_events(topic_id, self.config.max_count, self.config.stuck_threshold)
                .await?;
            if cleared > 0 {
                info!("Recovered {} stuck events on topic {}", cleared, topic_id);
            }
            report.stuck_cleared += cleared;
        }

        report.dead_letters_removed = self.store.cleanup_old_dead_letters().await?;
        if report.dead_letters_removed > 0 {
            info!("Removed {} expired dead letters", report.dead_letters_removed);
        }

        Ok(report)
    }

    /// Runs a sweep every `interval` until `token` is cancelled.
    pub fn spawn(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(self.config.interval) => {}
                }
                let result = tokio::select! {
                    _ = token.cancelled() => return,
                    result = self.run_once() => result,
                };
                if let Err(e) = result {
                    error!("Sweep failed: {}", e);
                }
            }
        })
    }
}
