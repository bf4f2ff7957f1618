use crate::notifier::InMemoryNotifier;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use herald_core::config::TopicConfig;
use herald_core::event::{
    DeadLetter, Event, EventState, EventStats, FailOutcome, NewEvent, Notification, TopicRecord,
};
use herald_core::retry::{FailureDecision, decide};
use herald_core::store::{EventStore, StoreError};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// The in-memory data store.
#[derive(Debug, Default)]
struct EventStoreData {
    next_topic_id: i64,
    next_event_id: i64,
    topics: HashMap<i64, TopicConfig>,
    topic_ids: HashMap<String, i64>,
    /// Ordered by id, which is also creation order.
    events: BTreeMap<i64, Event>,
    keys: HashMap<(i64, String), i64>,
    dead_letters: HashMap<(i64, String), DeadLetter>,
}

impl EventStoreData {
    fn active_event(&mut self, event_id: i64) -> Option<&mut Event> {
        self.events
            .get_mut(&event_id)
            .filter(|event| event.state == EventState::Active)
    }
}

/// An in-memory event store.
///
/// This event store is useful for testing and development purposes. It is not recommended for
/// production use, as it does not persist events to any durable storage. A single mutex makes
/// every operation atomic, which is what the row locks of a database provide.
#[derive(Clone, Debug, Default)]
pub struct InMemoryEventStore {
    data: Arc<Mutex<EventStoreData>>,
    notifier: Option<InMemoryNotifier>,
}

/// Retry delays are clamped to about a century, like the postgres store does.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn retry_at(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay.min(MAX_RETRY_DELAY))
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn older_than(timestamp: DateTime<Utc>, now: DateTime<Utc>, age: Duration) -> bool {
    let age = chrono::Duration::from_std(age).unwrap_or(chrono::Duration::MAX);
    match now.checked_sub_signed(age) {
        Some(cutoff) => timestamp <= cutoff,
        None => false,
    }
}

impl InMemoryEventStore {
    /// Creates a store that emits no notifications. Only the backlog reconciler delivers events.
    pub fn new() -> Self {
        log::debug!("Creating a new InMemoryEventStore");
        Self::default()
    }

    /// Creates a store that notifies listeners connected to `notifier` on publish.
    pub fn with_notifier(notifier: InMemoryNotifier) -> Self {
        log::debug!("Creating a new InMemoryEventStore with notifications");
        Self {
            data: Arc::default(),
            notifier: Some(notifier),
        }
    }

    /// Exposes the notifier, if any.
    pub fn notifier(&self) -> Option<&InMemoryNotifier> {
        self.notifier.as_ref()
    }

    /// Returns a copy of an event.
    pub async fn get_event(&self, event_id: i64) -> Option<Event> {
        self.data.lock().await.events.get(&event_id).cloned()
    }

    fn notify(&self, notification: Notification) {
        if let Some(notifier) = &self.notifier {
            notifier.notify(notification);
        }
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn create_or_update_topic(&self, config: &TopicConfig) -> Result<TopicRecord, StoreError> {
        let mut data = self.data.lock().await;
        let id = match data.topic_ids.get(&config.name) {
            Some(id) => *id,
            None => {
                data.next_topic_id += 1;
                let id = data.next_topic_id;
                data.topic_ids.insert(config.name.clone(), id);
                id
            }
        };
        data.topics.insert(id, config.clone());
        log::debug!("Topic '{}' stored with id {}", config.name, id);
        Ok(TopicRecord {
            id,
            config: config.clone(),
        })
    }

    async fn publish_event(&self, event: NewEvent) -> Result<i64, StoreError> {
        let notification = {
            let mut data = self.data.lock().await;
            if !data.topics.contains_key(&event.topic_id) {
                return Err(StoreError::NotFound);
            }
            let key = (event.topic_id, event.idempotency_key.clone());
            if data.keys.contains_key(&key) {
                return Err(StoreError::DuplicateEvent(event.idempotency_key));
            }

            data.next_event_id += 1;
            let id = data.next_event_id;
            let now = Utc::now();
            data.keys.insert(key, id);
            data.events.insert(
                id,
                Event {
                    id,
                    topic_id: event.topic_id,
                    idempotency_key: event.idempotency_key,
                    state: EventState::Pending,
                    message: event.message,
                    headers: event.headers,
                    attempts: 0,
                    next_attempt_at: None,
                    created_at: now,
                    updated_at: now,
                },
            );
            Notification {
                id,
                topic: event.topic_id,
            }
        };

        // Like a database, notify only once the insert is visible
        self.notify(notification);
        Ok(notification.id)
    }

    async fn claim_next_event(&self, topic_id: i64) -> Result<Event, StoreError> {
        let mut data = self.data.lock().await;
        let now = Utc::now();
        let event = data
            .events
            .values_mut()
            .find(|event| {
                event.topic_id == topic_id
                    && event.state == EventState::Pending
                    && event.next_attempt_at.is_none_or(|at| at <= now)
            })
            .ok_or(StoreError::NotFound)?;

        event.state = EventState::Active;
        event.updated_at = now;
        Ok(event.clone())
    }

    async fn complete_event(&self, event_id: i64) -> Result<bool, StoreError> {
        let mut data = self.data.lock().await;
        match data.active_event(event_id) {
            Some(event) => {
                event.state = EventState::Succeeded;
                event.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn fail_event(
        &self,
        event_id: i64,
        error_message: &str,
    ) -> Result<FailOutcome, StoreError> {
        let mut data = self.data.lock().await;
        let (topic_id, attempts) = match data.active_event(event_id) {
            Some(event) => (event.topic_id, event.attempts),
            None => return Err(StoreError::NotFound),
        };
        let decision = match data.topics.get(&topic_id) {
            Some(config) => decide(config, attempts),
            None => return Err(StoreError::NotFound),
        };

        let now = Utc::now();
        let Some(event) = data.active_event(event_id) else {
            return Err(StoreError::NotFound);
        };
        event.updated_at = now;

        match decision {
            FailureDecision::Retry { delay } => {
                event.state = EventState::Pending;
                event.attempts += 1;
                event.next_attempt_at = Some(retry_at(now, delay));
                Ok(FailOutcome::Retrying)
            }
            FailureDecision::DeadLetter => {
                event.state = EventState::Failed;
                let key = event.idempotency_key.clone();
                data.dead_letters.insert(
                    (topic_id, key.clone()),
                    DeadLetter {
                        topic_id,
                        idempotency_key: key,
                        event_id,
                        error_message: error_message.to_string(),
                        created_at: now,
                    },
                );
                Ok(FailOutcome::DeadLettered)
            }
            FailureDecision::Fail => {
                event.state = EventState::Failed;
                Ok(FailOutcome::Failed)
            }
        }
    }

    async fn discard_event(&self, event_id: i64) -> Result<bool, StoreError> {
        let mut data = self.data.lock().await;
        let Some(event) = data.active_event(event_id) else {
            return Ok(false);
        };
        let key = (event.topic_id, event.idempotency_key.clone());
        data.keys.remove(&key);
        data.events.remove(&event_id);
        Ok(true)
    }

    async fn get_event_stats(
        &self,
        topic_id: i64,
        stuck_threshold: Duration,
    ) -> Result<EventStats, StoreError> {
        let data = self.data.lock().await;
        let now = Utc::now();
        let mut stats = EventStats::default();

        for event in data.events.values().filter(|e| e.topic_id == topic_id) {
            match event.state {
                EventState::Pending => stats.pending += 1,
                EventState::Active => {
                    stats.active += 1;
                    if older_than(event.updated_at, now, stuck_threshold) {
                        stats.stuck += 1;
                    }
                }
                EventState::Succeeded => stats.succeeded += 1,
                EventState::Failed => stats.failed += 1,
            }
        }
        stats.dead_letters = data
            .dead_letters
            .values()
            .filter(|d| d.topic_id == topic_id)
            .count() as u64;

        Ok(stats)
    }

    async fn clear_stuck_events(
        &self,
        topic_id: i64,
        max_count: u32,
        older_than_age: Duration,
    ) -> Result<u64, StoreError> {
        let mut data = self.data.lock().await;
        let now = Utc::now();

        let mut stuck: Vec<&mut Event> = data
            .events
            .values_mut()
            .filter(|event| {
                event.topic_id == topic_id
                    && event.state == EventState::Active
                    && older_than(event.updated_at, now, older_than_age)
            })
            .collect();
        stuck.sort_by_key(|event| event.updated_at);

        let mut cleared = 0;
        for event in stuck.into_iter().take(max_count as usize) {
            event.state = EventState::Pending;
            event.next_attempt_at = None;
            event.updated_at = now;
            cleared += 1;
        }
        Ok(cleared)
    }

    async fn cleanup_old_dead_letters(&self) -> Result<u64, StoreError> {
        let mut data = self.data.lock().await;
        let now = Utc::now();
        let EventStoreData {
            topics,
            dead_letters,
            ..
        } = &mut *data;

        let before = dead_letters.len();
        dead_letters.retain(|(topic_id, _), dead_letter| match topics.get(topic_id) {
            Some(config) => !older_than(dead_letter.created_at, now, config.dlq_max_age),
            None => true,
        });
        Ok((before - dead_letters.len()) as u64)
    }

    async fn retry_dead_letter(
        &self,
        topic_id: i64,
        idempotency_key: &str,
    ) -> Result<(), StoreError> {
        let notification = {
            let mut data = self.data.lock().await;
            let dead_letter = data
                .dead_letters
                .remove(&(topic_id, idempotency_key.to_string()))
                .ok_or(StoreError::NotFound)?;

            let event = data
                .events
                .get_mut(&dead_letter.event_id)
                .ok_or(StoreError::NotFound)?;
            event.state = EventState::Pending;
            event.attempts = 0;
            event.next_attempt_at = None;
            event.updated_at = Utc::now();
            Notification {
                id: event.id,
                topic: topic_id,
            }
        };

        self.notify(notification);
        Ok(())
    }

    async fn list_dead_letters(
        &self,
        topic_id: i64,
        limit: u32,
    ) -> Result<Vec<DeadLetter>, StoreError> {
        let data = self.data.lock().await;
        let mut dead_letters: Vec<DeadLetter> = data
            .dead_letters
            .values()
            .filter(|d| d.topic_id == topic_id)
            .cloned()
            .collect();
        dead_letters.sort_by_key(|d| (d.created_at, d.event_id));
        dead_letters.truncate(limit as usize);
        Ok(dead_letters)
    }
}
