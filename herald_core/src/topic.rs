//! A `Topic` is the typed entry point of the engine: it publishes messages of one type, keeps the
//! subscribers of that type, and drives the claim -> dispatch -> outcome cycle for its events.
//!
//! Events are claimed from two places:
//!
//! - the [`Listener`] receive loop, once per notification for this topic;
//! - the backlog reconciler, a per-topic task that drains eligible events on a jittered timer so
//!   delivery never depends on notifications arriving.

use crate::backoff::{Backoff, jittered};
use crate::config::{ReconcilerConfig, TopicConfig};
use crate::event::{DeadLetter, Event, EventStats, FailOutcome, NewEvent, Notification, TopicRecord};
use crate::listener::{HandlerError, Listener, ListenerError, NotificationHandler};
use crate::message::{Headers, Message, decode_headers, decode_message, encode_headers, encode_message};
use crate::store::{EventStore, StoreError};
use crate::subscriber::{Delivery, Subscriber, SubscriberError, is_discard};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Errors that can occur when using a [`Topic`].
#[derive(Debug, thiserror::Error)]
pub enum TopicError {
    /// The topic was closed.
    #[error("topic is closed")]
    Closed,
    /// The idempotency key is already used within the topic.
    #[error("duplicate event: idempotency key '{0}' already exists")]
    DuplicateEvent(String),
    /// The requested item does not exist.
    #[error("not found")]
    NotFound,
    /// The store failed.
    #[error("store error: {0}")]
    Store(StoreError),
    /// Registering with the listener failed.
    #[error("listener error: {0}")]
    Listener(#[from] ListenerError),
    /// The message or its headers could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StoreError> for TopicError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound => TopicError::NotFound,
            StoreError::DuplicateEvent(key) => TopicError::DuplicateEvent(key),
            other => TopicError::Store(other),
        }
    }
}

/// Result of one claim and dispatch cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Nothing was claimed: no subscriber, or no eligible event.
    Idle,
    /// The subscriber succeeded.
    Succeeded,
    /// The subscriber discarded the event.
    Discarded,
    /// The subscriber failed and the event will be retried.
    Retrying,
    /// The subscriber failed for the last time and the event was dead-lettered.
    DeadLettered,
    /// The subscriber failed for the last time.
    Failed,
}

impl ProcessOutcome {
    /// Whether an event was claimed and dealt with without a failure.
    pub fn is_success(&self) -> bool {
        matches!(self, ProcessOutcome::Succeeded | ProcessOutcome::Discarded)
    }
}

impl From<FailOutcome> for ProcessOutcome {
    fn from(outcome: FailOutcome) -> Self {
        match outcome {
            FailOutcome::Retrying => ProcessOutcome::Retrying,
            FailOutcome::DeadLettered => ProcessOutcome::DeadLettered,
            FailOutcome::Failed => ProcessOutcome::Failed,
        }
    }
}

type Subscribers<M> = RwLock<Vec<Arc<dyn Subscriber<M>>>>;

/// State shared between the topic handle, the listener callback and the reconciler task.
struct TopicInner<M: Message> {
    record: TopicRecord,
    store: Arc<dyn EventStore>,
    subscribers: Subscribers<M>,
    /// Cancelled when the topic is closed or dropped.
    token: CancellationToken,
}

impl<M: Message> TopicInner<M> {
    /// Picks one subscriber uniformly at random. The read lock is released before dispatch.
    async fn pick_subscriber(&self) -> Option<Arc<dyn Subscriber<M>>> {
        self.subscribers
            .read()
            .await
            .choose(&mut rand::thread_rng())
            .cloned()
    }

    async fn process_next(&self) -> Result<ProcessOutcome, TopicError> {
        let Some(subscriber) = self.pick_subscriber().await else {
            return Ok(ProcessOutcome::Idle);
        };

        let event = match self.store.claim_next_event(self.record.id).await {
            Ok(event) => event,
            Err(StoreError::NotFound) => return Ok(ProcessOutcome::Idle),
            Err(e) => return Err(e.into()),
        };
        debug!(
            "Claimed event {} ('{}') on topic '{}' (attempt {})",
            event.id, event.idempotency_key, self.record.config.name, event.attempts
        );

        let delivery = match to_delivery::<M>(&event) {
            Ok(delivery) => delivery,
            Err(e) => {
                warn!(
                    "Event {} on topic '{}' could not be deserialized: {}",
                    event.id, self.record.config.name, e
                );
                let message = format!("failed to deserialize message: {}", e);
                return self.report_failure(&event, &message).await;
            }
        };

        let result = subscriber.on_message(delivery).await;
        self.report(&event, result).await
    }

    async fn report(
        &self,
        event: &Event,
        result: Result<(), SubscriberError>,
    ) -> Result<ProcessOutcome, TopicError> {
        match result {
            Ok(()) => {
                if !self.store.complete_event(event.id).await? {
                    warn!(
                        "Event {} on topic '{}' was no longer active when completed",
                        event.id, self.record.config.name
                    );
                }
                debug!("Event {} delivered", event.id);
                Ok(ProcessOutcome::Succeeded)
            }
            Err(e) if is_discard(&e) => {
                self.store.discard_event(event.id).await?;
                debug!("Event {} discarded by subscriber", event.id);
                Ok(ProcessOutcome::Discarded)
            }
            Err(e) => self.report_failure(event, &e.to_string()).await,
        }
    }

    async fn report_failure(
        &self,
        event: &Event,
        error_message: &str,
    ) -> Result<ProcessOutcome, TopicError> {
        let outcome = self.store.fail_event(event.id, error_message).await?;
        let name = &self.record.config.name;
        match outcome {
            FailOutcome::Retrying => warn!(
                "Event {} on topic '{}' failed (attempt {}/{}): {}. Retrying later",
                event.id,
                name,
                event.attempts + 1,
                self.record.config.max_retries + 1,
                error_message
            ),
            FailOutcome::DeadLettered => error!(
                "Event {} on topic '{}' failed after {} attempts: {}. Sent to dead letters",
                event.id,
                name,
                event.attempts + 1,
                error_message
            ),
            FailOutcome::Failed => error!(
                "Event {} on topic '{}' failed after {} attempts: {}",
                event.id,
                name,
                event.attempts + 1,
                error_message
            ),
        }
        Ok(outcome.into())
    }
}

fn to_delivery<M: Message>(event: &Event) -> Result<Delivery<M>, serde_json::Error> {
    Ok(Delivery {
        event_id: event.id,
        key: event.idempotency_key.clone(),
        attempt: event.attempts,
        headers: decode_headers(&event.headers)?,
        created_at: event.created_at,
        message: decode_message(&event.message)?,
    })
}

#[async_trait]
impl<M: Message> NotificationHandler for TopicInner<M> {
    async fn notified(&self, notification: Notification) -> Result<(), HandlerError> {
        if notification.topic != self.record.id || self.token.is_cancelled() {
            return Ok(());
        }
        let outcome = self.process_next().await?;
        debug!(
            "Notification for event {} on topic '{}' processed: {:?}",
            notification.id, self.record.config.name, outcome
        );
        Ok(())
    }
}

/// Claims and processes events on a jittered timer. A successful event is followed immediately
/// by the next claim; a failure backs off the next tick.
async fn reconcile<M: Message>(
    inner: Arc<TopicInner<M>>,
    config: ReconcilerConfig,
    token: CancellationToken,
) {
    let mut backoff = Backoff::new(config.interval, config.max_backoff);

    loop {
        let delay = jittered(backoff.current(), config.jitter);
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        loop {
            let result = tokio::select! {
                _ = token.cancelled() => return,
                result = inner.process_next() => result,
            };
            match result {
                Ok(outcome) if outcome.is_success() => {
                    backoff.reset();
                }
                Ok(ProcessOutcome::Idle) => {
                    backoff.reset();
                    break;
                }
                Ok(outcome) => {
                    debug!(
                        "Backlog of topic '{}' backing off after {:?}",
                        inner.record.config.name, outcome
                    );
                    backoff.next_failure();
                    break;
                }
                Err(e) => {
                    error!(
                        "Backlog processing failed for topic '{}': {}",
                        inner.record.config.name, e
                    );
                    backoff.next_failure();
                    break;
                }
            }
        }
    }
}

/// A named, typed channel of events with its own retry and dead-letter configuration.
///
/// Dropping a topic without [`close`](Self::close) stops its reconciler and ignores further
/// notifications; the listener registration is removed in the background.
///
/// ```ignore
/// let token = CancellationToken::new();
/// let listener = Arc::new(Listener::new(PgNotificationSource::new(pool.clone())));
/// listener.start(&token).await?;
///
/// let orders = Topic::<OrderPlaced>::new(store.clone(), listener.clone(), &token).await?;
/// orders
///     .subscribe(|delivery: Delivery<OrderPlaced>| async move {
///         ship(delivery.message).await?;
///         Ok(())
///     })
///     .await?;
/// orders.publish(&OrderPlaced { order_id, total: 42 }).await?;
/// ```
pub struct Topic<M: Message> {
    inner: Arc<TopicInner<M>>,
    listener: Arc<Listener>,
    token: CancellationToken,
    closed: AtomicBool,
}

impl<M: Message> Topic<M> {
    /// Creates the topic of `M` with default configuration.
    pub async fn new<S: EventStore>(
        store: Arc<S>,
        listener: Arc<Listener>,
        token: &CancellationToken,
    ) -> Result<Self, TopicError> {
        Self::with_config(
            store,
            listener,
            TopicConfig::for_message::<M>(),
            ReconcilerConfig::default(),
            token,
        )
        .await
    }

    /// Creates (or refreshes) the topic in the store, registers it with the listener and starts
    /// its backlog reconciler. The reconciler stops when `token` is cancelled or the topic is
    /// closed.
    pub async fn with_config<S: EventStore>(
        store: Arc<S>,
        listener: Arc<Listener>,
        config: TopicConfig,
        reconciler: ReconcilerConfig,
        token: &CancellationToken,
    ) -> Result<Self, TopicError> {
        let store: Arc<dyn EventStore> = store;
        let record = store.create_or_update_topic(&config).await?;
        let token = token.child_token();
        let inner = Arc::new(TopicInner {
            record,
            store,
            subscribers: RwLock::new(Vec::new()),
            token: token.clone(),
        });

        listener.listen(inner.record.id, inner.clone()).await?;

        tokio::spawn(reconcile(inner.clone(), reconciler, token.clone()));

        info!(
            "Topic '{}' registered with id {}",
            inner.record.config.name, inner.record.id
        );

        Ok(Self {
            inner,
            listener,
            token,
            closed: AtomicBool::new(false),
        })
    }

    /// The store-assigned topic id.
    pub fn id(&self) -> i64 {
        self.inner.record.id
    }

    /// The topic name.
    pub fn name(&self) -> &str {
        &self.inner.record.config.name
    }

    /// The configuration the topic was registered with.
    pub fn config(&self) -> &TopicConfig {
        &self.inner.record.config
    }

    /// Publishes a message without headers. Returns the event id.
    pub async fn publish(&self, message: &M) -> Result<i64, TopicError> {
        self.publish_with_headers(message, Headers::new()).await
    }

    /// Publishes a message with headers. Returns the event id once the insert has committed.
    pub async fn publish_with_headers(
        &self,
        message: &M,
        headers: Headers,
    ) -> Result<i64, TopicError> {
        let event = NewEvent {
            topic_id: self.id(),
            idempotency_key: message.idempotency_key(),
            message: encode_message(message)?,
            headers: encode_headers(&headers)?,
        };
        let key = event.idempotency_key.clone();
        let id = self.inner.store.publish_event(event).await?;
        debug!("Published event {} ('{}') to topic '{}'", id, key, self.name());
        Ok(id)
    }

    /// Adds a subscriber. Every event goes to one randomly chosen subscriber.
    pub async fn subscribe(&self, subscriber: impl Subscriber<M>) -> Result<(), TopicError> {
        if self.is_closed() {
            return Err(TopicError::Closed);
        }
        self.inner.subscribers.write().await.push(Arc::new(subscriber));
        Ok(())
    }

    /// Number of registered subscribers.
    pub async fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().await.len()
    }

    /// Claims and dispatches one event right away, independent of notifications and the
    /// reconciler schedule.
    pub async fn process_next(&self) -> Result<ProcessOutcome, TopicError> {
        if self.is_closed() {
            return Err(TopicError::Closed);
        }
        self.inner.process_next().await
    }

    /// Event counters of this topic.
    pub async fn stats(&self, stuck_threshold: Duration) -> Result<EventStats, TopicError> {
        Ok(self
            .inner
            .store
            .get_event_stats(self.id(), stuck_threshold)
            .await?)
    }

    /// Reverts up to `max_count` active events not updated for `older_than` to pending.
    pub async fn clear_stuck_events(
        &self,
        max_count: u32,
        older_than: Duration,
    ) -> Result<u64, TopicError> {
        let cleared = self
            .inner
            .store
            .clear_stuck_events(self.id(), max_count, older_than)
            .await?;
        if cleared > 0 {
            info!("Cleared {} stuck events on topic '{}'", cleared, self.name());
        }
        Ok(cleared)
    }

    /// Re-enqueues a dead-lettered event. Fails with [`TopicError::NotFound`] if `key` is not
    /// dead-lettered.
    pub async fn retry_dead_letter(&self, key: &str) -> Result<(), TopicError> {
        self.inner.store.retry_dead_letter(self.id(), key).await?;
        info!("Dead letter '{}' on topic '{}' re-enqueued", key, self.name());
        Ok(())
    }

    /// The dead letters of this topic, oldest first.
    pub async fn dead_letters(&self, limit: u32) -> Result<Vec<DeadLetter>, TopicError> {
        Ok(self.inner.store.list_dead_letters(self.id(), limit).await?)
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Unregisters the topic from the listener and stops its reconciler. Dispatches in flight
    /// are not drained.
    pub async fn close(&self) -> Result<(), TopicError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(TopicError::Closed);
        }
        self.token.cancel();
        self.listener.unlisten(self.id()).await?;
        info!("Topic '{}' closed", self.name());
        Ok(())
    }
}

impl<M: Message> Drop for Topic<M> {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.token.cancel();

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let listener = self.listener.clone();
        let topic_id = self.id();
        let name = self.name().to_string();
        handle.spawn(async move {
            if let Err(e) = listener.unlisten(topic_id).await {
                debug!("Dropped topic '{}' was not registered: {}", name, e);
            }
        });
    }
}
