mod common;

use async_trait::async_trait;
use herald_core::prelude::*;
use herald_derive::Message;
use herald_pg::{PgEventStore, PgNotificationSource};
use serial_test::serial;
use sqlx::PgPool;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, Message)]
struct ParcelShipped {
    #[message(key)]
    parcel_id: Uuid,
    carrier: String,
}

fn parcel() -> ParcelShipped {
    ParcelShipped {
        parcel_id: Uuid::new_v4(),
        carrier: "post".to_string(),
    }
}

struct Recorder(mpsc::UnboundedSender<Delivery<ParcelShipped>>);

#[async_trait]
impl Subscriber<ParcelShipped> for Recorder {
    async fn on_message(&self, delivery: Delivery<ParcelShipped>) -> Result<(), SubscriberError> {
        let _ = self.0.send(delivery);
        Ok(())
    }
}

fn idle_reconciler() -> ReconcilerConfig {
    ReconcilerConfig {
        interval: Duration::from_secs(3600),
        jitter: 0.0,
        max_backoff: Duration::from_secs(3600),
    }
}

async fn setup(pool: &PgPool) -> (Arc<PgEventStore>, Arc<Listener>, CancellationToken) {
    let channel = format!("herald_test_{}", Uuid::new_v4().simple());
    let store = Arc::new(PgEventStore::with_channel(pool.clone(), channel.clone()));
    store
        .setup_trigger()
        .await
        .expect("Failed to set up trigger");

    let token = CancellationToken::new();
    let listener = Arc::new(Listener::new(PgNotificationSource::with_channel(
        pool.clone(),
        channel,
    )));
    listener.start(&token).await.expect("Failed to start listener");
    // Give the listener time to issue LISTEN
    tokio::time::sleep(Duration::from_millis(300)).await;

    (store, listener, token)
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Delivery<ParcelShipped>>) -> Delivery<ParcelShipped> {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("Timed out waiting for a delivery")
        .expect("Channel closed")
}

#[tokio::test]
#[serial]
async fn test_published_event_is_delivered_through_notify() {
    let Some(pool) = common::fresh_pool().await else {
        return;
    };
    let (store, listener, token) = setup(&pool).await;

    let topic: Topic<ParcelShipped> = Topic::with_config(
        store,
        listener.clone(),
        TopicConfig::for_message::<ParcelShipped>(),
        idle_reconciler(),
        &token,
    )
    .await
    .unwrap();
    assert_eq!(topic.name(), "parcel-shipped");

    let (tx, mut rx) = mpsc::unbounded_channel();
    topic.subscribe(Recorder(tx)).await.unwrap();

    let message = parcel();
    let event_id = topic.publish(&message).await.unwrap();

    let delivery = next(&mut rx).await;
    assert_eq!(delivery.event_id, event_id);
    assert_eq!(delivery.key, message.parcel_id.to_string());
    assert_eq!(delivery.message, message);

    topic.close().await.unwrap();
    listener.shutdown().await.unwrap();
}

/// Fails the first delivery, succeeds afterwards.
struct FailsOnce {
    calls: AtomicUsize,
    deliveries: mpsc::UnboundedSender<Delivery<ParcelShipped>>,
}

#[async_trait]
impl Subscriber<ParcelShipped> for FailsOnce {
    async fn on_message(&self, delivery: Delivery<ParcelShipped>) -> Result<(), SubscriberError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let _ = self.deliveries.send(delivery);
        if call == 0 {
            return Err("carrier unavailable".into());
        }
        Ok(())
    }
}

#[tokio::test]
#[serial]
async fn test_retried_dead_letter_is_delivered_through_notify() {
    let Some(pool) = common::fresh_pool().await else {
        return;
    };
    let (store, listener, token) = setup(&pool).await;

    let topic: Topic<ParcelShipped> = Topic::with_config(
        store,
        listener.clone(),
        TopicConfig::for_message::<ParcelShipped>().with_max_retries(0),
        idle_reconciler(),
        &token,
    )
    .await
    .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    topic
        .subscribe(FailsOnce {
            calls: AtomicUsize::new(0),
            deliveries: tx,
        })
        .await
        .unwrap();

    let message = parcel();
    let key = message.parcel_id.to_string();
    topic.publish(&message).await.unwrap();
    assert_eq!(next(&mut rx).await.attempt, 0);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let dead_letters = topic.dead_letters(10).await.unwrap();
    assert_eq!(dead_letters.len(), 1);
    assert_eq!(dead_letters[0].error_message, "carrier unavailable");

    topic.retry_dead_letter(&key).await.unwrap();
    let redelivered = next(&mut rx).await;
    assert_eq!(redelivered.key, key);
    assert_eq!(redelivered.attempt, 0);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stats = topic.stats(Duration::from_secs(60)).await.unwrap();
    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.dead_letters, 0);

    topic.close().await.unwrap();
    listener.shutdown().await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_reconciler_delivers_without_trigger() {
    let Some(pool) = common::fresh_pool().await else {
        return;
    };
    let token = CancellationToken::new();
    // No trigger, so nothing is ever notified
    let store = Arc::new(PgEventStore::new(pool.clone()));
    let listener = Arc::new(Listener::new(PgNotificationSource::new(pool.clone())));

    let topic: Topic<ParcelShipped> = Topic::with_config(
        store,
        listener,
        TopicConfig::for_message::<ParcelShipped>(),
        ReconcilerConfig {
            interval: Duration::from_millis(50),
            jitter: 0.2,
            max_backoff: Duration::from_millis(200),
        },
        &token,
    )
    .await
    .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    topic.subscribe(Recorder(tx)).await.unwrap();
    let message = parcel();
    topic.publish(&message).await.unwrap();

    assert_eq!(next(&mut rx).await.message, message);
    token.cancel();
}
