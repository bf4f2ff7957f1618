use herald_core::prelude::*;
use herald_mem::{InMemoryEventStore, InMemoryNotifier};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn new_event(topic_id: i64, key: &str) -> NewEvent {
    NewEvent {
        topic_id,
        idempotency_key: key.to_string(),
        message: b"{}".to_vec(),
        headers: Vec::new(),
    }
}

async fn setup(config: TopicConfig) -> (Arc<InMemoryEventStore>, i64) {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = Arc::new(InMemoryEventStore::new());
    let topic = store
        .create_or_update_topic(&config)
        .await
        .expect("Failed to create topic");
    (store, topic.id)
}

fn fast_retries(name: &str) -> TopicConfig {
    TopicConfig::new(name).with_backoff(Duration::ZERO, Duration::ZERO)
}

#[tokio::test]
async fn test_topic_upsert_keeps_id_and_refreshes_config() {
    let (store, id) = setup(TopicConfig::new("orders")).await;

    let updated = store
        .create_or_update_topic(&TopicConfig::new("orders").with_max_retries(9))
        .await
        .unwrap();
    assert_eq!(updated.id, id);
    assert_eq!(updated.config.max_retries, 9);

    let other = store
        .create_or_update_topic(&TopicConfig::new("invoices"))
        .await
        .unwrap();
    assert_ne!(other.id, id);
}

#[tokio::test]
async fn test_publish_to_unknown_topic_fails() {
    let (store, id) = setup(TopicConfig::new("orders")).await;
    let result = store.publish_event(new_event(id + 100, "a")).await;
    assert!(matches!(result, Err(StoreError::NotFound)));
}

#[tokio::test]
async fn test_duplicate_key_is_rejected_per_topic() {
    let (store, orders) = setup(TopicConfig::new("orders")).await;
    let invoices = store
        .create_or_update_topic(&TopicConfig::new("invoices"))
        .await
        .unwrap()
        .id;

    store.publish_event(new_event(orders, "k")).await.unwrap();
    let duplicate = store.publish_event(new_event(orders, "k")).await;
    assert!(matches!(duplicate, Err(StoreError::DuplicateEvent(key)) if key == "k"));

    // The same key on another topic is a different event
    store.publish_event(new_event(invoices, "k")).await.unwrap();

    let stats = store.get_event_stats(orders, Duration::from_secs(60)).await.unwrap();
    assert_eq!(stats.pending, 1);
}

#[tokio::test]
async fn test_claims_are_oldest_first() {
    let (store, id) = setup(TopicConfig::new("orders")).await;
    let first = store.publish_event(new_event(id, "a")).await.unwrap();
    let second = store.publish_event(new_event(id, "b")).await.unwrap();

    let claimed = store.claim_next_event(id).await.unwrap();
    assert_eq!(claimed.id, first);
    assert_eq!(claimed.state, EventState::Active);
    assert_eq!(claimed.attempts, 0);
    assert_eq!(store.claim_next_event(id).await.unwrap().id, second);
    assert!(matches!(
        store.claim_next_event(id).await,
        Err(StoreError::NotFound)
    ));
}

#[tokio::test]
async fn test_concurrent_claims_never_share_an_event() {
    let (store, id) = setup(TopicConfig::new("orders")).await;
    for i in 0..50 {
        store
            .publish_event(new_event(id, &format!("key-{}", i)))
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Ok(event) = store.claim_next_event(id).await {
                claimed.push(event.id);
                tokio::task::yield_now().await;
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    let unique: HashSet<i64> = all.iter().copied().collect();
    assert_eq!(all.len(), 50);
    assert_eq!(unique.len(), 50);
}

#[tokio::test]
async fn test_complete_only_applies_to_active_events() {
    let (store, id) = setup(TopicConfig::new("orders")).await;
    let event_id = store.publish_event(new_event(id, "a")).await.unwrap();

    assert!(!store.complete_event(event_id).await.unwrap());
    store.claim_next_event(id).await.unwrap();
    assert!(store.complete_event(event_id).await.unwrap());
    assert!(!store.complete_event(event_id).await.unwrap());

    let stats = store.get_event_stats(id, Duration::from_secs(60)).await.unwrap();
    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.unresolved(), 0);
}

#[tokio::test]
async fn test_failures_retry_then_dead_letter() {
    let (store, id) = setup(fast_retries("orders").with_max_retries(2)).await;
    let event_id = store.publish_event(new_event(id, "a")).await.unwrap();

    for expected_attempts in 0..2 {
        let event = store.claim_next_event(id).await.unwrap();
        assert_eq!(event.attempts, expected_attempts);
        let outcome = store.fail_event(event_id, "boom").await.unwrap();
        assert_eq!(outcome, FailOutcome::Retrying);
    }

    let event = store.claim_next_event(id).await.unwrap();
    assert_eq!(event.attempts, 2);
    let outcome = store.fail_event(event_id, "still broken").await.unwrap();
    assert_eq!(outcome, FailOutcome::DeadLettered);

    let stats = store.get_event_stats(id, Duration::from_secs(60)).await.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.dead_letters, 1);

    let dead_letters = store.list_dead_letters(id, 10).await.unwrap();
    assert_eq!(dead_letters.len(), 1);
    assert_eq!(dead_letters[0].idempotency_key, "a");
    assert_eq!(dead_letters[0].event_id, event_id);
    assert_eq!(dead_letters[0].error_message, "still broken");
}

#[tokio::test]
async fn test_retry_waits_for_backoff() {
    let config = TopicConfig::new("orders").with_backoff(Duration::from_secs(60), Duration::from_secs(60));
    let (store, id) = setup(config).await;
    let event_id = store.publish_event(new_event(id, "a")).await.unwrap();

    store.claim_next_event(id).await.unwrap();
    store.fail_event(event_id, "boom").await.unwrap();

    assert!(matches!(
        store.claim_next_event(id).await,
        Err(StoreError::NotFound)
    ));
    let event = store.get_event(event_id).await.unwrap();
    assert_eq!(event.state, EventState::Pending);
    assert_eq!(event.attempts, 1);
    assert!(event.next_attempt_at.unwrap() > event.updated_at);
}

#[tokio::test]
async fn test_huge_backoff_postpones_the_retry() {
    let config = TopicConfig::new("orders").with_backoff(Duration::MAX, Duration::MAX);
    let (store, id) = setup(config).await;
    let event_id = store.publish_event(new_event(id, "a")).await.unwrap();
    store.claim_next_event(id).await.unwrap();

    let failing = store.clone();
    let outcome = tokio::spawn(async move { failing.fail_event(event_id, "boom").await })
        .await
        .expect("fail_event panicked")
        .unwrap();
    assert_eq!(outcome, FailOutcome::Retrying);

    assert!(matches!(
        store.claim_next_event(id).await,
        Err(StoreError::NotFound)
    ));
    let event = store.get_event(event_id).await.unwrap();
    assert_eq!(event.state, EventState::Pending);
    assert!(event.next_attempt_at.unwrap() > event.updated_at + chrono::Duration::days(365 * 99));
}

#[tokio::test]
async fn test_failure_without_dead_letters() {
    let (store, id) = setup(TopicConfig::new("orders").with_max_retries(0).with_dlq(false)).await;
    let event_id = store.publish_event(new_event(id, "a")).await.unwrap();

    store.claim_next_event(id).await.unwrap();
    let outcome = store.fail_event(event_id, "boom").await.unwrap();
    assert_eq!(outcome, FailOutcome::Failed);

    let stats = store.get_event_stats(id, Duration::from_secs(60)).await.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.dead_letters, 0);
}

#[tokio::test]
async fn test_fail_requires_an_active_event() {
    let (store, id) = setup(TopicConfig::new("orders")).await;
    let event_id = store.publish_event(new_event(id, "a")).await.unwrap();
    assert!(matches!(
        store.fail_event(event_id, "boom").await,
        Err(StoreError::NotFound)
    ));
}

#[tokio::test]
async fn test_discard_leaves_no_trace() {
    let (store, id) = setup(TopicConfig::new("orders")).await;
    let event_id = store.publish_event(new_event(id, "a")).await.unwrap();

    assert!(!store.discard_event(event_id).await.unwrap());
    store.claim_next_event(id).await.unwrap();
    assert!(store.discard_event(event_id).await.unwrap());

    let stats = store.get_event_stats(id, Duration::ZERO).await.unwrap();
    assert_eq!(stats, EventStats::default());
    assert!(store.get_event(event_id).await.is_none());

    // The key is free again
    store.publish_event(new_event(id, "a")).await.unwrap();
}

#[tokio::test]
async fn test_retry_dead_letter_re_enqueues_the_event() {
    let (store, id) = setup(fast_retries("orders").with_max_retries(0)).await;
    let event_id = store.publish_event(new_event(id, "a")).await.unwrap();
    store.claim_next_event(id).await.unwrap();
    store.fail_event(event_id, "boom").await.unwrap();

    store.retry_dead_letter(id, "a").await.unwrap();

    let stats = store.get_event_stats(id, Duration::from_secs(60)).await.unwrap();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.dead_letters, 0);
    assert_eq!(stats.failed, 0);

    let event = store.claim_next_event(id).await.unwrap();
    assert_eq!(event.id, event_id);
    assert_eq!(event.attempts, 0);

    assert!(matches!(
        store.retry_dead_letter(id, "a").await,
        Err(StoreError::NotFound)
    ));
    assert!(matches!(
        store.retry_dead_letter(id, "unknown").await,
        Err(StoreError::NotFound)
    ));
}

#[tokio::test]
async fn test_clear_stuck_events_honours_limit_and_age() {
    let (store, id) = setup(TopicConfig::new("orders")).await;
    for i in 0..5 {
        store
            .publish_event(new_event(id, &format!("key-{}", i)))
            .await
            .unwrap();
        store.claim_next_event(id).await.unwrap();
    }

    // Nothing is that old yet
    let cleared = store
        .clear_stuck_events(id, 3, Duration::from_secs(3600))
        .await
        .unwrap();
    assert_eq!(cleared, 0);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let threshold = Duration::from_millis(10);

    let stats = store.get_event_stats(id, threshold).await.unwrap();
    assert_eq!(stats.active, 5);
    assert_eq!(stats.stuck, 5);

    let cleared = store.clear_stuck_events(id, 3, threshold).await.unwrap();
    assert_eq!(cleared, 3);
    let stats = store.get_event_stats(id, threshold).await.unwrap();
    assert_eq!(stats.pending, 3);
    assert_eq!(stats.active, 2);
    assert_eq!(stats.stuck, 2);

    let cleared = store.clear_stuck_events(id, 3, threshold).await.unwrap();
    assert_eq!(cleared, 2);
    let stats = store.get_event_stats(id, threshold).await.unwrap();
    assert_eq!(stats.pending, 5);
    assert_eq!(stats.active, 0);
}

#[tokio::test]
async fn test_cleanup_removes_expired_dead_letters() {
    let (store, expiring) = setup(fast_retries("expiring").with_max_retries(0).with_dlq_max_age(Duration::ZERO)).await;
    let kept = store
        .create_or_update_topic(&fast_retries("kept").with_max_retries(0))
        .await
        .unwrap()
        .id;

    for topic_id in [expiring, kept] {
        let event_id = store.publish_event(new_event(topic_id, "a")).await.unwrap();
        store.claim_next_event(topic_id).await.unwrap();
        store.fail_event(event_id, "boom").await.unwrap();
    }

    assert_eq!(store.cleanup_old_dead_letters().await.unwrap(), 1);
    assert!(store.list_dead_letters(expiring, 10).await.unwrap().is_empty());
    assert_eq!(store.list_dead_letters(kept, 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_publish_and_retry_emit_notifications() {
    let notifier = InMemoryNotifier::default();
    let store = InMemoryEventStore::with_notifier(notifier.clone());
    let mut connection = notifier.connect().await.unwrap();

    let id = store
        .create_or_update_topic(&fast_retries("orders").with_max_retries(0))
        .await
        .unwrap()
        .id;
    let event_id = store.publish_event(new_event(id, "a")).await.unwrap();

    let published = Notification::parse(&connection.recv().await.unwrap()).unwrap();
    assert_eq!(published, Notification { id: event_id, topic: id });

    store.claim_next_event(id).await.unwrap();
    store.fail_event(event_id, "boom").await.unwrap();
    store.retry_dead_letter(id, "a").await.unwrap();

    let retried = Notification::parse(&connection.recv().await.unwrap()).unwrap();
    assert_eq!(retried, Notification { id: event_id, topic: id });
}
