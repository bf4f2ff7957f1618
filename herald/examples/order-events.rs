use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use herald::prelude::*;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Message)]
struct OrderPlaced {
    #[message(key)]
    order_id: Uuid,
    customer: String,
    total_cents: u64,
}

/// Rejects empty orders and fails every other order once to show retries.
struct Fulfilment {
    calls: AtomicU32,
}

#[async_trait::async_trait]
impl Subscriber<OrderPlaced> for Fulfilment {
    async fn on_message(&self, delivery: Delivery<OrderPlaced>) -> Result<(), SubscriberError> {
        let order = &delivery.message;
        if order.total_cents == 0 {
            log::info!("Discarding empty order {}", delivery.key);
            return Err(Discard.into());
        }

        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call % 2 == 0 && delivery.attempt == 0 {
            return Err(format!("warehouse busy for order {}", delivery.key).into());
        }

        log::info!(
            "Shipping order {} for {} ({} cents, attempt {}, trace {:?})",
            delivery.key,
            order.customer,
            order.total_cents,
            delivery.attempt,
            delivery.headers.get("trace-id")
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .init();

    let token = CancellationToken::new();
    let notifier = InMemoryNotifier::default();
    let store = Arc::new(InMemoryEventStore::with_notifier(notifier.clone()));

    let listener = Arc::new(Listener::new(notifier));
    listener.start(&token).await?;

    let config = TopicConfig::for_message::<OrderPlaced>()
        .with_max_retries(2)
        .with_backoff(Duration::from_millis(50), Duration::from_millis(200));
    let reconciler = ReconcilerConfig {
        interval: Duration::from_millis(100),
        ..ReconcilerConfig::default()
    };
    let orders: Topic<OrderPlaced> =
        Topic::with_config(store.clone(), listener.clone(), config, reconciler, &token).await?;
    orders
        .subscribe(Fulfilment {
            calls: AtomicU32::new(0),
        })
        .await?;

    let sweeper = Arc::new(Sweeper::new(store.clone(), SweeperConfig::default()));
    sweeper.track(orders.id()).await;
    let sweeper_handle = sweeper.spawn(token.child_token());

    for (customer, total_cents) in [("ada", 1250), ("grace", 0), ("linus", 4999)] {
        let mut headers = Headers::new();
        headers.insert("trace-id".to_string(), Uuid::new_v4().to_string());
        let order = OrderPlaced {
            order_id: Uuid::new_v4(),
            customer: customer.to_string(),
            total_cents,
        };
        orders.publish_with_headers(&order, headers).await?;
    }

    // Let retries run their course
    tokio::time::sleep(Duration::from_secs(1)).await;
    let stats = orders.stats(Duration::from_secs(60)).await?;
    log::info!(
        "Topic '{}': {} succeeded, {} pending, {} failed, {} dead letters",
        orders.name(),
        stats.succeeded,
        stats.pending,
        stats.failed,
        stats.dead_letters
    );

    orders.close().await?;
    listener.shutdown().await?;
    token.cancel();
    sweeper_handle.await?;
    Ok(())
}
