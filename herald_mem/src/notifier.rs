use async_trait::async_trait;
use futures_util::StreamExt;
use herald_core::event::Notification;
use herald_core::listener::{ListenerError, NotificationConnection, NotificationSource};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

/// Errors returned by in-memory notification connections.
#[derive(Debug, thiserror::Error)]
pub enum InMemoryNotifierError {
    /// Every sender was dropped.
    #[error("notification channel closed")]
    Closed,
}

/// A broadcast channel standing in for the store's notification mechanism.
///
/// Like the real thing it is best effort: notifications sent while no connection is open are
/// lost, and a connection that lags behind skips the notifications it missed.
#[derive(Clone, Debug)]
pub struct InMemoryNotifier {
    tx: broadcast::Sender<String>,
}

impl InMemoryNotifier {
    /// Creates a notifier, `capacity` being the per-connection buffer.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emits a notification to every open connection.
    pub fn notify(&self, notification: Notification) {
        self.send_raw(notification.to_payload());
    }

    /// Emits an arbitrary payload, e.g. a malformed one.
    pub fn send_raw(&self, payload: impl Into<String>) {
        // No open connection means the notification is simply lost
        let _ = self.tx.send(payload.into());
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for InMemoryNotifier {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl NotificationSource for InMemoryNotifier {
    async fn connect(&self) -> Result<Box<dyn NotificationConnection>, ListenerError> {
        Ok(Box::new(InMemoryConnection {
            stream: BroadcastStream::new(self.tx.subscribe()),
        }))
    }
}

/// An open connection to an [`InMemoryNotifier`].
pub struct InMemoryConnection {
    stream: BroadcastStream<String>,
}

#[async_trait]
impl NotificationConnection for InMemoryConnection {
    async fn recv(&mut self) -> Result<String, ListenerError> {
        loop {
            match self.stream.next().await {
                Some(Ok(payload)) => return Ok(payload),
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    log::warn!("Notification connection lagged, {} notifications lost", skipped);
                }
                None => {
                    return Err(ListenerError::Connection(Box::new(
                        InMemoryNotifierError::Closed,
                    )));
                }
            }
        }
    }
}
