//! The `Listener` owns the single store subscription connection of a process and fans
//! notifications out to per-topic handlers.

use crate::backoff::Backoff;
use crate::config::ListenerConfig;
use crate::event::Notification;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Error returned by a [`NotificationHandler`]. It is logged by the listener, never propagated.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur when using the [`Listener`].
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    /// A handler is already registered for the topic.
    #[error("a listener is already registered for topic {0}")]
    DuplicateListener(i64),
    /// No handler is registered for the topic.
    #[error("no listener registered for topic {0}")]
    NotFound(i64),
    /// `start` was called twice.
    #[error("listener already started")]
    AlreadyStarted,
    /// `shutdown` was called on a listener that is not running.
    #[error("listener not started")]
    NotStarted,
    /// The subscription connection failed.
    #[error("notification connection error: {0}")]
    Connection(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// The receive loop panicked.
    #[error("listener task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Receives the notifications addressed to one topic.
///
/// The listener awaits handlers one at a time on its receive loop, so a handler delays every
/// other topic sharing the connection for as long as it runs.
#[async_trait]
pub trait NotificationHandler: Send + Sync + 'static {
    /// Called with every notification carrying the handler's topic id.
    async fn notified(&self, notification: Notification) -> Result<(), HandlerError>;
}

/// Opens subscription connections to the store.
#[async_trait]
pub trait NotificationSource: Send + Sync + 'static {
    /// Connects and starts listening on the store's notification channel.
    async fn connect(&self) -> Result<Box<dyn NotificationConnection>, ListenerError>;
}

/// A live subscription connection.
#[async_trait]
pub trait NotificationConnection: Send {
    /// Waits for the next notification and returns its raw payload.
    async fn recv(&mut self) -> Result<String, ListenerError>;
}

type Handlers = Arc<Mutex<HashMap<i64, Arc<dyn NotificationHandler>>>>;

/// Internal state for managing the receive loop lifecycle.
struct ListenerState {
    handle: JoinHandle<()>,
    token: CancellationToken,
}

/// Multiplexes one notification connection across many topics.
///
/// Construct one per store connection and hand it to every [`Topic`](crate::topic::Topic).
pub struct Listener {
    source: Arc<dyn NotificationSource>,
    config: ListenerConfig,
    handlers: Handlers,
    state: Mutex<Option<ListenerState>>,
}

impl Listener {
    /// Creates a listener with the default reconnect backoff.
    pub fn new(source: impl NotificationSource) -> Self {
        Self::with_config(source, ListenerConfig::default())
    }

    /// Creates a listener with a custom reconnect backoff.
    pub fn with_config(source: impl NotificationSource, config: ListenerConfig) -> Self {
        Self {
            source: Arc::new(source),
            config,
            handlers: Arc::new(Mutex::new(HashMap::new())),
            state: Mutex::new(None),
        }
    }

    /// Registers the handler for a topic id.
    pub async fn listen(
        &self,
        topic_id: i64,
        handler: Arc<dyn NotificationHandler>,
    ) -> Result<(), ListenerError> {
        let mut handlers = self.handlers.lock().await;
        if handlers.contains_key(&topic_id) {
            return Err(ListenerError::DuplicateListener(topic_id));
        }
        handlers.insert(topic_id, handler);
        debug!("Registered listener for topic {}", topic_id);
        Ok(())
    }

    /// Removes the handler of a topic id.
    pub async fn unlisten(&self, topic_id: i64) -> Result<(), ListenerError> {
        let mut handlers = self.handlers.lock().await;
        match handlers.remove(&topic_id) {
            Some(_) => {
                debug!("Unregistered listener for topic {}", topic_id);
                Ok(())
            }
            None => Err(ListenerError::NotFound(topic_id)),
        }
    }

    /// Whether a handler is registered for the topic id.
    pub async fn is_listening(&self, topic_id: i64) -> bool {
        self.handlers.lock().await.contains_key(&topic_id)
    }

    /// Spawns the receive loop. It stops when `token` (or [`shutdown`](Self::shutdown)) cancels.
    pub async fn start(&self, token: &CancellationToken) -> Result<(), ListenerError> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Err(ListenerError::AlreadyStarted);
        }

        let token = token.child_token();
        let handle = tokio::spawn(receive_loop(
            self.source.clone(),
            self.handlers.clone(),
            self.config.clone(),
            token.clone(),
        ));

        *state = Some(ListenerState { handle, token });
        Ok(())
    }

    /// Stops the receive loop and waits for it to exit.
    pub async fn shutdown(&self) -> Result<(), ListenerError> {
        let state = self.state.lock().await.take();
        match state {
            Some(ListenerState { handle, token }) => {
                token.cancel();
                handle.await?;
                info!("Listener shut down");
                Ok(())
            }
            None => Err(ListenerError::NotStarted),
        }
    }

    /// Returns whether the receive loop is running.
    pub async fn is_running(&self) -> bool {
        match self.state.lock().await.as_ref() {
            Some(state) => !state.handle.is_finished(),
            None => false,
        }
    }
}

/// Sleeps for `delay`. Returns `true` if the token was cancelled meanwhile.
async fn sleep_or_cancelled(token: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

async fn receive_loop(
    source: Arc<dyn NotificationSource>,
    handlers: Handlers,
    config: ListenerConfig,
    token: CancellationToken,
) {
    let mut connection: Option<Box<dyn NotificationConnection>> = None;
    let mut backoff = Backoff::new(config.min_backoff, config.max_backoff);

    loop {
        let conn = match connection {
            Some(ref mut conn) => conn,
            None => {
                let connected = tokio::select! {
                    _ = token.cancelled() => return,
                    result = source.connect() => result,
                };
                match connected {
                    Ok(conn) => {
                        info!("Listener connected to notification channel");
                        backoff.reset();
                        connection.insert(conn)
                    }
                    Err(e) => {
                        let delay = backoff.next_failure();
                        error!(
                            "Failed to connect listener: {}. Retrying in {:?}",
                            e, delay
                        );
                        if sleep_or_cancelled(&token, delay).await {
                            return;
                        }
                        continue;
                    }
                }
            }
        };

        let received = tokio::select! {
            _ = token.cancelled() => {
                info!("Listener shutdown complete");
                return;
            }
            result = conn.recv() => result,
        };

        let payload = match received {
            Ok(payload) => {
                backoff.reset();
                payload
            }
            Err(e) => {
                let delay = backoff.next_failure();
                error!(
                    "Error receiving notification: {}. Reconnecting in {:?}",
                    e, delay
                );
                connection = None;
                if sleep_or_cancelled(&token, delay).await {
                    return;
                }
                continue;
            }
        };

        debug!("Received notification with payload: {}", payload);
        let notification = match Notification::parse(&payload) {
            Ok(notification) => notification,
            Err(e) => {
                warn!(
                    "Skipping malformed notification payload '{}': {}",
                    payload, e
                );
                continue;
            }
        };

        let handler = handlers.lock().await.get(&notification.topic).cloned();
        let Some(handler) = handler else {
            debug!(
                "No listener registered for topic {}, ignoring event {}",
                notification.topic, notification.id
            );
            continue;
        };

        tokio::select! {
            _ = token.cancelled() => return,
            result = handler.notified(notification) => {
                if let Err(e) = result {
                    error!(
                        "Listener for topic {} failed on event {}: {}",
                        notification.topic, notification.id, e
                    );
                }
            }
        }
    }
}
