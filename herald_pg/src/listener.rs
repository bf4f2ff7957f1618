use async_trait::async_trait;
use herald_core::listener::{ListenerError, NotificationConnection, NotificationSource};
use sqlx::PgPool;
use sqlx::postgres::PgListener;

use crate::event_store::DEFAULT_CHANNEL;

/// Opens `LISTEN` connections for a [`Listener`](herald_core::listener::Listener).
///
/// Each connection is a dedicated session outside of the pool's regular checkouts. Use the
/// same channel as the [`PgEventStore`](crate::event_store::PgEventStore) that publishes.
#[derive(Clone, Debug)]
pub struct PgNotificationSource {
    pool: PgPool,
    channel: String,
}

impl PgNotificationSource {
    /// Listens on [`DEFAULT_CHANNEL`].
    pub fn new(pool: PgPool) -> Self {
        Self::with_channel(pool, DEFAULT_CHANNEL)
    }

    /// Listens on a custom channel.
    pub fn with_channel(pool: PgPool, channel: impl Into<String>) -> Self {
        Self {
            pool,
            channel: channel.into(),
        }
    }

    /// The channel connections listen on.
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

#[async_trait]
impl NotificationSource for PgNotificationSource {
    async fn connect(&self) -> Result<Box<dyn NotificationConnection>, ListenerError> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| ListenerError::Connection(Box::new(e)))?;
        listener
            .listen(&self.channel)
            .await
            .map_err(|e| ListenerError::Connection(Box::new(e)))?;

        log::info!("Listening on channel '{}'", self.channel);
        Ok(Box::new(PgNotificationConnection { listener }))
    }
}

/// A live `LISTEN` session.
pub struct PgNotificationConnection {
    listener: PgListener,
}

#[async_trait]
impl NotificationConnection for PgNotificationConnection {
    async fn recv(&mut self) -> Result<String, ListenerError> {
        // Dropped connections surface as errors here and are reopened by the listener loop
        let notification = self
            .listener
            .try_recv()
            .await
            .map_err(|e| ListenerError::Connection(Box::new(e)))?;

        match notification {
            Some(notification) => Ok(notification.payload().to_string()),
            None => Err(ListenerError::Connection(
                "notification connection lost".into(),
            )),
        }
    }
}
