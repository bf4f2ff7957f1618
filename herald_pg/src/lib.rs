//! # Herald postgres store
//!
//! A postgres [`EventStore`](herald_core::store::EventStore) and `LISTEN/NOTIFY` notification
//! source.
//!
//! ```rust,ignore
//! use herald_pg::{Migrator, PgEventStore, PgNotificationSource};
//!
//! Migrator::new(pool.clone()).run().await?;
//! let store = Arc::new(PgEventStore::new(pool.clone()));
//! store.setup_trigger().await?;
//!
//! let listener = Arc::new(Listener::new(PgNotificationSource::new(pool.clone())));
//! listener.start(&token).await?;
//! ```

#![deny(missing_docs)]

/// The postgres event store
pub mod event_store;

/// `LISTEN` connections for the herald listener
pub mod listener;

/// Database migrations for the herald schema
pub mod migrations;

pub use event_store::{DEFAULT_CHANNEL, PgEventStore, PgStoreError};
pub use listener::{PgNotificationConnection, PgNotificationSource};
pub use migrations::{AppliedMigration, Migration, MigrationError, Migrator};
