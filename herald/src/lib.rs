//! # Herald
//!
//! Durable, at-least-once publish/subscribe backed by a relational store.
//!
//! Enable `in-memory` for the test store and `postgres` for the production one.

#![deny(missing_docs)]

pub use herald_core::*;

#[cfg(feature = "derive")]
/// Proc-macros for the `herald` crate.
pub mod derive {
    //! Contains proc-macros for the `herald` crate.
    pub use herald_derive::*;
}

#[cfg(feature = "in-memory")]
/// In-memory store and notifier.
pub mod mem {
    //! Contains the in-memory backends.
    pub use herald_mem::*;
}

#[cfg(feature = "postgres")]
/// Postgres store, notification source and migrations.
pub mod pg {
    //! Contains the postgres backends.
    pub use herald_pg::*;
}

pub mod prelude {
    //! The prelude module for the `herald` crate.
    pub use herald_core::prelude::*;

    #[cfg(feature = "derive")]
    pub use super::derive::*;
    #[cfg(feature = "in-memory")]
    pub use super::mem::{InMemoryEventStore, InMemoryNotifier};
    #[cfg(feature = "postgres")]
    pub use super::pg::{Migrator, PgEventStore, PgNotificationSource};
}
