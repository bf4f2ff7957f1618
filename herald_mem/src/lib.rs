//! # Herald memory store
//!
//! In-memory implementations of herald's storage and notification backends, primarily for
//! testing.
//!
//! [`InMemoryEventStore`] keeps topics, events and dead letters behind a single mutex, so each
//! store operation is atomic the way a row-locked transaction is. Pair it with an
//! [`InMemoryNotifier`] to get publish notifications:
//!
//! ```ignore
//! use std::sync::Arc;
//! use herald_core::prelude::*;
//! use herald_mem::{InMemoryEventStore, InMemoryNotifier};
//! use tokio_util::sync::CancellationToken;
//!
//! let token = CancellationToken::new();
//! let notifier = InMemoryNotifier::default();
//! let store = Arc::new(InMemoryEventStore::with_notifier(notifier.clone()));
//! let listener = Arc::new(Listener::new(notifier));
//! listener.start(&token).await?;
//!
//! let topic = Topic::<OrderPlaced>::new(store, listener, &token).await?;
//! ```
//!
//! A store built with [`InMemoryEventStore::new`] emits no notifications at all, which leaves
//! delivery entirely to each topic's backlog reconciler.

#![deny(missing_docs)]

mod event_store;
mod notifier;

pub use event_store::*;
pub use notifier::*;
