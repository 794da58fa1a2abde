//! Append-only event log for the saga coordinator.
//!
//! Every saga owns one stream keyed by its [`GlobalTxId`]. Streams are
//! append-only and replayable; snapshots are an optional optimization that
//! bound replay cost and are never the sole source of truth.

pub mod error;
pub mod event;
pub mod memory;
pub mod postgres;
pub mod snapshot;
pub mod store;

pub use common::GlobalTxId;
pub use error::{EventStoreError, Result};
pub use event::{EventEnvelope, EventEnvelopeBuilder, EventId, Version};
pub use memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use snapshot::Snapshot;
pub use store::{AppendOptions, EventStore, EventStoreExt};
