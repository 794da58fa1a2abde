//! Domain error types.

use common::IdError;
use event_store::EventStoreError;
use thiserror::Error;

/// Errors raised while constructing a [`crate::TxEvent`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventError {
    #[error(transparent)]
    InvalidId(#[from] IdError),

    /// A field the event type requires is absent or blank.
    #[error("{event_type} requires {field}")]
    MissingField {
        event_type: &'static str,
        field: &'static str,
    },
}

/// Errors that can occur during domain operations.
#[derive(Debug, Error)]
pub enum DomainError {
    /// An error occurred in the event store.
    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),

    #[error("Invalid event: {0}")]
    Event(#[from] EventError),

    /// Aggregate not found.
    #[error("Aggregate not found: {aggregate_type} with id {aggregate_id}")]
    AggregateNotFound {
        aggregate_type: &'static str,
        aggregate_id: String,
    },

    /// A persisted event could not be decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
