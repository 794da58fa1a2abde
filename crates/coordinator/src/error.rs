//! Coordinator error types.

use common::GlobalTxId;
use domain::{DomainError, EventError};
use event_store::EventStoreError;
use thiserror::Error;

/// Errors returned by the coordinator to its callers.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// The saga stopped after a failed write and refuses events until resumed.
    #[error("Saga {global_tx_id} is halted: {reason}")]
    Halted {
        global_tx_id: GlobalTxId,
        reason: String,
    },

    #[error("Saga not found: {0}")]
    NotFound(GlobalTxId),

    /// The saga's worker stopped before answering.
    #[error("Saga worker unavailable: {0}")]
    WorkerUnavailable(GlobalTxId),

    #[error("Invalid event: {0}")]
    Event(#[from] EventError),

    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),
}

/// Convenience type alias for coordinator results.
pub type Result<T> = std::result::Result<T, CoordinatorError>;

/// A saga that could not be rebuilt during startup.
#[derive(Debug, Error)]
#[error("Failed to recover saga {global_tx_id}: {source}")]
pub struct RecoveryError {
    pub global_tx_id: GlobalTxId,
    #[source]
    pub source: DomainError,
}

/// Errors from invoking an omega's compensation method.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallbackError {
    /// No instance of the service is connected.
    #[error("No omega connected for service {service}")]
    NotConnected { service: String },

    /// The omega ran the compensation and reported a failure.
    #[error("Compensation failed: {0}")]
    Failed(String),

    /// The omega did not answer in time.
    #[error("Compensation timed out")]
    Timeout,

    /// The channel to the omega closed mid-call.
    #[error("Omega disconnected")]
    Disconnected,
}
