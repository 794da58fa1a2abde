//! Domain layer for the saga coordinator.
//!
//! This crate provides:
//! - Aggregate, DomainEvent and SnapshotCapable traits for event-sourced entities
//! - The saga event model (`TxEvent`) with one validating factory per event type
//! - The transition validator deciding Accept / Duplicate / Reject
//! - The `GlobalTransaction` aggregate and its compensation plan
//! - `EventSourcedRepository` for loading and appending aggregates

pub mod aggregate;
pub mod error;
pub mod events;
pub mod repository;
pub mod state;
pub mod transaction;
pub mod validator;

pub use aggregate::{Aggregate, DomainEvent, SnapshotCapable};
pub use error::{DomainError, EventError};
pub use events::{TxEvent, TxEventType};
pub use repository::EventSourcedRepository;
pub use state::{BranchState, SagaState};
pub use transaction::{Branch, GlobalTransaction};
pub use validator::{OutOfOrderPolicy, RejectReason, Verdict, validate, validate_event};
