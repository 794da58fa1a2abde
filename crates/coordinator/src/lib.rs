//! Saga coordinator.
//!
//! Events for a global transaction are routed through [`SagaRegistry`] to a
//! dedicated worker task that owns the saga's [`domain::GlobalTransaction`].
//! The worker validates, persists and applies each event through
//! [`SagaStateMachine`], and drives compensation of committed branches
//! through [`CompensationDriver`] when the saga fails.

pub mod callback;
pub mod compensation;
pub mod config;
pub mod error;
pub mod recovery;
pub mod registry;
pub mod state_machine;
mod worker;

pub use callback::{
    CallbackRegistry, CompensationCommand, InMemoryOmegaCallback, Lookup, OmegaCallback,
};
pub use compensation::{CompensationDriver, CompensationOutcome, RetryPolicy};
pub use config::CoordinatorConfig;
pub use error::{CallbackError, CoordinatorError, RecoveryError, Result};
pub use recovery::{RecoveryLoader, RecoveryReport};
pub use registry::SagaRegistry;
pub use state_machine::{Ack, Applied, SagaStateMachine, SideEffect};
