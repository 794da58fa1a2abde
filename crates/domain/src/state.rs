//! Saga and branch state enums.

use serde::{Deserialize, Serialize};

/// The state of a global transaction.
///
/// State transitions:
/// ```text
/// STARTED ──┬──► COMMITTED
///           └──► COMPENSATING ──┬──► COMPENSATED
///                               └──► SUSPENDED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaState {
    /// Branches are running; no failure observed.
    #[default]
    Started,

    /// Every branch committed (terminal state).
    Committed,

    /// A failure was observed and committed branches are being undone.
    Compensating,

    /// Compensation ran to completion (terminal state).
    Compensated,

    /// Compensation exhausted its retries; waits for an operator.
    Suspended,
}

impl SagaState {
    /// Returns true for COMMITTED and COMPENSATED.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaState::Committed | SagaState::Compensated)
    }

    /// Returns true if the saga accepts no further progress events.
    pub fn is_closed(&self) -> bool {
        self.is_terminal() || matches!(self, SagaState::Suspended)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SagaState::Started => "STARTED",
            SagaState::Committed => "COMMITTED",
            SagaState::Compensating => "COMPENSATING",
            SagaState::Compensated => "COMPENSATED",
            SagaState::Suspended => "SUSPENDED",
        }
    }
}

impl std::fmt::Display for SagaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The state of one local transaction.
///
/// Transitions are monotonic: STARTED → COMMITTED → COMPENSATED, or
/// STARTED → FAILED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BranchState {
    #[default]
    Started,
    Committed,
    Compensated,
    Failed,
}

impl BranchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BranchState::Started => "STARTED",
            BranchState::Committed => "COMMITTED",
            BranchState::Compensated => "COMPENSATED",
            BranchState::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for BranchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
