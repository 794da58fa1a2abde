//! Compensation dispatch with bounded exponential backoff.
//!
//! The driver runs one attempt at a time in its own task and reports the
//! outcome back to the saga's worker, which records it and decides what to
//! dispatch next. A saga therefore never has two compensations in flight,
//! while different sagas compensate in parallel.
//!
//! An attempt for a service with no connected omega waits for one to
//! connect. Only calls that reach an omega count against the retry budget.

use std::sync::Arc;
use std::time::Duration;

use common::LocalTxId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::callback::{CallbackRegistry, CompensationCommand};
use crate::error::CallbackError;

/// Retry budget for one branch's compensation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts before the saga is suspended.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff,
            multiplier: 2.0,
        }
    }

    /// Delay before attempt `attempt` (1-based). The first attempt runs at once.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.powi(attempt.saturating_sub(2) as i32);
        Duration::try_from_secs_f64(self.initial_backoff.as_secs_f64() * factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Attempts left after `retries` failures.
    pub fn remaining(&self, retries: u32) -> u32 {
        self.max_attempts.saturating_sub(retries)
    }

    pub fn is_exhausted(&self, retries: u32) -> bool {
        self.remaining(retries) == 0
    }
}

/// Result of one compensation attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum CompensationOutcome {
    Succeeded {
        local_tx_id: LocalTxId,
    },
    Failed {
        local_tx_id: LocalTxId,
        attempt: u32,
        error: CallbackError,
    },
}

impl CompensationOutcome {
    pub fn local_tx_id(&self) -> &LocalTxId {
        match self {
            CompensationOutcome::Succeeded { local_tx_id }
            | CompensationOutcome::Failed { local_tx_id, .. } => local_tx_id,
        }
    }
}

/// Invokes compensation callbacks without blocking the saga's mailbox.
pub struct CompensationDriver {
    callbacks: Arc<CallbackRegistry>,
    policy: RetryPolicy,
}

impl CompensationDriver {
    pub fn new(callbacks: Arc<CallbackRegistry>, policy: RetryPolicy) -> Self {
        Self { callbacks, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn callbacks(&self) -> &Arc<CallbackRegistry> {
        &self.callbacks
    }

    /// Spawns one attempt, delayed by the backoff for `command.attempt`.
    ///
    /// The outcome is sent on `outcomes`; if the receiver is gone the outcome
    /// is dropped and the attempt is recomputed after recovery.
    pub fn dispatch(
        self: &Arc<Self>,
        command: CompensationCommand,
        outcomes: mpsc::Sender<CompensationOutcome>,
    ) -> JoinHandle<()> {
        let driver = Arc::clone(self);
        tokio::spawn(async move {
            let delay = driver.policy.backoff(command.attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let outcome = driver.attempt(&command).await;
            let _ = outcomes.send(outcome).await;
        })
    }

    #[tracing::instrument(
        skip(self, command),
        fields(
            global_tx_id = %command.global_tx_id,
            local_tx_id = %command.local_tx_id,
            service = %command.service_name,
            attempt = command.attempt,
        )
    )]
    async fn attempt(&self, command: &CompensationCommand) -> CompensationOutcome {
        metrics::counter!("compensation_attempts_total").increment(1);
        let result = loop {
            match self.callbacks.compensate(command).await {
                // A branch without a service can never find an omega.
                Err(CallbackError::NotConnected { service }) if !service.is_empty() => {
                    metrics::counter!("compensation_parked_total").increment(1);
                    tracing::info!(%service, "no omega connected, waiting for one");
                    self.callbacks.wait_for(&service).await;
                }
                result => break result,
            }
        };
        match result {
            Ok(()) => {
                tracing::info!("branch compensated");
                CompensationOutcome::Succeeded {
                    local_tx_id: command.local_tx_id.clone(),
                }
            }
            Err(error) => {
                metrics::counter!("compensation_failures_total").increment(1);
                tracing::warn!(%error, "compensation attempt failed");
                CompensationOutcome::Failed {
                    local_tx_id: command.local_tx_id.clone(),
                    attempt: command.attempt,
                    error,
                }
            }
        }
    }
}
