//! Rebuilds live sagas from the event log at startup.

use common::GlobalTxId;
use domain::{Aggregate, EventSourcedRepository, GlobalTransaction};
use event_store::{EventStore, EventStoreError};

use crate::error::RecoveryError;

/// Summary of one recovery pass.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Sagas that still need a worker, in the order they were first written.
    pub recovered: Vec<GlobalTxId>,
    /// Sagas found already committed, compensated or terminated.
    pub skipped_terminal: usize,
    pub failed: Vec<RecoveryError>,
}

impl RecoveryReport {
    pub fn scanned(&self) -> usize {
        self.recovered.len() + self.skipped_terminal + self.failed.len()
    }
}

/// Replays every stream in the store and keeps the sagas that are not finished.
pub struct RecoveryLoader<S: EventStore> {
    repo: EventSourcedRepository<S, GlobalTransaction>,
}

impl<S: EventStore> RecoveryLoader<S> {
    pub fn new(store: S) -> Self {
        Self {
            repo: EventSourcedRepository::new(store),
        }
    }

    /// Loads all unfinished sagas.
    ///
    /// A saga that fails to rebuild is reported and skipped so one corrupt
    /// stream does not keep the others from recovering. Loading has no side
    /// effects, so running it twice yields the same result.
    #[tracing::instrument(skip(self))]
    pub async fn load_all(
        &self,
    ) -> Result<(Vec<GlobalTransaction>, RecoveryReport), EventStoreError> {
        let ids = self.repo.store().list_streams().await?;
        let mut sagas = Vec::new();
        let mut report = RecoveryReport::default();

        for global_tx_id in ids {
            match self.repo.load(&global_tx_id).await {
                Ok(tx) if tx.is_finished() => report.skipped_terminal += 1,
                Ok(tx) => {
                    tracing::debug!(
                        %global_tx_id,
                        state = %tx.state(),
                        version = %tx.version(),
                        "recovered saga"
                    );
                    report.recovered.push(global_tx_id);
                    sagas.push(tx);
                }
                Err(source) => {
                    tracing::error!(%global_tx_id, error = %source, "saga could not be recovered");
                    metrics::counter!("saga_recovery_failures_total").increment(1);
                    report.failed.push(RecoveryError {
                        global_tx_id,
                        source,
                    });
                }
            }
        }

        tracing::info!(
            recovered = report.recovered.len(),
            skipped = report.skipped_terminal,
            failed = report.failed.len(),
            "recovery complete"
        );
        Ok((sagas, report))
    }
}
