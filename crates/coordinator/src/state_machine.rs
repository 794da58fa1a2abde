//! The single mutation point of a saga.

use common::GlobalTxId;
use domain::{
    Aggregate, EventSourcedRepository, GlobalTransaction, OutOfOrderPolicy, RejectReason,
    SagaState, SnapshotCapable, TxEvent, Verdict, validate_event,
};
use event_store::EventStore;
use serde::{Deserialize, Serialize};

use crate::callback::CompensationCommand;
use crate::error::{CoordinatorError, Result};

/// Per-event acknowledgement returned to the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "camelCase")]
pub enum Ack {
    Accepted,
    Duplicate,
    Rejected(RejectReason),
}

/// Work the worker must carry out after an event was persisted.
#[derive(Debug, Clone, PartialEq)]
pub enum SideEffect {
    /// Compensate this branch next.
    Compensate(CompensationCommand),
    /// The saga is finished and can be archived.
    Archive(SagaState),
}

/// Result of [`SagaStateMachine::apply`].
#[derive(Debug, Clone)]
pub struct Applied {
    pub ack: Ack,
    pub snapshot: GlobalTransaction,
    pub effects: Vec<SideEffect>,
}

/// Validates, persists and applies events for one saga.
///
/// An event is appended to the log before the aggregate changes, and side
/// effects are derived from the aggregate alone, so a rebuilt machine yields
/// the same effects as the one that crashed.
pub struct SagaStateMachine<S: EventStore> {
    global_tx_id: GlobalTxId,
    tx: GlobalTransaction,
    repo: EventSourcedRepository<S, GlobalTransaction>,
    policy: OutOfOrderPolicy,
    snapshot_interval: u64,
    halted: Option<String>,
}

impl<S: EventStore> SagaStateMachine<S> {
    pub fn new(
        global_tx_id: GlobalTxId,
        tx: GlobalTransaction,
        store: S,
        policy: OutOfOrderPolicy,
        snapshot_interval: u64,
    ) -> Self {
        Self {
            global_tx_id,
            tx,
            repo: EventSourcedRepository::new(store),
            policy,
            snapshot_interval,
            halted: None,
        }
    }

    /// Builds a machine from the persisted history of `global_tx_id`.
    pub async fn load(
        global_tx_id: GlobalTxId,
        store: S,
        policy: OutOfOrderPolicy,
        snapshot_interval: u64,
    ) -> Result<Self> {
        let repo = EventSourcedRepository::<S, GlobalTransaction>::new(store);
        let tx = repo.load(&global_tx_id).await?;
        Ok(Self {
            global_tx_id,
            tx,
            repo,
            policy,
            snapshot_interval,
            halted: None,
        })
    }

    pub fn global_tx_id(&self) -> &GlobalTxId {
        &self.global_tx_id
    }

    /// Point-in-time view of the saga.
    pub fn query(&self) -> GlobalTransaction {
        self.tx.clone()
    }

    pub fn transaction(&self) -> &GlobalTransaction {
        &self.tx
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    /// Marks the saga as unable to write.
    pub fn halt(&mut self, reason: impl Into<String>) {
        self.halted = Some(reason.into());
    }

    /// Validates only, without persisting.
    pub fn check(&self, event: &TxEvent) -> Verdict {
        validate_event(&self.tx, event, self.policy)
    }

    /// Applies one event: validate, persist, then update the aggregate.
    #[tracing::instrument(
        skip(self, event),
        fields(
            global_tx_id = %self.global_tx_id,
            event_type = %event.event_type,
            local_tx_id = event.local_tx_id.as_ref().map(|id| id.as_str()),
        )
    )]
    pub async fn apply(&mut self, event: TxEvent) -> Result<Applied> {
        if let Some(reason) = &self.halted {
            return Err(CoordinatorError::Halted {
                global_tx_id: self.global_tx_id.clone(),
                reason: reason.clone(),
            });
        }

        let ack = match self.check(&event) {
            Verdict::Accept => {
                self.persist(event).await?;
                Ack::Accepted
            }
            Verdict::Duplicate => {
                metrics::counter!("saga_events_duplicate_total").increment(1);
                tracing::debug!("duplicate event ignored");
                Ack::Duplicate
            }
            Verdict::Reject(reason) => {
                metrics::counter!("saga_events_rejected_total").increment(1);
                tracing::warn!(%reason, "event rejected");
                Ack::Rejected(reason)
            }
        };

        Ok(Applied {
            ack,
            snapshot: self.query(),
            effects: self.side_effects(),
        })
    }

    async fn persist(&mut self, event: TxEvent) -> Result<()> {
        let before = self.tx.state();
        let event_type = event.event_type.as_str();

        if let Err(err) = self.repo.append(&self.global_tx_id, &mut self.tx, event).await {
            metrics::counter!("saga_persistence_failures_total").increment(1);
            tracing::error!(error = %err, "failed to persist event, halting saga");
            self.halted = Some(err.to_string());
            return Err(err.into());
        }
        metrics::counter!("saga_events_total", "event_type" => event_type).increment(1);

        let after = self.tx.state();
        if before != after {
            self.record_transition(before, after);
        }

        if self.tx.should_snapshot(self.snapshot_interval)
            && let Err(err) = self.repo.save_snapshot(&self.global_tx_id, &self.tx).await
        {
            tracing::warn!(error = %err, "failed to save snapshot");
        }
        Ok(())
    }

    fn record_transition(&self, before: SagaState, after: SagaState) {
        tracing::info!(from = %before, to = %after, "saga state changed");
        match after {
            SagaState::Committed => {
                metrics::counter!("saga_committed_total").increment(1);
                self.record_duration();
            }
            SagaState::Compensated => {
                metrics::counter!("saga_compensated_total").increment(1);
                self.record_duration();
            }
            SagaState::Suspended => {
                metrics::counter!("saga_suspended_total").increment(1);
                tracing::error!(
                    reason = self.tx.suspended_reason().unwrap_or_default(),
                    "saga suspended, operator action required"
                );
            }
            SagaState::Compensating => {
                tracing::warn!(
                    reason = self.tx.abort_reason().unwrap_or_default(),
                    "saga compensating"
                );
            }
            SagaState::Started => {}
        }
    }

    fn record_duration(&self) {
        if let (Some(begin), Some(end)) = (self.tx.begin_time(), self.tx.end_time()) {
            let seconds = (end - begin).num_milliseconds() as f64 / 1000.0;
            metrics::histogram!("saga_duration_seconds").record(seconds);
        }
    }

    /// Side effects implied by the current aggregate.
    pub fn side_effects(&self) -> Vec<SideEffect> {
        if self.tx.is_finished() {
            return vec![SideEffect::Archive(self.tx.state())];
        }
        self.tx
            .next_compensation()
            .map(|branch| {
                SideEffect::Compensate(CompensationCommand::for_branch(&self.global_tx_id, branch))
            })
            .into_iter()
            .collect()
    }

    /// Clears a halt by reloading the saga from the log.
    ///
    /// The reload picks up an append that succeeded even though it was
    /// reported as failed.
    pub async fn resume(&mut self) -> Result<()> {
        let tx = self.repo.load(&self.global_tx_id).await?;
        self.tx = tx;
        if self.halted.take().is_some() {
            tracing::info!(global_tx_id = %self.global_tx_id, version = %self.tx.version(), "saga resumed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use event_store::InMemoryEventStore;

    use super::*;
    use crate::error::CoordinatorError;

    const G: &str = "g-1";

    fn machine(store: &InMemoryEventStore) -> SagaStateMachine<InMemoryEventStore> {
        SagaStateMachine::new(
            GlobalTxId::parse(G).unwrap(),
            GlobalTransaction::default(),
            store.clone(),
            OutOfOrderPolicy::Strict,
            0,
        )
    }

    #[tokio::test]
    async fn accepted_events_are_persisted_before_applied() {
        let store = InMemoryEventStore::new();
        let mut sm = machine(&store);

        let applied = sm
            .apply(TxEvent::tx_started(G, "l1", "svc", "undo").unwrap())
            .await
            .unwrap();

        assert_eq!(applied.ack, Ack::Accepted);
        assert_eq!(applied.snapshot.branch_count(), 1);
        assert_eq!(store.event_count().await, 1);
    }

    #[tokio::test]
    async fn duplicates_and_rejections_write_nothing() {
        let store = InMemoryEventStore::new();
        let mut sm = machine(&store);
        let start = TxEvent::tx_started(G, "l1", "svc", "undo").unwrap();
        sm.apply(start.clone()).await.unwrap();

        assert_eq!(sm.apply(start).await.unwrap().ack, Ack::Duplicate);
        let early = TxEvent::tx_ended(G, "l9").unwrap();
        assert_eq!(
            sm.apply(early).await.unwrap().ack,
            Ack::Rejected(RejectReason::OutOfOrder)
        );
        assert_eq!(store.event_count().await, 1);
    }

    #[tokio::test]
    async fn abort_yields_compensation_of_last_commit() {
        let store = InMemoryEventStore::new();
        let mut sm = machine(&store);
        for event in [
            TxEvent::tx_started(G, "l1", "svc-a", "undo-a").unwrap(),
            TxEvent::tx_ended(G, "l1").unwrap(),
            TxEvent::tx_started(G, "l2", "svc-b", "undo-b").unwrap(),
            TxEvent::tx_ended(G, "l2").unwrap(),
        ] {
            sm.apply(event).await.unwrap();
        }

        let applied = sm
            .apply(TxEvent::saga_aborted(G, Some("user cancelled".into())).unwrap())
            .await
            .unwrap();

        match applied.effects.as_slice() {
            [SideEffect::Compensate(cmd)] => {
                assert_eq!(cmd.local_tx_id.as_str(), "l2");
                assert_eq!(cmd.service_name, "svc-b");
                assert_eq!(cmd.attempt, 1);
            }
            other => panic!("unexpected effects {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_write_halts_until_resumed() {
        let store = InMemoryEventStore::new();
        let mut sm = machine(&store);
        sm.apply(TxEvent::tx_started(G, "l1", "svc", "undo").unwrap())
            .await
            .unwrap();

        store.set_fail_on_append(true);
        let err = sm
            .apply(TxEvent::tx_aborted(G, "l1", "boom").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Domain(_)));
        assert!(sm.is_halted());
        // Nothing was dispatched for the lost abort.
        assert!(sm.side_effects().is_empty());

        let err = sm
            .apply(TxEvent::tx_ended(G, "l1").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Halted { .. }));

        store.set_fail_on_append(false);
        sm.resume().await.unwrap();
        let applied = sm.apply(TxEvent::tx_ended(G, "l1").unwrap()).await.unwrap();
        assert_eq!(applied.ack, Ack::Accepted);
    }

    #[tokio::test]
    async fn snapshots_follow_the_interval() {
        let store = InMemoryEventStore::new();
        let mut sm = SagaStateMachine::new(
            GlobalTxId::parse(G).unwrap(),
            GlobalTransaction::default(),
            store.clone(),
            OutOfOrderPolicy::Strict,
            2,
        );
        sm.apply(TxEvent::saga_started(G).unwrap()).await.unwrap();
        assert!(store.get_snapshot(sm.global_tx_id()).await.unwrap().is_none());
        sm.apply(TxEvent::tx_started(G, "l1", "svc", "undo").unwrap())
            .await
            .unwrap();
        let snapshot = store.get_snapshot(sm.global_tx_id()).await.unwrap().unwrap();
        assert_eq!(snapshot.version.as_i64(), 2);
    }

    #[test]
    fn ack_wire_format() {
        assert_eq!(
            serde_json::to_value(Ack::Accepted).unwrap(),
            serde_json::json!({"result": "accepted"})
        );
        let rejected = serde_json::to_value(Ack::Rejected(RejectReason::OutOfOrder)).unwrap();
        assert_eq!(rejected["result"], "rejected");
        assert_eq!(rejected["reason"], "outOfOrder");
    }
}
