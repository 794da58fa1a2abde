//! Routes events to per-saga workers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use common::GlobalTxId;
use dashmap::DashMap;
use domain::{EventSourcedRepository, GlobalTransaction, TxEvent};
use event_store::{EventStore, EventStoreExt};
use tokio::sync::oneshot;

use crate::callback::CallbackRegistry;
use crate::compensation::CompensationDriver;
use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, Result};
use crate::recovery::{RecoveryLoader, RecoveryReport};
use crate::state_machine::Ack;
use crate::worker::{self, Message, Shared};

/// Index of live sagas and the entry point for everything sent to them.
///
/// Each live saga has one worker; a worker is spawned on the first event
/// for an unknown saga and removes itself once the saga is finished, or once
/// the first event for an unknown saga has been refused. Events for
/// different sagas never wait on each other.
pub struct SagaRegistry<S: EventStore + Clone + 'static> {
    shared: Arc<Shared<S>>,
}

impl<S: EventStore + Clone + 'static> Clone for SagaRegistry<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: EventStore + Clone + 'static> SagaRegistry<S> {
    pub fn new(store: S, callbacks: Arc<CallbackRegistry>, config: CoordinatorConfig) -> Self {
        let driver = Arc::new(CompensationDriver::new(callbacks, config.retry.clone()));
        Self {
            shared: Arc::new(Shared {
                store,
                config,
                driver,
                live: DashMap::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn store(&self) -> &S {
        &self.shared.store
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.shared.config
    }

    pub fn callbacks(&self) -> &Arc<CallbackRegistry> {
        self.shared.driver.callbacks()
    }

    /// Delivers an event to its saga and waits for the acknowledgement.
    ///
    /// Senders wait while the saga's mailbox is full.
    #[tracing::instrument(
        skip(self, event),
        fields(global_tx_id = %event.global_tx_id, event_type = %event.event_type)
    )]
    pub async fn route_event(&self, event: TxEvent) -> Result<Ack> {
        let event = event.check()?;
        let global_tx_id = event.global_tx_id.clone();
        let (reply, response) = oneshot::channel();
        self.send(&global_tx_id, Message::Event { event, reply })
            .await?;
        response
            .await
            .map_err(|_| CoordinatorError::WorkerUnavailable(global_tx_id))?
    }

    /// Current view of a saga, live or archived.
    pub async fn query(&self, global_tx_id: &GlobalTxId) -> Result<GlobalTransaction> {
        let sender = self
            .shared
            .live
            .get(global_tx_id)
            .map(|handle| handle.sender.clone());
        if let Some(sender) = sender {
            let (reply, response) = oneshot::channel();
            if sender.send(Message::Query { reply }).await.is_ok()
                && let Ok(tx) = response.await
                && !tx.is_new()
            {
                return Ok(tx);
            }
        }

        let repo = EventSourcedRepository::<S, GlobalTransaction>::new(self.shared.store.clone());
        repo.load_existing(global_tx_id)
            .await?
            .ok_or_else(|| CoordinatorError::NotFound(global_tx_id.clone()))
    }

    /// Decoded event history of a saga in log order.
    pub async fn history(&self, global_tx_id: &GlobalTxId) -> Result<Vec<TxEvent>> {
        let repo = EventSourcedRepository::<S, GlobalTransaction>::new(self.shared.store.clone());
        let events = repo.history(global_tx_id).await?;
        if events.is_empty() {
            return Err(CoordinatorError::NotFound(global_tx_id.clone()));
        }
        Ok(events)
    }

    /// Drops a finished saga from the live index.
    ///
    /// Workers archive themselves once their saga is finished; this asks for
    /// it explicitly. Returns false, leaving the worker in place, while the
    /// saga still has work to do.
    pub async fn archive(&self, global_tx_id: &GlobalTxId) -> bool {
        let sender = self
            .shared
            .live
            .get(global_tx_id)
            .map(|handle| handle.sender.clone());
        let Some(sender) = sender else {
            return false;
        };
        let (reply, response) = oneshot::channel();
        if sender.send(Message::Archive { reply }).await.is_err() {
            // Already on its way out.
            return !self.is_live(global_tx_id);
        }
        response.await.unwrap_or(false)
    }

    pub fn is_live(&self, global_tx_id: &GlobalTxId) -> bool {
        self.shared.live.contains_key(global_tx_id)
    }

    pub fn live_count(&self) -> usize {
        self.shared.live.len()
    }

    /// Rebuilds unfinished sagas from the log and gives each a worker.
    ///
    /// Sagas that are already live are left alone, so calling this again is
    /// harmless.
    pub async fn recover_all(&self) -> Result<RecoveryReport> {
        let loader = RecoveryLoader::new(self.shared.store.clone());
        let (sagas, report) = loader.load_all().await?;
        for (global_tx_id, tx) in report.recovered.iter().cloned().zip(sagas) {
            let shared = Arc::clone(&self.shared);
            self.shared
                .live
                .entry(global_tx_id.clone())
                .or_insert_with(|| worker::spawn(shared, global_tx_id, Some(tx)));
        }
        metrics::gauge!("saga_live_workers").set(self.shared.live.len() as f64);
        Ok(report)
    }

    /// Operator action: close a SUSPENDED saga.
    pub async fn terminate(&self, global_tx_id: &GlobalTxId) -> Result<Ack> {
        self.ensure_exists(global_tx_id).await?;
        let (reply, response) = oneshot::channel();
        self.send(global_tx_id, Message::Terminate { reply }).await?;
        response
            .await
            .map_err(|_| CoordinatorError::WorkerUnavailable(global_tx_id.clone()))?
    }

    /// Operator action: reload a halted saga from the log and carry on.
    pub async fn resume(&self, global_tx_id: &GlobalTxId) -> Result<()> {
        self.ensure_exists(global_tx_id).await?;
        let (reply, response) = oneshot::channel();
        self.send(global_tx_id, Message::Resume { reply }).await?;
        response
            .await
            .map_err(|_| CoordinatorError::WorkerUnavailable(global_tx_id.clone()))?
    }

    /// Stops every worker and waits for them to exit.
    pub async fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::Release);
        let ids: Vec<GlobalTxId> = self
            .shared
            .live
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        tracing::info!(workers = ids.len(), "stopping saga workers");

        for global_tx_id in ids {
            if let Some((_, handle)) = self.shared.live.remove(&global_tx_id) {
                let _ = handle.sender.send(Message::Shutdown).await;
                if let Err(err) = handle.task.await {
                    tracing::warn!(%global_tx_id, error = %err, "saga worker ended abnormally");
                }
            }
        }
    }

    async fn ensure_exists(&self, global_tx_id: &GlobalTxId) -> Result<()> {
        if self.is_live(global_tx_id) || self.shared.store.stream_exists(global_tx_id).await? {
            Ok(())
        } else {
            Err(CoordinatorError::NotFound(global_tx_id.clone()))
        }
    }

    async fn send(&self, global_tx_id: &GlobalTxId, message: Message) -> Result<()> {
        self.shared
            .deliver(global_tx_id, message)
            .await
            .map_err(|_| CoordinatorError::WorkerUnavailable(global_tx_id.clone()))
    }
}
