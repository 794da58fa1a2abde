//! The task that owns one saga.
//!
//! Every event for a saga goes through its worker's bounded mailbox, so the
//! aggregate has a single writer and events are applied in arrival order.
//! Compensation calls run in separate tasks and report back through a
//! second channel, keeping the mailbox responsive while an omega is slow.
//!
//! A worker stops writing the moment it closes its mailbox. Whatever was
//! already queued is either answered from the finished saga or passed on to
//! the saga's next worker.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use common::{GlobalTxId, LocalTxId};
use dashmap::DashMap;
use domain::{GlobalTransaction, RejectReason, TxEvent, TxEventType, Verdict};
use event_store::EventStore;
use tokio::sync::mpsc::error::SendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::compensation::{CompensationDriver, CompensationOutcome};
use crate::config::CoordinatorConfig;
use crate::error::Result;
use crate::state_machine::{Ack, SagaStateMachine, SideEffect};

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Sends tried before a message is given up on.
const DELIVERY_ATTEMPTS: usize = 3;

pub(crate) enum Message {
    Event {
        event: TxEvent,
        reply: oneshot::Sender<Result<Ack>>,
    },
    Query {
        reply: oneshot::Sender<GlobalTransaction>,
    },
    Terminate {
        reply: oneshot::Sender<Result<Ack>>,
    },
    Resume {
        reply: oneshot::Sender<Result<()>>,
    },
    /// Asks the worker to leave if its saga is finished.
    Archive {
        reply: oneshot::Sender<bool>,
    },
    Shutdown,
}

pub(crate) struct SagaHandle {
    pub(crate) sender: mpsc::Sender<Message>,
    pub(crate) task: JoinHandle<()>,
    generation: u64,
}

/// State shared by the registry and all of its workers.
pub(crate) struct Shared<S> {
    pub(crate) store: S,
    pub(crate) config: CoordinatorConfig,
    pub(crate) driver: Arc<CompensationDriver>,
    pub(crate) live: DashMap<GlobalTxId, SagaHandle>,
    pub(crate) closed: AtomicBool,
}

impl<S> Shared<S>
where
    S: EventStore + Clone + 'static,
{
    /// Sends to the saga's worker, spawning one if needed. A worker that
    /// closed its mailbox between lookup and send is replaced. The message
    /// comes back if the registry is shutting down.
    pub(crate) async fn deliver(
        self: &Arc<Self>,
        global_tx_id: &GlobalTxId,
        mut message: Message,
    ) -> std::result::Result<(), Message> {
        for _ in 0..DELIVERY_ATTEMPTS {
            if self.closed.load(Ordering::Acquire) {
                break;
            }
            let sender = self.sender(global_tx_id);
            match sender.send(message).await {
                Ok(()) => return Ok(()),
                Err(SendError(returned)) => {
                    message = returned;
                    self.live
                        .remove_if(global_tx_id, |_, handle| handle.sender.same_channel(&sender));
                }
            }
        }
        Err(message)
    }

    fn sender(self: &Arc<Self>, global_tx_id: &GlobalTxId) -> mpsc::Sender<Message> {
        let sender = self
            .live
            .entry(global_tx_id.clone())
            .or_insert_with(|| {
                tracing::debug!(%global_tx_id, "spawning saga worker");
                spawn(Arc::clone(self), global_tx_id.clone(), None)
            })
            .sender
            .clone();
        metrics::gauge!("saga_live_workers").set(self.live.len() as f64);
        sender
    }
}

/// Starts a worker. Without `preloaded` the worker loads the saga itself.
pub(crate) fn spawn<S>(
    shared: Arc<Shared<S>>,
    global_tx_id: GlobalTxId,
    preloaded: Option<GlobalTransaction>,
) -> SagaHandle
where
    S: EventStore + Clone + 'static,
{
    let (sender, mailbox) = mpsc::channel(shared.config.mailbox_capacity);
    let generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
    let task = tokio::spawn(run(shared, global_tx_id, preloaded, mailbox, generation));
    SagaHandle {
        sender,
        task,
        generation,
    }
}

async fn run<S>(
    shared: Arc<Shared<S>>,
    global_tx_id: GlobalTxId,
    preloaded: Option<GlobalTransaction>,
    mailbox: mpsc::Receiver<Message>,
    generation: u64,
) where
    S: EventStore + Clone + 'static,
{
    let policy = shared.config.out_of_order;
    let interval = shared.config.snapshot_interval;
    let machine = match preloaded {
        Some(tx) => SagaStateMachine::new(global_tx_id, tx, shared.store.clone(), policy, interval),
        None => {
            match SagaStateMachine::load(global_tx_id.clone(), shared.store.clone(), policy, interval)
                .await
            {
                Ok(machine) => machine,
                Err(err) => {
                    tracing::error!(%global_tx_id, error = %err, "failed to load saga");
                    let mut machine = SagaStateMachine::new(
                        global_tx_id,
                        GlobalTransaction::default(),
                        shared.store.clone(),
                        policy,
                        interval,
                    );
                    machine.halt(err.to_string());
                    machine
                }
            }
        }
    };

    let (outcomes_tx, outcomes) = mpsc::channel(4);
    let worker = SagaWorker {
        shared,
        machine,
        generation,
        outcomes_tx,
        in_flight: None,
        buffered: Vec::new(),
        started_at: HashMap::new(),
    };
    worker.run(mailbox, outcomes).await;
}

struct InFlight {
    local_tx_id: LocalTxId,
    task: JoinHandle<()>,
}

/// An out-of-order event waiting for the event it depends on.
struct Buffered {
    event: TxEvent,
    reply: oneshot::Sender<Result<Ack>>,
    deadline: Instant,
}

struct SagaWorker<S: EventStore> {
    shared: Arc<Shared<S>>,
    machine: SagaStateMachine<S>,
    generation: u64,
    outcomes_tx: mpsc::Sender<CompensationOutcome>,
    in_flight: Option<InFlight>,
    /// Bounded by the mailbox capacity.
    buffered: Vec<Buffered>,
    /// When each active branch was first seen by this worker.
    started_at: HashMap<LocalTxId, Instant>,
}

impl<S> SagaWorker<S>
where
    S: EventStore + Clone + 'static,
{
    async fn run(
        mut self,
        mut mailbox: mpsc::Receiver<Message>,
        mut outcomes: mpsc::Receiver<CompensationOutcome>,
    ) {
        self.track_active_branches();
        let effects = self.machine.side_effects();
        self.follow_up(effects).await;

        let period = self.shared.config.tick_interval;
        let mut tick = tokio::time::interval_at(Instant::now() + period, period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut archive_reply = None;
        loop {
            tokio::select! {
                message = mailbox.recv() => match message {
                    Some(Message::Shutdown) | None => {
                        if let Some(in_flight) = self.in_flight.take() {
                            in_flight.task.abort();
                        }
                        return;
                    }
                    Some(Message::Archive { reply }) if self.can_archive() => {
                        archive_reply = Some(reply);
                        break;
                    }
                    Some(message) => self.handle(message).await,
                },
                Some(outcome) = outcomes.recv() => self.on_outcome(outcome).await,
                _ = tick.tick() => self.on_tick().await,
            }

            if self.can_archive() {
                break;
            }
        }

        mailbox.close();
        self.archive();
        if let Some(reply) = archive_reply {
            let _ = reply.send(true);
        }
        self.retire(mailbox).await;
    }

    async fn handle(&mut self, message: Message) {
        match message {
            Message::Event { event, reply } => self.on_event(event, reply).await,
            Message::Query { reply } => {
                let _ = reply.send(self.machine.query());
            }
            Message::Terminate { reply } => {
                let result = match TxEvent::saga_terminated(self.machine.global_tx_id().clone()) {
                    Ok(event) => self.apply(event).await,
                    Err(err) => Err(err.into()),
                };
                let _ = reply.send(result);
            }
            Message::Resume { reply } => {
                let result = self.machine.resume().await;
                if result.is_ok() {
                    self.track_active_branches();
                    let effects = self.machine.side_effects();
                    self.follow_up(effects).await;
                    self.retry_buffered().await;
                }
                let _ = reply.send(result);
            }
            Message::Archive { reply } => {
                let _ = reply.send(self.can_archive());
            }
            Message::Shutdown => {}
        }
    }

    async fn on_event(&mut self, event: TxEvent, reply: oneshot::Sender<Result<Ack>>) {
        if !self.machine.is_halted()
            && self.machine.check(&event) == Verdict::Reject(RejectReason::OutOfOrder)
        {
            if self.buffered.len() >= self.shared.config.mailbox_capacity {
                metrics::counter!("saga_events_rejected_total").increment(1);
                tracing::warn!(
                    global_tx_id = %event.global_tx_id,
                    event_type = %event.event_type,
                    waiting = self.buffered.len(),
                    "out-of-order buffer full"
                );
                let _ = reply.send(Ok(Ack::Rejected(RejectReason::OutOfOrder)));
                return;
            }
            metrics::counter!("saga_events_buffered_total").increment(1);
            tracing::debug!(
                global_tx_id = %event.global_tx_id,
                event_type = %event.event_type,
                "buffering out-of-order event"
            );
            let deadline = Instant::now() + self.shared.config.out_of_order_window;
            self.buffered.push(Buffered {
                event,
                reply,
                deadline,
            });
            return;
        }

        let result = self.apply(event).await;
        let accepted = matches!(result, Ok(Ack::Accepted));
        let _ = reply.send(result);
        if accepted {
            self.retry_buffered().await;
        }
    }

    /// Re-validates buffered events until none of them can make progress.
    async fn retry_buffered(&mut self) {
        loop {
            let ready = self.buffered.iter().position(|b| {
                self.machine.check(&b.event) != Verdict::Reject(RejectReason::OutOfOrder)
            });
            let Some(index) = ready else {
                break;
            };
            let entry = self.buffered.remove(index);
            let result = self.apply(entry.event).await;
            let _ = entry.reply.send(result);
        }
    }

    /// Applies an event and carries out whatever the saga needs next.
    async fn apply(&mut self, event: TxEvent) -> Result<Ack> {
        let started = (event.event_type == TxEventType::TxStarted)
            .then(|| event.local_tx_id.clone())
            .flatten();

        let applied = self.machine.apply(event).await?;
        if applied.ack == Ack::Accepted
            && let Some(local_tx_id) = started
        {
            self.started_at.entry(local_tx_id).or_insert_with(Instant::now);
        }
        self.follow_up(applied.effects).await;
        Ok(applied.ack)
    }

    /// Runs side effects, applying any event they produce in turn.
    async fn follow_up(&mut self, mut effects: Vec<SideEffect>) {
        while let Some(event) = self.run_effects(effects) {
            match self.machine.apply(event).await {
                Ok(applied) if applied.ack == Ack::Accepted => effects = applied.effects,
                Ok(_) => break,
                Err(err) => {
                    tracing::error!(
                        global_tx_id = %self.machine.global_tx_id(),
                        error = %err,
                        "failed to record follow-up event"
                    );
                    break;
                }
            }
        }
    }

    /// Dispatches compensation. Returns a suspension event once the branch
    /// at the head of the plan has used up its attempts.
    fn run_effects(&mut self, effects: Vec<SideEffect>) -> Option<TxEvent> {
        for effect in effects {
            let SideEffect::Compensate(command) = effect else {
                continue;
            };
            if self.in_flight.is_some() {
                continue;
            }

            let retries = command.attempt.saturating_sub(1);
            if self.shared.driver.policy().is_exhausted(retries) {
                let reason = format!(
                    "compensation of {} ({}) failed after {} attempts",
                    command.local_tx_id, command.service_name, retries
                );
                return TxEvent::saga_suspended(command.global_tx_id, reason).ok();
            }

            tracing::debug!(
                global_tx_id = %command.global_tx_id,
                local_tx_id = %command.local_tx_id,
                attempt = command.attempt,
                "dispatching compensation"
            );
            let local_tx_id = command.local_tx_id.clone();
            let task = self.shared.driver.dispatch(command, self.outcomes_tx.clone());
            self.in_flight = Some(InFlight { local_tx_id, task });
        }
        None
    }

    async fn on_outcome(&mut self, outcome: CompensationOutcome) {
        if self
            .in_flight
            .as_ref()
            .is_some_and(|f| &f.local_tx_id == outcome.local_tx_id())
        {
            self.in_flight = None;
        }

        let global_tx_id = self.machine.global_tx_id().clone();
        let event = match outcome {
            CompensationOutcome::Succeeded { local_tx_id } => {
                TxEvent::tx_compensated(global_tx_id, local_tx_id)
            }
            CompensationOutcome::Failed {
                local_tx_id,
                attempt,
                error,
            } => TxEvent::tx_compensation_failed(global_tx_id, local_tx_id, attempt, error.to_string()),
        };

        match event {
            Ok(event) => {
                if let Err(err) = self.apply(event).await {
                    tracing::error!(error = %err, "failed to record compensation outcome");
                }
            }
            Err(err) => tracing::error!(error = %err, "invalid compensation outcome"),
        }
    }

    async fn on_tick(&mut self) {
        let now = Instant::now();

        let (expired, waiting): (Vec<_>, Vec<_>) =
            self.buffered.drain(..).partition(|b| b.deadline <= now);
        self.buffered = waiting;
        for entry in expired {
            metrics::counter!("saga_events_rejected_total").increment(1);
            tracing::warn!(
                global_tx_id = %entry.event.global_tx_id,
                event_type = %entry.event.event_type,
                "out-of-order event expired"
            );
            let _ = entry.reply.send(Ok(Ack::Rejected(RejectReason::OutOfOrder)));
        }

        self.abort_overdue_branches(now).await;
    }

    /// Synthesizes an abort for branches running longer than the timeout.
    async fn abort_overdue_branches(&mut self, now: Instant) {
        let Some(timeout) = self.shared.config.branch_timeout else {
            return;
        };
        if self.machine.is_halted() || self.machine.transaction().state().is_closed() {
            return;
        }

        self.track_active_branches();
        let overdue: Vec<LocalTxId> = self
            .started_at
            .iter()
            .filter(|(_, started)| now.duration_since(**started) >= timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for local_tx_id in overdue {
            self.started_at.remove(&local_tx_id);
            let global_tx_id = self.machine.global_tx_id().clone();
            tracing::warn!(%global_tx_id, %local_tx_id, ?timeout, "branch timed out");
            metrics::counter!("saga_branch_timeouts_total").increment(1);

            let reason = format!("branch timed out after {}ms", timeout.as_millis());
            match TxEvent::tx_aborted(global_tx_id, local_tx_id, reason) {
                Ok(event) => {
                    if let Err(err) = self.apply(event).await {
                        tracing::error!(error = %err, "failed to record branch timeout");
                        return;
                    }
                }
                Err(err) => tracing::error!(error = %err, "invalid timeout event"),
            }
        }
    }

    /// Keeps `started_at` in step with the branches that are still running.
    fn track_active_branches(&mut self) {
        let tx = self.machine.transaction();
        self.started_at.retain(|id, _| tx.branch(id).is_some_and(|b| b.is_active()));
        for branch in tx.branches().filter(|b| b.is_active()) {
            self.started_at
                .entry(branch.local_tx_id.clone())
                .or_insert_with(Instant::now);
        }
    }

    /// Finished sagas, and workers for sagas that never started, can leave.
    fn can_archive(&self) -> bool {
        let tx = self.machine.transaction();
        self.in_flight.is_none()
            && (tx.is_finished()
                || (tx.is_new() && self.buffered.is_empty() && !self.machine.is_halted()))
    }

    fn archive(&mut self) {
        let global_tx_id = self.machine.global_tx_id().clone();
        let generation = self.generation;
        self.shared
            .live
            .remove_if(&global_tx_id, |_, handle| handle.generation == generation);
        metrics::gauge!("saga_live_workers").set(self.shared.live.len() as f64);

        let state = self.machine.transaction().state();
        for entry in self.buffered.drain(..) {
            let _ = entry
                .reply
                .send(Ok(Ack::Rejected(RejectReason::SagaClosed { state })));
        }
        if !self.machine.transaction().is_new() {
            tracing::info!(%global_tx_id, %state, "saga archived");
        }
    }

    /// Drains a closed mailbox. A finished saga can no longer be written, so
    /// its messages are answered here; anything else goes to the saga's next
    /// worker, which loads the stream this one left behind.
    async fn retire(mut self, mut mailbox: mpsc::Receiver<Message>) {
        let finished = self.machine.transaction().is_finished();
        let global_tx_id = self.machine.global_tx_id().clone();
        while let Some(message) = mailbox.recv().await {
            match message {
                Message::Shutdown => {}
                message if finished => self.handle(message).await,
                message => {
                    if self.shared.deliver(&global_tx_id, message).await.is_err() {
                        tracing::warn!(%global_tx_id, "dropped message queued for a retired worker");
                    }
                }
            }
        }
    }
}
