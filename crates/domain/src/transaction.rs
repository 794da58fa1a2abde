//! The global transaction aggregate.

use chrono::{DateTime, Utc};
use common::{GlobalTxId, LocalTxId};
use event_store::Version;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::aggregate::{Aggregate, SnapshotCapable};
use crate::events::{TxEvent, TxEventType};
use crate::state::{BranchState, SagaState};

/// One service's local transaction within a saga.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Branch {
    pub local_tx_id: LocalTxId,
    pub state: BranchState,
    pub parent_tx_id: Option<LocalTxId>,
    pub service_name: Option<String>,
    /// Omega instance that reported the start.
    pub instance_id: Option<String>,
    pub compensation_method: Option<String>,
    pub payload: Option<serde_json::Value>,
    /// Failed compensation attempts so far.
    pub retries: u32,
    pub begin_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Position in commit order, starting at 1.
    pub commit_seq: Option<u64>,
    /// Ended after compensation had already begun; never becomes COMMITTED.
    pub late_commit: bool,
    pub error_info: Option<String>,
}

impl Branch {
    fn from_event(local_tx_id: LocalTxId, event: &TxEvent) -> Self {
        Self {
            local_tx_id,
            state: BranchState::Started,
            parent_tx_id: event.parent_tx_id.clone(),
            service_name: event.service_name.clone(),
            instance_id: event.instance_id.clone(),
            compensation_method: event.compensation_method.clone(),
            payload: event.payload.clone(),
            retries: 0,
            begin_time: event.timestamp,
            end_time: None,
            commit_seq: None,
            late_commit: false,
            error_info: None,
        }
    }

    /// Committed work that still has to be undone.
    pub fn needs_compensation(&self) -> bool {
        self.state == BranchState::Committed
            || (self.state == BranchState::Started && self.late_commit)
    }

    /// Still running in the participant.
    pub fn is_active(&self) -> bool {
        self.state == BranchState::Started && !self.late_commit
    }
}

/// An event-sourced saga spanning several services.
///
/// Mutated only through [`Aggregate::apply`]; legality of each event is
/// decided beforehand by [`crate::validate_event`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalTransaction {
    global_tx_id: Option<GlobalTxId>,
    version: Version,
    #[serde(rename = "lastState")]
    state: SagaState,
    begin_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    branches: IndexMap<LocalTxId, Branch>,
    saga_ended: bool,
    abort_reason: Option<String>,
    suspended_reason: Option<String>,
    terminated: bool,
    next_commit_seq: u64,
}

impl Aggregate for GlobalTransaction {
    type Event = TxEvent;

    fn aggregate_type() -> &'static str {
        "GlobalTransaction"
    }

    fn id(&self) -> Option<GlobalTxId> {
        self.global_tx_id.clone()
    }

    fn version(&self) -> Version {
        self.version
    }

    fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    fn apply(&mut self, event: TxEvent) {
        if self.global_tx_id.is_none() {
            self.global_tx_id = Some(event.global_tx_id.clone());
        }
        if self.begin_time.is_none() {
            self.begin_time = Some(event.timestamp);
        }
        let at = event.timestamp;

        match event.event_type {
            TxEventType::SagaStarted => {}
            TxEventType::SagaEnded => self.saga_ended = true,
            TxEventType::SagaAborted => {
                let reason = event
                    .error_info
                    .clone()
                    .unwrap_or_else(|| "saga aborted".to_string());
                self.begin_compensation(reason);
            }
            TxEventType::TxStarted => {
                if let Some(local_tx_id) = event.local_tx_id.clone() {
                    self.branches
                        .entry(local_tx_id.clone())
                        .or_insert_with(|| Branch::from_event(local_tx_id, &event));
                }
            }
            TxEventType::TxEnded => {
                let compensating = self.state == SagaState::Compensating;
                let seq = self.take_commit_seq();
                if let Some(branch) = self.branch_entry(&event) {
                    branch.commit_seq = Some(seq);
                    branch.end_time = Some(at);
                    if compensating {
                        branch.late_commit = true;
                    } else {
                        branch.state = BranchState::Committed;
                    }
                }
            }
            TxEventType::TxAborted => {
                let reason = event.error_info.clone().unwrap_or_default();
                if let Some(branch) = self.branch_entry(&event) {
                    branch.state = BranchState::Failed;
                    branch.end_time = Some(at);
                    branch.error_info = Some(reason.clone());
                }
                self.begin_compensation(reason);
            }
            TxEventType::TxCompensated => {
                if let Some(branch) = self.branch_mut(&event) {
                    branch.state = BranchState::Compensated;
                    branch.late_commit = false;
                    branch.end_time = Some(at);
                }
            }
            TxEventType::TxCompensationFailed => {
                if let Some(branch) = self.branch_mut(&event) {
                    branch.retries = branch.retries.max(event.attempt.unwrap_or(branch.retries + 1));
                    branch.error_info = event.error_info.clone();
                }
            }
            TxEventType::SagaSuspended => {
                self.state = SagaState::Suspended;
                self.suspended_reason = event.error_info.clone();
            }
            TxEventType::SagaTerminated => {
                self.terminated = true;
                self.end_time = Some(self.clamp_end(at));
            }
        }

        self.settle(at);
    }
}

impl SnapshotCapable for GlobalTransaction {}

// State transitions
impl GlobalTransaction {
    fn begin_compensation(&mut self, reason: String) {
        if self.state == SagaState::Started {
            self.state = SagaState::Compensating;
            self.abort_reason = Some(reason);
        }
    }

    /// Moves to a terminal state once the branch set allows it.
    fn settle(&mut self, at: DateTime<Utc>) {
        let next = match self.state {
            SagaState::Started
                if self.saga_ended
                    && self
                        .branches
                        .values()
                        .all(|b| b.state == BranchState::Committed) =>
            {
                SagaState::Committed
            }
            SagaState::Compensating
                if self.branches.values().all(|b| {
                    matches!(b.state, BranchState::Compensated | BranchState::Failed)
                }) =>
            {
                SagaState::Compensated
            }
            _ => return,
        };
        self.state = next;
        self.end_time = Some(self.clamp_end(at));
    }

    fn clamp_end(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        self.begin_time.map_or(at, |begin| at.max(begin))
    }

    fn take_commit_seq(&mut self) -> u64 {
        self.next_commit_seq += 1;
        self.next_commit_seq
    }

    fn branch_mut(&mut self, event: &TxEvent) -> Option<&mut Branch> {
        event
            .local_tx_id
            .as_ref()
            .and_then(|id| self.branches.get_mut(id))
    }

    /// Looks up the branch, creating it for an end or abort that arrived
    /// without a start.
    fn branch_entry(&mut self, event: &TxEvent) -> Option<&mut Branch> {
        let local_tx_id = event.local_tx_id.clone()?;
        Some(
            self.branches
                .entry(local_tx_id.clone())
                .or_insert_with(|| Branch::from_event(local_tx_id, event)),
        )
    }
}

// Query methods
impl GlobalTransaction {
    pub fn state(&self) -> SagaState {
        self.state
    }

    pub fn begin_time(&self) -> Option<DateTime<Utc>> {
        self.begin_time
    }

    /// Unset until the saga is terminal or terminated.
    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    /// Branches in arrival order.
    pub fn branches(&self) -> impl Iterator<Item = &Branch> {
        self.branches.values()
    }

    pub fn branch(&self, local_tx_id: &LocalTxId) -> Option<&Branch> {
        self.branches.get(local_tx_id)
    }

    pub fn branch_count(&self) -> usize {
        self.branches.len()
    }

    pub fn saga_ended(&self) -> bool {
        self.saga_ended
    }

    pub fn abort_reason(&self) -> Option<&str> {
        self.abort_reason.as_deref()
    }

    pub fn suspended_reason(&self) -> Option<&str> {
        self.suspended_reason.as_deref()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// True once the saga can be archived: COMMITTED, COMPENSATED, or
    /// SUSPENDED and force-terminated.
    pub fn is_finished(&self) -> bool {
        self.state.is_terminal() || self.terminated
    }

    /// True before the first event has been applied.
    pub fn is_new(&self) -> bool {
        self.global_tx_id.is_none()
    }

    /// Branches still to compensate, last committed first.
    pub fn compensation_plan(&self) -> Vec<&Branch> {
        let mut plan: Vec<&Branch> = self
            .branches
            .values()
            .filter(|b| b.needs_compensation())
            .collect();
        plan.sort_by(|a, b| b.commit_seq.cmp(&a.commit_seq));
        plan
    }

    /// The branch the driver should compensate now, if any.
    pub fn next_compensation(&self) -> Option<&Branch> {
        if self.state != SagaState::Compensating {
            return None;
        }
        self.branches
            .values()
            .filter(|b| b.needs_compensation())
            .max_by_key(|b| b.commit_seq)
    }

    /// Branches STARTED at or before `deadline` that have not ended yet.
    pub fn branches_started_before(&self, deadline: DateTime<Utc>) -> Vec<&Branch> {
        self.branches
            .values()
            .filter(|b| b.is_active() && b.begin_time <= deadline)
            .collect()
    }
}
