//! Saga events reported by omegas or produced by the coordinator itself.

use chrono::{DateTime, Utc};
use common::{GlobalTxId, LocalTxId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregate::DomainEvent;
use crate::error::EventError;

/// Kinds of saga events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxEventType {
    SagaStarted,
    SagaEnded,
    /// Explicit global abort from an omega or an operator.
    SagaAborted,
    TxStarted,
    TxEnded,
    TxAborted,
    TxCompensated,
    /// One failed compensation attempt.
    TxCompensationFailed,
    /// Compensation gave up after exhausting its retries.
    SagaSuspended,
    /// Operator force-terminated a suspended saga.
    SagaTerminated,
}

impl TxEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxEventType::SagaStarted => "SagaStarted",
            TxEventType::SagaEnded => "SagaEnded",
            TxEventType::SagaAborted => "SagaAborted",
            TxEventType::TxStarted => "TxStarted",
            TxEventType::TxEnded => "TxEnded",
            TxEventType::TxAborted => "TxAborted",
            TxEventType::TxCompensated => "TxCompensated",
            TxEventType::TxCompensationFailed => "TxCompensationFailed",
            TxEventType::SagaSuspended => "SagaSuspended",
            TxEventType::SagaTerminated => "SagaTerminated",
        }
    }

    /// Events about a single branch carry a `localTxId`.
    pub fn is_branch_event(&self) -> bool {
        matches!(
            self,
            TxEventType::TxStarted
                | TxEventType::TxEnded
                | TxEventType::TxAborted
                | TxEventType::TxCompensated
                | TxEventType::TxCompensationFailed
        )
    }

    /// Events only the coordinator itself emits while compensating.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            TxEventType::TxCompensated
                | TxEventType::TxCompensationFailed
                | TxEventType::SagaSuspended
        )
    }
}

impl std::fmt::Display for TxEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An immutable saga event.
///
/// Built through the per-type factories, which check the fields each type
/// requires. Events decoded from the wire must go through [`TxEvent::check`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxEvent {
    #[serde(default = "Uuid::new_v4")]
    pub event_id: Uuid,
    #[serde(rename = "type")]
    pub event_type: TxEventType,
    pub global_tx_id: GlobalTxId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_tx_id: Option<LocalTxId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_tx_id: Option<LocalTxId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    /// The omega instance that reported the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    /// Opaque descriptor of the undo operation, echoed back on compensation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_info: Option<String>,
    /// 1-based attempt number of a failed compensation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for TxEvent {
    fn event_type(&self) -> &'static str {
        self.event_type.as_str()
    }
}

// Factories
impl TxEvent {
    fn new(event_type: TxEventType, global_tx_id: impl Into<String>) -> Result<Self, EventError> {
        Ok(Self {
            event_id: Uuid::new_v4(),
            event_type,
            global_tx_id: GlobalTxId::parse(global_tx_id)?,
            local_tx_id: None,
            parent_tx_id: None,
            service_name: None,
            instance_id: None,
            compensation_method: None,
            payload: None,
            error_info: None,
            attempt: None,
            timestamp: Utc::now(),
        })
    }

    fn for_branch(
        event_type: TxEventType,
        global_tx_id: impl Into<String>,
        local_tx_id: impl Into<String>,
    ) -> Result<Self, EventError> {
        let mut event = Self::new(event_type, global_tx_id)?;
        event.local_tx_id = Some(LocalTxId::parse(local_tx_id)?);
        Ok(event)
    }

    pub fn saga_started(global_tx_id: impl Into<String>) -> Result<Self, EventError> {
        Self::new(TxEventType::SagaStarted, global_tx_id)
    }

    pub fn saga_ended(global_tx_id: impl Into<String>) -> Result<Self, EventError> {
        Self::new(TxEventType::SagaEnded, global_tx_id)
    }

    pub fn saga_aborted(
        global_tx_id: impl Into<String>,
        error_info: Option<String>,
    ) -> Result<Self, EventError> {
        let mut event = Self::new(TxEventType::SagaAborted, global_tx_id)?;
        event.error_info = error_info;
        Ok(event)
    }

    pub fn tx_started(
        global_tx_id: impl Into<String>,
        local_tx_id: impl Into<String>,
        service_name: impl Into<String>,
        compensation_method: impl Into<String>,
    ) -> Result<Self, EventError> {
        let mut event = Self::for_branch(TxEventType::TxStarted, global_tx_id, local_tx_id)?;
        event.service_name = Some(service_name.into());
        event.compensation_method = Some(compensation_method.into());
        event.check()
    }

    pub fn tx_ended(
        global_tx_id: impl Into<String>,
        local_tx_id: impl Into<String>,
    ) -> Result<Self, EventError> {
        Self::for_branch(TxEventType::TxEnded, global_tx_id, local_tx_id)
    }

    /// Fails without a non-blank `error_info`.
    pub fn tx_aborted(
        global_tx_id: impl Into<String>,
        local_tx_id: impl Into<String>,
        error_info: impl Into<String>,
    ) -> Result<Self, EventError> {
        let mut event = Self::for_branch(TxEventType::TxAborted, global_tx_id, local_tx_id)?;
        event.error_info = Some(error_info.into());
        event.check()
    }

    pub fn tx_compensated(
        global_tx_id: impl Into<String>,
        local_tx_id: impl Into<String>,
    ) -> Result<Self, EventError> {
        Self::for_branch(TxEventType::TxCompensated, global_tx_id, local_tx_id)
    }

    pub fn tx_compensation_failed(
        global_tx_id: impl Into<String>,
        local_tx_id: impl Into<String>,
        attempt: u32,
        error_info: impl Into<String>,
    ) -> Result<Self, EventError> {
        let mut event =
            Self::for_branch(TxEventType::TxCompensationFailed, global_tx_id, local_tx_id)?;
        event.attempt = Some(attempt);
        event.error_info = Some(error_info.into());
        event.check()
    }

    pub fn saga_suspended(
        global_tx_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Result<Self, EventError> {
        let mut event = Self::new(TxEventType::SagaSuspended, global_tx_id)?;
        event.error_info = Some(reason.into());
        event.check()
    }

    pub fn saga_terminated(global_tx_id: impl Into<String>) -> Result<Self, EventError> {
        Self::new(TxEventType::SagaTerminated, global_tx_id)
    }

    /// Checks the fields required by the event type.
    ///
    /// Ids are already non-blank by construction.
    pub fn check(self) -> Result<Self, EventError> {
        let event_type = self.event_type.as_str();
        let missing = move |field| EventError::MissingField { event_type, field };
        let blank = |value: &Option<String>| value.as_deref().is_none_or(|v| v.trim().is_empty());

        if self.event_type.is_branch_event() && self.local_tx_id.is_none() {
            return Err(missing("localTxId"));
        }
        match self.event_type {
            TxEventType::TxStarted if blank(&self.service_name) => Err(missing("serviceName")),
            TxEventType::TxStarted if blank(&self.compensation_method) => {
                Err(missing("compensationMethod"))
            }
            TxEventType::TxAborted
            | TxEventType::TxCompensationFailed
            | TxEventType::SagaSuspended
                if blank(&self.error_info) =>
            {
                Err(missing("errorInfo"))
            }
            TxEventType::TxCompensationFailed if self.attempt.is_none() => Err(missing("attempt")),
            _ => Ok(self),
        }
    }
}

// Optional attributes
impl TxEvent {
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_instance(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn with_service(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = Some(service_name.into());
        self
    }

    pub fn with_parent(mut self, parent_tx_id: LocalTxId) -> Self {
        self.parent_tx_id = Some(parent_tx_id);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_error_info(mut self, error_info: impl Into<String>) -> Self {
        self.error_info = Some(error_info.into());
        self
    }
}
