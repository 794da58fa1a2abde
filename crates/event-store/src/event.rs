use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{EventStoreError, GlobalTxId};

/// Unique identifier for a persisted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new random event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an event ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EventId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Position of an event within its saga stream.
///
/// The first event of a stream has version 1; each append increments it by
/// one. Version 0 denotes an empty stream.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Version of a stream with no events.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Version of the first event in a stream.
    pub fn first() -> Self {
        Self(1)
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// A persisted record: one domain event plus what the log needs to order
/// and replay it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique identifier for this record.
    pub event_id: EventId,

    /// The type of the event (e.g. "TxStarted", "TxCompensated").
    pub event_type: String,

    /// The saga stream this event belongs to.
    pub global_tx_id: GlobalTxId,

    /// The aggregate type stored in the stream (e.g. "GlobalTransaction").
    pub aggregate_type: String,

    /// Version of the stream after this event.
    pub version: Version,

    /// When the record was written.
    pub timestamp: DateTime<Utc>,

    /// The event payload as JSON.
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    pub fn builder() -> EventEnvelopeBuilder {
        EventEnvelopeBuilder::default()
    }
}

/// Builder for [`EventEnvelope`].
#[derive(Debug, Default)]
pub struct EventEnvelopeBuilder {
    event_type: Option<String>,
    global_tx_id: Option<GlobalTxId>,
    aggregate_type: Option<String>,
    version: Option<Version>,
    payload: Option<serde_json::Value>,
}

impl EventEnvelopeBuilder {
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn global_tx_id(mut self, id: GlobalTxId) -> Self {
        self.global_tx_id = Some(id);
        self
    }

    pub fn aggregate_type(mut self, aggregate_type: impl Into<String>) -> Self {
        self.aggregate_type = Some(aggregate_type.into());
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    /// Sets the payload from a serializable value.
    pub fn payload<T: Serialize>(mut self, payload: &T) -> Result<Self, serde_json::Error> {
        self.payload = Some(serde_json::to_value(payload)?);
        Ok(self)
    }

    pub fn payload_raw(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Builds the envelope.
    ///
    /// # Panics
    ///
    /// Panics if event_type, global_tx_id, aggregate_type, version or payload
    /// is missing. Use [`try_build`](Self::try_build) outside of tests.
    pub fn build(self) -> EventEnvelope {
        match self.try_build() {
            Ok(envelope) => envelope,
            Err(e) => panic!("{e}"),
        }
    }

    /// Builds the envelope, reporting the first missing field.
    pub fn try_build(self) -> Result<EventEnvelope, EventStoreError> {
        fn required<T>(value: Option<T>, field: &str) -> Result<T, EventStoreError> {
            value.ok_or_else(|| EventStoreError::InvalidAppend(format!("{field} is required")))
        }

        Ok(EventEnvelope {
            event_id: EventId::new(),
            event_type: required(self.event_type, "event_type")?,
            global_tx_id: required(self.global_tx_id, "global_tx_id")?,
            aggregate_type: required(self.aggregate_type, "aggregate_type")?,
            version: required(self.version, "version")?,
            timestamp: Utc::now(),
            payload: required(self.payload, "payload")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_ordering() {
        let v1 = Version::new(1);
        let v2 = Version::new(2);
        assert!(v1 < v2);
        assert_eq!(v1.next(), v2);
        assert_eq!(Version::initial().next(), Version::first());
    }

    #[test]
    fn event_envelope_builder() {
        let global_tx_id = GlobalTxId::new();
        let payload = serde_json::json!({"local_tx_id": "l-1"});

        let envelope = EventEnvelope::builder()
            .event_type("TxStarted")
            .global_tx_id(global_tx_id.clone())
            .aggregate_type("GlobalTransaction")
            .version(Version::first())
            .payload_raw(payload.clone())
            .build();

        assert_eq!(envelope.event_type, "TxStarted");
        assert_eq!(envelope.global_tx_id, global_tx_id);
        assert_eq!(envelope.version, Version::first());
        assert_eq!(envelope.payload, payload);
    }

    #[test]
    fn try_build_names_missing_field() {
        let err = EventEnvelope::builder()
            .event_type("TxStarted")
            .try_build()
            .unwrap_err();
        assert!(err.to_string().contains("global_tx_id"));
    }
}
