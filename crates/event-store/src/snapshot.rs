use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{GlobalTxId, Version};

/// Serialized aggregate state of a saga at a given stream version.
///
/// Replay starts from the latest snapshot and folds only the events that
/// follow it. A store keeps at most one snapshot per saga.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub global_tx_id: GlobalTxId,
    pub aggregate_type: String,

    /// Stream version the state corresponds to.
    pub version: Version,

    pub timestamp: DateTime<Utc>,
    pub state: serde_json::Value,
}

impl Snapshot {
    pub fn new(
        global_tx_id: GlobalTxId,
        aggregate_type: impl Into<String>,
        version: Version,
        state: serde_json::Value,
    ) -> Self {
        Self {
            global_tx_id,
            aggregate_type: aggregate_type.into(),
            version,
            timestamp: Utc::now(),
            state,
        }
    }

    /// Creates a snapshot from a serializable state.
    pub fn from_state<T: Serialize>(
        global_tx_id: GlobalTxId,
        aggregate_type: impl Into<String>,
        version: Version,
        state: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(
            global_tx_id,
            aggregate_type,
            version,
            serde_json::to_value(state)?,
        ))
    }

    /// Deserializes the snapshot state into a concrete type.
    pub fn into_state<T: for<'de> Deserialize<'de>>(self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.state)
    }
}
