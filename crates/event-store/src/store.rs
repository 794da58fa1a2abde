use async_trait::async_trait;

use crate::{EventEnvelope, EventStoreError, GlobalTxId, Result, Snapshot, Version};

/// Options for appending events to a stream.
#[derive(Debug, Clone, Default)]
pub struct AppendOptions {
    /// Expected version of the stream for optimistic concurrency control.
    /// If None, no version check is performed.
    pub expected_version: Option<Version>,
}

impl AppendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect_version(version: Version) -> Self {
        Self {
            expected_version: Some(version),
        }
    }
}

/// Durable, append-only event log shared by all saga workers.
///
/// Each saga writes only to its own stream, so implementations only have to
/// serialize concurrent appends to the *same* stream (optimistic version
/// check); appends to different streams never contend on a saga-level lock.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends events atomically and returns the new stream version.
    ///
    /// Fails with `ConcurrencyConflict` if `options.expected_version` does
    /// not match the current version.
    async fn append(&self, events: Vec<EventEnvelope>, options: AppendOptions) -> Result<Version>;

    /// Reads the whole stream of a saga, oldest first.
    async fn get_events(&self, global_tx_id: &GlobalTxId) -> Result<Vec<EventEnvelope>>;

    /// Reads a stream starting at `from_version` (inclusive).
    async fn get_events_from_version(
        &self,
        global_tx_id: &GlobalTxId,
        from_version: Version,
    ) -> Result<Vec<EventEnvelope>>;

    /// Lists every saga that has at least one event, in order of first append.
    async fn list_streams(&self) -> Result<Vec<GlobalTxId>>;

    /// Returns None if the stream doesn't exist.
    async fn get_version(&self, global_tx_id: &GlobalTxId) -> Result<Option<Version>>;

    /// Saves a snapshot, replacing any previous one for the saga.
    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<()>;

    async fn get_snapshot(&self, global_tx_id: &GlobalTxId) -> Result<Option<Snapshot>>;
}

/// Convenience methods available on every [`EventStore`].
#[async_trait]
pub trait EventStoreExt: EventStore {
    async fn append_event(&self, event: EventEnvelope, options: AppendOptions) -> Result<Version> {
        self.append(vec![event], options).await
    }

    async fn stream_exists(&self, global_tx_id: &GlobalTxId) -> Result<bool> {
        Ok(self.get_version(global_tx_id).await?.is_some())
    }

    /// Loads the latest snapshot (if any) and the events recorded after it.
    async fn load_stream(
        &self,
        global_tx_id: &GlobalTxId,
    ) -> Result<(Option<Snapshot>, Vec<EventEnvelope>)> {
        if let Some(snapshot) = self.get_snapshot(global_tx_id).await? {
            let events = self
                .get_events_from_version(global_tx_id, snapshot.version.next())
                .await?;
            Ok((Some(snapshot), events))
        } else {
            let events = self.get_events(global_tx_id).await?;
            Ok((None, events))
        }
    }
}

impl<T: EventStore + ?Sized> EventStoreExt for T {}

#[async_trait]
impl<T: EventStore + ?Sized> EventStore for std::sync::Arc<T> {
    async fn append(&self, events: Vec<EventEnvelope>, options: AppendOptions) -> Result<Version> {
        (**self).append(events, options).await
    }

    async fn get_events(&self, global_tx_id: &GlobalTxId) -> Result<Vec<EventEnvelope>> {
        (**self).get_events(global_tx_id).await
    }

    async fn get_events_from_version(
        &self,
        global_tx_id: &GlobalTxId,
        from_version: Version,
    ) -> Result<Vec<EventEnvelope>> {
        (**self)
            .get_events_from_version(global_tx_id, from_version)
            .await
    }

    async fn list_streams(&self) -> Result<Vec<GlobalTxId>> {
        (**self).list_streams().await
    }

    async fn get_version(&self, global_tx_id: &GlobalTxId) -> Result<Option<Version>> {
        (**self).get_version(global_tx_id).await
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        (**self).save_snapshot(snapshot).await
    }

    async fn get_snapshot(&self, global_tx_id: &GlobalTxId) -> Result<Option<Snapshot>> {
        (**self).get_snapshot(global_tx_id).await
    }
}

/// Checks that a batch targets a single stream with consecutive versions.
pub fn validate_events_for_append(events: &[EventEnvelope]) -> Result<()> {
    let Some(first) = events.first() else {
        return Err(EventStoreError::InvalidAppend(
            "cannot append an empty event list".to_string(),
        ));
    };

    let mut expected_version = first.version;
    for event in events.iter().skip(1) {
        if event.global_tx_id != first.global_tx_id {
            return Err(EventStoreError::InvalidAppend(
                "all events must belong to the same saga".to_string(),
            ));
        }
        expected_version = expected_version.next();
        if event.version != expected_version {
            return Err(EventStoreError::InvalidAppend(format!(
                "event versions must be sequential: expected {}, got {}",
                expected_version, event.version
            )));
        }
    }

    Ok(())
}
