use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    EventEnvelope, EventStoreError, GlobalTxId, Result, Snapshot, Version,
    store::{AppendOptions, EventStore, validate_events_for_append},
};

#[derive(Default)]
struct Inner {
    /// Every event in insertion order.
    log: Vec<EventEnvelope>,
    /// Indices into `log`, per saga.
    streams: HashMap<GlobalTxId, Vec<usize>>,
    /// Sagas in order of their first append.
    order: Vec<GlobalTxId>,
    snapshots: HashMap<GlobalTxId, Snapshot>,
}

impl Inner {
    fn stream(&self, global_tx_id: &GlobalTxId) -> impl Iterator<Item = &EventEnvelope> {
        self.streams
            .get(global_tx_id)
            .into_iter()
            .flatten()
            .map(|&idx| &self.log[idx])
    }

    fn version(&self, global_tx_id: &GlobalTxId) -> Option<Version> {
        self.stream(global_tx_id).map(|e| e.version).max()
    }
}

/// In-memory event store used by tests and by the coordinator when no
/// database is configured.
///
/// Appends can be made to fail or to stall on demand to exercise the
/// coordinator's persistence-failure handling.
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    inner: Arc<RwLock<Inner>>,
    fail_on_append: Arc<AtomicBool>,
    append_delay_ms: Arc<AtomicU64>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of events stored.
    pub async fn event_count(&self) -> usize {
        self.inner.read().await.log.len()
    }

    /// Makes every subsequent append fail with `Unavailable` until reset.
    pub fn set_fail_on_append(&self, fail: bool) {
        self.fail_on_append.store(fail, Ordering::SeqCst);
    }

    /// Makes every append wait before it touches the log, simulating a slow
    /// database. `None` switches it off.
    pub fn set_append_delay(&self, delay: Option<Duration>) {
        let millis = delay.map_or(0, |d| d.as_millis() as u64);
        self.append_delay_ms.store(millis, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, events: Vec<EventEnvelope>, options: AppendOptions) -> Result<Version> {
        validate_events_for_append(&events)?;

        if self.fail_on_append.load(Ordering::SeqCst) {
            return Err(EventStoreError::Unavailable(
                "in-memory store configured to fail appends".to_string(),
            ));
        }

        let delay = self.append_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let global_tx_id = events[0].global_tx_id.clone();
        let mut inner = self.inner.write().await;
        let current_version = inner.version(&global_tx_id).unwrap_or(Version::initial());

        if let Some(expected) = options.expected_version
            && current_version != expected
        {
            return Err(EventStoreError::ConcurrencyConflict {
                global_tx_id,
                expected,
                actual: current_version,
            });
        }

        // Unique (stream, version) constraint, as enforced by the database.
        if events[0].version <= current_version {
            return Err(EventStoreError::ConcurrencyConflict {
                global_tx_id,
                expected: options.expected_version.unwrap_or(current_version),
                actual: current_version,
            });
        }

        let last_version = events
            .last()
            .map(|e| e.version)
            .unwrap_or(current_version);

        if !inner.streams.contains_key(&global_tx_id) {
            inner.order.push(global_tx_id.clone());
        }
        for event in events {
            let idx = inner.log.len();
            inner.log.push(event);
            inner
                .streams
                .entry(global_tx_id.clone())
                .or_default()
                .push(idx);
        }

        Ok(last_version)
    }

    async fn get_events(&self, global_tx_id: &GlobalTxId) -> Result<Vec<EventEnvelope>> {
        let inner = self.inner.read().await;
        let mut events: Vec<_> = inner.stream(global_tx_id).cloned().collect();
        events.sort_by_key(|e| e.version);
        Ok(events)
    }

    async fn get_events_from_version(
        &self,
        global_tx_id: &GlobalTxId,
        from_version: Version,
    ) -> Result<Vec<EventEnvelope>> {
        let inner = self.inner.read().await;
        let mut events: Vec<_> = inner
            .stream(global_tx_id)
            .filter(|e| e.version >= from_version)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.version);
        Ok(events)
    }

    async fn list_streams(&self) -> Result<Vec<GlobalTxId>> {
        Ok(self.inner.read().await.order.clone())
    }

    async fn get_version(&self, global_tx_id: &GlobalTxId) -> Result<Option<Version>> {
        Ok(self.inner.read().await.version(global_tx_id))
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .snapshots
            .insert(snapshot.global_tx_id.clone(), snapshot);
        Ok(())
    }

    async fn get_snapshot(&self, global_tx_id: &GlobalTxId) -> Result<Option<Snapshot>> {
        Ok(self.inner.read().await.snapshots.get(global_tx_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventStoreExt;

    fn create_test_event(global_tx_id: &GlobalTxId, version: i64, event_type: &str) -> EventEnvelope {
        EventEnvelope::builder()
            .global_tx_id(global_tx_id.clone())
            .aggregate_type("GlobalTransaction")
            .event_type(event_type)
            .version(Version::new(version))
            .payload_raw(serde_json::json!({"test": true}))
            .build()
    }

    #[tokio::test]
    async fn append_and_read_stream() {
        let store = InMemoryEventStore::new();
        let id = GlobalTxId::new();

        let events = vec![
            create_test_event(&id, 1, "SagaStarted"),
            create_test_event(&id, 2, "TxStarted"),
            create_test_event(&id, 3, "TxEnded"),
        ];
        let version = store
            .append(events, AppendOptions::expect_version(Version::initial()))
            .await
            .unwrap();
        assert_eq!(version, Version::new(3));

        let stored = store.get_events(&id).await.unwrap();
        assert_eq!(stored.len(), 3);
        assert_eq!(stored[2].event_type, "TxEnded");
        assert_eq!(store.get_version(&id).await.unwrap(), Some(Version::new(3)));
    }

    #[tokio::test]
    async fn concurrency_conflict_on_wrong_version() {
        let store = InMemoryEventStore::new();
        let id = GlobalTxId::new();

        store
            .append(
                vec![create_test_event(&id, 1, "TxStarted")],
                AppendOptions::expect_version(Version::initial()),
            )
            .await
            .unwrap();

        let result = store
            .append(
                vec![create_test_event(&id, 2, "TxEnded")],
                AppendOptions::expect_version(Version::initial()),
            )
            .await;

        assert!(matches!(
            result,
            Err(EventStoreError::ConcurrencyConflict { .. })
        ));
    }

    #[tokio::test]
    async fn duplicate_version_is_rejected_without_expectation() {
        let store = InMemoryEventStore::new();
        let id = GlobalTxId::new();

        store
            .append(vec![create_test_event(&id, 1, "TxStarted")], AppendOptions::new())
            .await
            .unwrap();
        let result = store
            .append(vec![create_test_event(&id, 1, "TxStarted")], AppendOptions::new())
            .await;

        assert!(matches!(
            result,
            Err(EventStoreError::ConcurrencyConflict { .. })
        ));
    }

    #[tokio::test]
    async fn list_streams_in_first_append_order() {
        let store = InMemoryEventStore::new();
        let a = GlobalTxId::parse("a").unwrap();
        let b = GlobalTxId::parse("b").unwrap();

        store
            .append(vec![create_test_event(&b, 1, "TxStarted")], AppendOptions::new())
            .await
            .unwrap();
        store
            .append(vec![create_test_event(&a, 1, "TxStarted")], AppendOptions::new())
            .await
            .unwrap();
        store
            .append(vec![create_test_event(&b, 2, "TxEnded")], AppendOptions::new())
            .await
            .unwrap();

        assert_eq!(store.list_streams().await.unwrap(), vec![b, a]);
    }

    #[tokio::test]
    async fn fail_on_append_reports_unavailable() {
        let store = InMemoryEventStore::new();
        let id = GlobalTxId::new();
        store.set_fail_on_append(true);

        let result = store
            .append(vec![create_test_event(&id, 1, "TxStarted")], AppendOptions::new())
            .await;
        assert!(matches!(result, Err(EventStoreError::Unavailable(_))));
        assert_eq!(store.event_count().await, 0);

        store.set_fail_on_append(false);
        store
            .append(vec![create_test_event(&id, 1, "TxStarted")], AppendOptions::new())
            .await
            .unwrap();
        assert_eq!(store.event_count().await, 1);
    }

    #[tokio::test]
    async fn load_stream_starts_after_snapshot() {
        let store = InMemoryEventStore::new();
        let id = GlobalTxId::new();

        let events = (1..=4)
            .map(|v| create_test_event(&id, v, "TxStarted"))
            .collect();
        store.append(events, AppendOptions::new()).await.unwrap();
        store
            .save_snapshot(Snapshot::new(
                id.clone(),
                "GlobalTransaction",
                Version::new(2),
                serde_json::json!({"state": "saved"}),
            ))
            .await
            .unwrap();

        let (snapshot, events) = store.load_stream(&id).await.unwrap();
        assert_eq!(snapshot.unwrap().version, Version::new(2));
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].version, Version::new(3));
    }
}
