//! Loading and persisting event-sourced aggregates.

use std::marker::PhantomData;

use common::GlobalTxId;
use event_store::{AppendOptions, EventEnvelope, EventStore, EventStoreExt, Snapshot, Version};

use crate::aggregate::{Aggregate, DomainEvent, SnapshotCapable};
use crate::error::DomainError;

/// Reads and writes one aggregate type through an [`EventStore`].
///
/// The repository is responsible for:
/// 1. Loading the aggregate from the event store (with optional snapshot)
/// 2. Persisting one event with an optimistic version check, then applying it
/// 3. Saving snapshots
pub struct EventSourcedRepository<S, A>
where
    S: EventStore,
    A: Aggregate,
{
    store: S,
    _phantom: PhantomData<A>,
}

impl<S, A> EventSourcedRepository<S, A>
where
    S: EventStore,
    A: Aggregate,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            _phantom: PhantomData,
        }
    }

    /// Returns a reference to the underlying event store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Loads an aggregate from the event store.
    ///
    /// If the aggregate doesn't exist, returns a default instance.
    pub async fn load(&self, id: &GlobalTxId) -> Result<A, DomainError>
    where
        A: SnapshotCapable,
    {
        let (snapshot, events) = self.store.load_stream(id).await?;
        Self::replay(snapshot, events)
    }

    /// Loads an aggregate, returning None if it has no events.
    pub async fn load_existing(&self, id: &GlobalTxId) -> Result<Option<A>, DomainError>
    where
        A: SnapshotCapable,
    {
        let aggregate = self.load(id).await?;
        Ok(aggregate.id().is_some().then_some(aggregate))
    }

    /// Rebuilds an aggregate from an optional snapshot and the events after it.
    pub fn replay(snapshot: Option<Snapshot>, events: Vec<EventEnvelope>) -> Result<A, DomainError>
    where
        A: SnapshotCapable,
    {
        let mut aggregate: A = match snapshot {
            Some(snapshot) => snapshot.into_state()?,
            None => A::default(),
        };

        for envelope in events {
            let event: A::Event = serde_json::from_value(envelope.payload)?;
            aggregate.apply(event);
            aggregate.set_version(envelope.version);
        }

        Ok(aggregate)
    }

    /// Decodes the full event history of an aggregate.
    pub async fn history(&self, id: &GlobalTxId) -> Result<Vec<A::Event>, DomainError> {
        self.store
            .get_events(id)
            .await?
            .into_iter()
            .map(|envelope| serde_json::from_value(envelope.payload).map_err(DomainError::from))
            .collect()
    }

    /// Persists `event` as the next version of `aggregate`, then applies it.
    ///
    /// Nothing is applied if the append fails.
    pub async fn append(
        &self,
        id: &GlobalTxId,
        aggregate: &mut A,
        event: A::Event,
    ) -> Result<Version, DomainError> {
        let current_version = aggregate.version();
        let envelope = EventEnvelope::builder()
            .global_tx_id(id.clone())
            .aggregate_type(A::aggregate_type())
            .event_type(event.event_type())
            .version(current_version.next())
            .payload(&event)?
            .try_build()?;

        let new_version = self
            .store
            .append_event(envelope, AppendOptions::expect_version(current_version))
            .await?;

        aggregate.apply(event);
        aggregate.set_version(new_version);
        Ok(new_version)
    }

    /// Stores the aggregate state at its current version.
    pub async fn save_snapshot(&self, id: &GlobalTxId, aggregate: &A) -> Result<(), DomainError>
    where
        A: SnapshotCapable,
    {
        let snapshot =
            Snapshot::from_state(id.clone(), A::aggregate_type(), aggregate.version(), aggregate)?;
        self.store.save_snapshot(snapshot).await?;
        tracing::debug!(%id, version = %aggregate.version(), "snapshot saved");
        Ok(())
    }
}
