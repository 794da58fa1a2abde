//! Core aggregate and domain event traits.

use common::GlobalTxId;
use event_store::Version;
use serde::{Serialize, de::DeserializeOwned};

/// Snapshot every this many events unless configured otherwise.
pub const DEFAULT_SNAPSHOT_INTERVAL: u64 = 100;

/// Trait for domain events.
///
/// Domain events represent facts that have happened in the domain.
/// They are immutable and should be named in past tense.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + Clone {
    /// Returns the event type name.
    ///
    /// This is used for serialization and event store filtering.
    fn event_type(&self) -> &'static str;
}

/// Trait for aggregates in an event-sourced system.
///
/// In event sourcing, aggregates:
/// - Are rebuilt by replaying events
/// - Apply events to update state (pure, deterministic)
/// - Never fail while applying; legality is decided before an event is persisted
pub trait Aggregate: Default + Send + Sync + Sized {
    /// The type of events this aggregate produces and consumes.
    type Event: DomainEvent;

    /// Returns the aggregate type name.
    ///
    /// Stored on every envelope and snapshot.
    fn aggregate_type() -> &'static str;

    /// Returns None for a new, uninitialized aggregate.
    fn id(&self) -> Option<GlobalTxId>;

    /// Returns the current version of the aggregate.
    ///
    /// Version starts at 0 for a new aggregate and increments with each event.
    fn version(&self) -> Version;

    fn set_version(&mut self, version: Version);

    /// Applies an event to the aggregate, updating its state.
    ///
    /// This method must be pure and deterministic:
    /// - Given the same state and event, it must always produce the same new state
    /// - It must not have side effects
    fn apply(&mut self, event: Self::Event);

    /// Applies multiple events in sequence.
    fn apply_events(&mut self, events: impl IntoIterator<Item = Self::Event>) {
        for event in events {
            self.apply(event);
        }
    }
}

/// Trait for aggregates that support snapshotting.
///
/// The aggregate state is periodically serialized and stored so that loading
/// it replays only the events recorded after the snapshot.
pub trait SnapshotCapable: Aggregate + Serialize + DeserializeOwned {
    /// Returns whether a snapshot should be taken at the current version.
    ///
    /// An interval of 0 disables snapshots.
    fn should_snapshot(&self, interval: u64) -> bool {
        let version = self.version().as_i64();
        interval > 0 && version > 0 && (version as u64).is_multiple_of(interval)
    }
}
