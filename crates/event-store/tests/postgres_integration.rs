//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container for efficiency.
//! Run with:
//!
//! ```bash
//! cargo test -p event-store --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;

use event_store::{
    AppendOptions, EventEnvelope, EventStore, EventStoreError, EventStoreExt,
    GlobalTxId, PostgresEventStore, Snapshot, Version,
};
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!(
                "../../../migrations/001_create_events_table.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

async fn get_test_store() -> PostgresEventStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE events, snapshots")
        .execute(&pool)
        .await
        .unwrap();

    PostgresEventStore::new(pool)
}

fn saga_event(global_tx_id: &GlobalTxId, version: i64, event_type: &str) -> EventEnvelope {
    EventEnvelope::builder()
        .global_tx_id(global_tx_id.clone())
        .aggregate_type("GlobalTransaction")
        .event_type(event_type)
        .version(Version::new(version))
        .payload_raw(serde_json::json!({"type": event_type}))
        .build()
}

#[tokio::test]
async fn append_and_read_back_a_saga_stream() {
    let store = get_test_store().await;
    let id = GlobalTxId::new();

    let events = vec![
        saga_event(&id, 1, "SagaStarted"),
        saga_event(&id, 2, "TxStarted"),
        saga_event(&id, 3, "TxEnded"),
    ];
    let version = store.append(events, AppendOptions::expect_version(Version::initial())).await.unwrap();
    assert_eq!(version, Version::new(3));

    let events = store.get_events(&id).await.unwrap();
    let types: Vec<_> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(types, ["SagaStarted", "TxStarted", "TxEnded"]);
    assert_eq!(store.get_version(&id).await.unwrap(), Some(Version::new(3)));

    let tail = store.get_events_from_version(&id, Version::new(2)).await.unwrap();
    assert_eq!(tail.len(), 2);
}

#[tokio::test]
async fn stale_expected_version_is_a_conflict() {
    let store = get_test_store().await;
    let id = GlobalTxId::new();

    store
        .append_event(saga_event(&id, 1, "SagaStarted"), AppendOptions::expect_version(Version::initial()))
        .await
        .unwrap();

    let result = store
        .append_event(saga_event(&id, 2, "TxStarted"), AppendOptions::expect_version(Version::initial()))
        .await;
    assert!(matches!(
        result,
        Err(EventStoreError::ConcurrencyConflict { .. })
    ));
}

#[tokio::test]
async fn duplicate_version_hits_the_unique_constraint() {
    let store = get_test_store().await;
    let id = GlobalTxId::new();

    store
        .append_event(saga_event(&id, 1, "SagaStarted"), AppendOptions::new())
        .await
        .unwrap();

    let result = store
        .append_event(saga_event(&id, 1, "TxStarted"), AppendOptions::new())
        .await;
    assert!(matches!(
        result,
        Err(EventStoreError::ConcurrencyConflict { .. })
    ));
}

#[tokio::test]
async fn list_streams_follows_first_append_order() {
    let store = get_test_store().await;
    let first = GlobalTxId::new();
    let second = GlobalTxId::new();

    store
        .append_event(saga_event(&first, 1, "SagaStarted"), AppendOptions::expect_version(Version::initial()))
        .await
        .unwrap();
    store
        .append_event(saga_event(&second, 1, "SagaStarted"), AppendOptions::expect_version(Version::initial()))
        .await
        .unwrap();
    store
        .append_event(
            saga_event(&first, 2, "TxStarted"),
            AppendOptions::expect_version(Version::first()),
        )
        .await
        .unwrap();

    assert_eq!(store.list_streams().await.unwrap(), vec![first, second]);
}

#[tokio::test]
async fn snapshot_is_replaced_on_save() {
    let store = get_test_store().await;
    let id = GlobalTxId::new();

    store
        .save_snapshot(Snapshot::new(
            id.clone(),
            "GlobalTransaction",
            Version::new(2),
            serde_json::json!({"state": "STARTED"}),
        ))
        .await
        .unwrap();
    store
        .save_snapshot(Snapshot::new(
            id.clone(),
            "GlobalTransaction",
            Version::new(5),
            serde_json::json!({"state": "COMMITTED"}),
        ))
        .await
        .unwrap();

    let snapshot = store.get_snapshot(&id).await.unwrap().unwrap();
    assert_eq!(snapshot.version, Version::new(5));
    assert_eq!(snapshot.state["state"], "COMMITTED");
}

#[tokio::test]
async fn load_stream_returns_snapshot_and_tail() {
    let store = get_test_store().await;
    let id = GlobalTxId::new();

    let events = (1..=4)
        .map(|v| saga_event(&id, v, if v == 1 { "SagaStarted" } else { "TxStarted" }))
        .collect();
    store.append(events, AppendOptions::expect_version(Version::initial())).await.unwrap();
    store
        .save_snapshot(Snapshot::new(
            id.clone(),
            "GlobalTransaction",
            Version::new(2),
            serde_json::json!({}),
        ))
        .await
        .unwrap();

    let (snapshot, tail) = store.load_stream(&id).await.unwrap();
    assert_eq!(snapshot.map(|s| s.version), Some(Version::new(2)));
    assert_eq!(
        tail.iter().map(|e| e.version.as_i64()).collect::<Vec<_>>(),
        [3, 4]
    );
}
