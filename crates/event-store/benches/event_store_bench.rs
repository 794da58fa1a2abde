use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use event_store::{
    AppendOptions, EventEnvelope, EventStoreExt, GlobalTxId, InMemoryEventStore, Version,
    store::EventStore,
};

fn make_event(global_tx_id: &GlobalTxId, version: i64) -> EventEnvelope {
    let event_type = if version == 1 { "SagaStarted" } else { "TxStarted" };
    EventEnvelope::builder()
        .global_tx_id(global_tx_id.clone())
        .aggregate_type("GlobalTransaction")
        .event_type(event_type)
        .version(Version::new(version))
        .payload_raw(serde_json::json!({
            "type": event_type,
            "globalTxId": global_tx_id.as_str(),
            "localTxId": format!("tx-{version}"),
            "serviceName": "bench-service",
            "instanceId": "bench-1"
        }))
        .build()
}

fn populated_store(rt: &tokio::runtime::Runtime, sagas: usize, per_saga: i64) -> InMemoryEventStore {
    let store = InMemoryEventStore::new();
    rt.block_on(async {
        for _ in 0..sagas {
            let id = GlobalTxId::new();
            let events: Vec<EventEnvelope> = (1..=per_saga).map(|v| make_event(&id, v)).collect();
            store.append(events, AppendOptions::expect_version(Version::initial())).await.unwrap();
        }
    });
    store
}

fn bench_append_single_event(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("event_store/append_single_event", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemoryEventStore::new();
                let id = GlobalTxId::new();
                store
                    .append_event(make_event(&id, 1), AppendOptions::expect_version(Version::initial()))
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_append_sequential_saga(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    // One event per append with a version check, the way a saga worker writes.
    c.bench_function("event_store/append_saga_of_10_one_by_one", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemoryEventStore::new();
                let id = GlobalTxId::new();
                for v in 1..=10 {
                    store
                        .append_event(
                            make_event(&id, v),
                            AppendOptions::expect_version(Version::new(v - 1)),
                        )
                        .await
                        .unwrap();
                }
            });
        });
    });
}

fn bench_get_events(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = populated_store(&rt, 1, 100);
    let id = rt.block_on(store.list_streams()).unwrap().remove(0);

    c.bench_function("event_store/get_events_100", |b| {
        b.iter(|| {
            rt.block_on(async {
                store.get_events(&id).await.unwrap();
            });
        });
    });
}

fn bench_list_streams(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("event_store/list_streams");

    for sagas in [10usize, 100, 1000] {
        let store = populated_store(&rt, sagas, 4);
        group.bench_with_input(BenchmarkId::from_parameter(sagas), &sagas, |b, &sagas| {
            b.iter(|| {
                rt.block_on(async {
                    let ids = store.list_streams().await.unwrap();
                    assert_eq!(ids.len(), sagas);
                });
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_append_single_event,
    bench_append_sequential_saga,
    bench_get_events,
    bench_list_streams,
);
criterion_main!(benches);
