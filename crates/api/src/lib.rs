//! HTTP boundary for the saga coordinator.
//!
//! Omegas post their events to `/events`, register to receive compensation
//! commands over server-sent events, and acknowledge each command. Operators
//! query sagas and terminate or resume them. Structured logging comes from
//! `tracing`, metrics are exported in Prometheus format.

pub mod config;
pub mod error;
pub mod omega;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use coordinator::{CallbackRegistry, SagaRegistry};
use event_store::EventStore;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;
use omega::OmegaHub;

/// Shared application state accessible from all handlers.
pub struct AppState<S: EventStore + Clone + 'static> {
    pub registry: SagaRegistry<S>,
    pub omegas: OmegaHub,
}

/// Wires the coordinator and the omega hub around `store`.
pub fn create_state<S: EventStore + Clone + 'static>(store: S, config: &Config) -> Arc<AppState<S>> {
    let callbacks = Arc::new(CallbackRegistry::new());
    let omegas = OmegaHub::new(Arc::clone(&callbacks), config.callback_timeout);
    let registry = SagaRegistry::new(store, callbacks, config.coordinator.clone());
    Arc::new(AppState { registry, omegas })
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S: EventStore + Clone + 'static>(
    state: Arc<AppState<S>>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::ops::metrics))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::ops::health::<S>))
        .route("/events", post(routes::events::ingest::<S>))
        .route("/sagas/{id}", get(routes::sagas::get::<S>))
        .route("/sagas/{id}/events", get(routes::sagas::events::<S>))
        .route("/sagas/{id}/terminate", post(routes::sagas::terminate::<S>))
        .route("/sagas/{id}/resume", post(routes::sagas::resume::<S>))
        .route(
            "/omegas/{service}/{instance}",
            post(routes::omegas::connect::<S>).delete(routes::omegas::disconnect::<S>),
        )
        .route(
            "/omegas/{service}/{instance}/commands",
            get(routes::omegas::commands::<S>),
        )
        .route(
            "/omegas/{service}/{instance}/acks",
            post(routes::omegas::acknowledge::<S>),
        )
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
