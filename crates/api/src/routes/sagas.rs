//! Saga queries and operator actions.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use coordinator::Ack;
use domain::{GlobalTransaction, TxEvent};
use event_store::EventStore;

use super::saga_id;
use crate::AppState;
use crate::error::ApiError;

/// GET /sagas/{id}
pub async fn get<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<GlobalTransaction>, ApiError> {
    let id = saga_id(id)?;
    Ok(Json(state.registry.query(&id).await?))
}

/// GET /sagas/{id}/events
pub async fn events<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<TxEvent>>, ApiError> {
    let id = saga_id(id)?;
    Ok(Json(state.registry.history(&id).await?))
}

/// POST /sagas/{id}/terminate
#[tracing::instrument(skip(state))]
pub async fn terminate<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Ack>), ApiError> {
    let id = saga_id(id)?;
    let ack = state.registry.terminate(&id).await?;
    let status = match ack {
        Ack::Rejected(_) => StatusCode::CONFLICT,
        Ack::Accepted | Ack::Duplicate => StatusCode::OK,
    };
    tracing::info!(global_tx_id = %id, ?ack, "terminate requested");
    Ok((status, Json(ack)))
}

/// POST /sagas/{id}/resume
#[tracing::instrument(skip(state))]
pub async fn resume<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = saga_id(id)?;
    state.registry.resume(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
