//! Event ingestion from omegas.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use coordinator::Ack;
use domain::{TxEvent, TxEventType};
use event_store::EventStore;

use crate::AppState;
use crate::error::ApiError;

/// Event types only the coordinator itself may record.
const RESERVED: [TxEventType; 3] = [
    TxEventType::TxCompensationFailed,
    TxEventType::SagaSuspended,
    TxEventType::SagaTerminated,
];

/// POST /events
///
/// Answers 200 for accepted and duplicate events and 409 for rejected ones;
/// the body is the acknowledgement in every case.
#[tracing::instrument(
    skip(state, event),
    fields(global_tx_id = %event.global_tx_id, event_type = %event.event_type)
)]
pub async fn ingest<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Json(event): Json<TxEvent>,
) -> Result<(StatusCode, Json<Ack>), ApiError> {
    if RESERVED.contains(&event.event_type) {
        return Err(ApiError::BadRequest(format!(
            "{} events are recorded by the coordinator",
            event.event_type
        )));
    }

    let ack = state.registry.route_event(event).await?;
    let status = match ack {
        Ack::Accepted | Ack::Duplicate => StatusCode::OK,
        Ack::Rejected(ref reason) => {
            tracing::info!(%reason, "event rejected");
            StatusCode::CONFLICT
        }
    };
    Ok((status, Json(ack)))
}
