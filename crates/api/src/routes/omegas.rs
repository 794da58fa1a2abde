//! Omega session endpoints.

use std::convert::Infallible;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use event_store::EventStore;
use futures_util::{Stream, StreamExt, stream};

use crate::AppState;
use crate::error::ApiError;
use crate::omega::{CommandAck, CommandStreamError, wait_closed};

/// POST /omegas/{service}/{instance}
#[tracing::instrument(skip(state))]
pub async fn connect<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path((service, instance)): Path<(String, String)>,
) -> StatusCode {
    state.omegas.connect(&service, &instance);
    StatusCode::CREATED
}

/// DELETE /omegas/{service}/{instance}
#[tracing::instrument(skip(state))]
pub async fn disconnect<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path((service, instance)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    if state.omegas.disconnect(&service, &instance) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!(
            "omega {service}/{instance} is not connected"
        )))
    }
}

/// GET /omegas/{service}/{instance}/commands
///
/// Streams `compensate` events until the omega disconnects or the server
/// shuts down.
pub async fn commands<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path((service, instance)): Path<(String, String)>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let receiver = state.omegas.take_commands(&service, &instance)?;
    tracing::info!(%service, %instance, "command stream opened");

    let commands = stream::unfold(receiver, |mut receiver| async move {
        let command = receiver.recv().await?;
        let event = Event::default()
            .event("compensate")
            .id(command.command_id.to_string())
            .json_data(&command)
            .unwrap_or_else(|err| Event::default().event("error").data(err.to_string()));
        Some((Ok(event), receiver))
    })
    .take_until(wait_closed(state.omegas.closing()));

    Ok(Sse::new(commands).keep_alive(KeepAlive::default()))
}

/// POST /omegas/{service}/{instance}/acks
pub async fn acknowledge<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path((service, instance)): Path<(String, String)>,
    Json(ack): Json<CommandAck>,
) -> Result<StatusCode, ApiError> {
    let command_id = ack.command_id;
    if state.omegas.acknowledge(&service, &instance, ack) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!(
            "no pending command {command_id} for {service}/{instance}"
        )))
    }
}

impl From<CommandStreamError> for ApiError {
    fn from(err: CommandStreamError) -> Self {
        match err {
            CommandStreamError::NotConnected { .. } => ApiError::NotFound(err.to_string()),
            CommandStreamError::AlreadyStreaming { .. } => ApiError::Conflict(err.to_string()),
        }
    }
}
