//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use common::IdError;
use coordinator::CoordinatorError;
use domain::DomainError;
use event_store::EventStoreError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// The request conflicts with the current state.
    Conflict(String),
    /// Error raised by the coordinator.
    Coordinator(CoordinatorError),
    /// Internal server error.
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Coordinator(err) => coordinator_error_to_response(err),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn coordinator_error_to_response(err: CoordinatorError) -> (StatusCode, String) {
    let status = match &err {
        CoordinatorError::NotFound(_) => StatusCode::NOT_FOUND,
        CoordinatorError::Event(_) => StatusCode::BAD_REQUEST,
        CoordinatorError::Halted { .. } | CoordinatorError::WorkerUnavailable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        CoordinatorError::Domain(DomainError::EventStore(
            EventStoreError::ConcurrencyConflict { .. },
        ))
        | CoordinatorError::EventStore(EventStoreError::ConcurrencyConflict { .. }) => {
            StatusCode::CONFLICT
        }
        CoordinatorError::Domain(_) | CoordinatorError::EventStore(_) => {
            tracing::error!(error = %err, "coordinator failure");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, err.to_string())
}

impl From<CoordinatorError> for ApiError {
    fn from(err: CoordinatorError) -> Self {
        ApiError::Coordinator(err)
    }
}

impl From<IdError> for ApiError {
    fn from(err: IdError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use common::GlobalTxId;

    use super::*;

    fn status_of(err: CoordinatorError) -> StatusCode {
        ApiError::from(err).into_response().status()
    }

    #[test]
    fn coordinator_errors_map_to_status_codes() {
        let id = GlobalTxId::parse("g-1").unwrap();
        assert_eq!(
            status_of(CoordinatorError::NotFound(id.clone())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(CoordinatorError::WorkerUnavailable(id.clone())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(CoordinatorError::Halted {
                global_tx_id: id.clone(),
                reason: "disk full".into(),
            }),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(CoordinatorError::EventStore(EventStoreError::Unavailable(
                "down".into()
            ))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
