//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use saga::SagaError;
use thiserror::Error;

/// API-level error type that maps to HTTP responses.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found.
    #[error("{0}")]
    NotFound(String),
    /// Bad request from the client.
    #[error("{0}")]
    BadRequest(String),
    /// Orchestrator error.
    #[error(transparent)]
    Saga(#[from] SagaError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Saga(err) => saga_error_status(err),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.to_string();
        if status.is_server_error() {
            tracing::error!(error = %message, "internal server error");
        }

        let body = serde_json::json!({ "success": false, "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn saga_error_status(err: &SagaError) -> StatusCode {
    match err {
        SagaError::NotFound { .. } | SagaError::OrderNotFound { .. } => StatusCode::NOT_FOUND,
        SagaError::InvalidTransition { .. } => StatusCode::CONFLICT,
        SagaError::InvalidMessage(_) => StatusCode::BAD_REQUEST,
        SagaError::DispatcherClosed => StatusCode::SERVICE_UNAVAILABLE,
        _ if err.is_conflict() => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::SagaId;
    use domain::SagaStatus;

    #[test]
    fn test_saga_errors_map_to_status_codes() {
        let not_found = ApiError::from(SagaError::NotFound {
            saga_id: SagaId::new("s-1"),
        });
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);

        let no_order = ApiError::from(SagaError::OrderNotFound { order_id: 42 });
        assert_eq!(no_order.status(), StatusCode::NOT_FOUND);

        let finished = ApiError::from(SagaError::InvalidTransition {
            saga_id: SagaId::new("s-1"),
            status: SagaStatus::Completed,
        });
        assert_eq!(finished.status(), StatusCode::CONFLICT);

        let malformed = ApiError::from(SagaError::InvalidMessage("no type".to_string()));
        assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);

        let publish = ApiError::from(SagaError::Publish {
            topic: "payment-commands".to_string(),
            reason: "down".to_string(),
        });
        assert_eq!(publish.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
