//! HTTP error types with response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use saga::SagaError;
use store::StoreError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// Saga execution error.
    Saga(SagaError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Saga(err) => saga_error_to_response(err),
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn saga_error_to_response(err: SagaError) -> (StatusCode, String) {
    match &err {
        SagaError::NotFound(_) | SagaError::Store(StoreError::SagaNotFound(_)) => {
            (StatusCode::NOT_FOUND, err.to_string())
        }
        SagaError::UnknownSagaType(_)
        | SagaError::UnknownStep(_)
        | SagaError::InvalidContext(_)
        | SagaError::UnsupportedContextVersion { .. } => (StatusCode::BAD_REQUEST, err.to_string()),
        SagaError::InvalidTransition { .. } | SagaError::Store(StoreError::DuplicateKey(_)) => {
            (StatusCode::CONFLICT, err.to_string())
        }
        _ if err.is_conflict() => (StatusCode::CONFLICT, err.to_string()),
        _ => {
            tracing::error!(error = %err, "saga request failed");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

impl From<SagaError> for ApiError {
    fn from(err: SagaError) -> Self {
        ApiError::Saga(err)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Saga(SagaError::Store(err))
    }
}
