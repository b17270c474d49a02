//! API error types mapped to HTTP status codes.
//!
//! Each [`ApiError`] variant maps to a specific HTTP status code and produces
//! a JSON response body `{"error": "message"}`.

use crate::query::QueryError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tidemark_core::Error;

/// Application-level error type that implements `IntoResponse`.
///
/// Each variant maps to an HTTP status code:
/// - `NotFound` → 404
/// - `BadRequest` → 400
/// - `Conflict` → 409
/// - `ServiceUnavailable` → 503
/// - `Internal` → 500
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found (404).
    NotFound(String),
    /// Invalid request parameters (400).
    BadRequest(String),
    /// Record already exists, or an aging run is already in progress (409).
    Conflict(String),
    /// Stores are closed, e.g. during shutdown (503).
    ServiceUnavailable(String),
    /// Unexpected server error (500).
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        let body = axum::Json(json!({ "error": message }));
        (status, body).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        match e {
            Error::InvalidOwnerId(_)
            | Error::PathEscape(_)
            | Error::InvalidRecord(_)
            | Error::DimensionMismatch { .. }
            | Error::InvalidPartition(_) => ApiError::BadRequest(e.to_string()),
            Error::DuplicateRecord { .. } | Error::MigrationInProgress => {
                ApiError::Conflict(e.to_string())
            }
            Error::NotInitialized(_) => ApiError::ServiceUnavailable(e.to_string()),
            other => {
                tracing::error!(error = %other, "internal error");
                ApiError::Internal("Internal error".into())
            }
        }
    }
}

impl From<QueryError> for ApiError {
    fn from(e: QueryError) -> Self {
        match e {
            QueryError::Placement(inner) => inner.into(),
            QueryError::InvalidQuery(msg) => ApiError::BadRequest(msg),
        }
    }
}
