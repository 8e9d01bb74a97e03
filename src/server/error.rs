//! Error-to-HTTP response conversion.
//!
//! Wraps [`crate::error::Error`] so route handlers can return
//! `Result<T, AppError>` and bubble failures with `?`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::error::Error;
use crate::lru::SharedError;

/// Wrapper implementing `IntoResponse` for the crate error type.
pub struct AppError {
    inner: Error,
}

impl AppError {
    pub fn new(inner: Error) -> Self {
        Self { inner }
    }

    /// Unwrap an error shared between cache waiters into a response error.
    pub fn shared(e: SharedError) -> Self {
        Self::new(match std::sync::Arc::try_unwrap(e) {
            Ok(owned) => owned,
            Err(shared) => Error::Probe(shared.to_string()),
        })
    }
}

impl From<Error> for AppError {
    fn from(e: Error) -> Self {
        Self::new(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.inner.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            tracing::error!(status = %status, error = %self.inner, "server error in handler");
        }

        let body = json!({ "error": self.inner.to_string() });
        (status, axum::Json(body)).into_response()
    }
}
