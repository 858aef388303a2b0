//! Dashboard API errors and their HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Request body was empty or unusable (400)
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Observation queue is full (429)
    #[error("Observation queue is full, retry later")]
    Busy,

    /// Epoch loop has stopped (503)
    #[error("Engine is not running")]
    EngineStopped,
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Busy => StatusCode::TOO_MANY_REQUESTS,
            ApiError::EngineStopped => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::Busy => "BUSY",
            ApiError::EngineStopped => "ENGINE_STOPPED",
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match &self {
            ApiError::EngineStopped => tracing::error!(error = %self, "API error"),
            _ => tracing::warn!(error = %self, "API error"),
        }

        let body = ErrorResponse {
            code: self.error_code(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
