//! Error response helpers shared by the HTTP handlers.

use axum::Json;
use axum::http::StatusCode;
use serde::Serialize;

/// Body of every non-success response: `{"status": false, "message": ...}`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub status: bool,
    pub message: String,
}

pub type ErrorResponse = (StatusCode, Json<ErrorBody>);

fn error(code: StatusCode, message: impl Into<String>) -> ErrorResponse {
    (
        code,
        Json(ErrorBody {
            status: false,
            message: message.into(),
        }),
    )
}

pub fn bad_request(message: impl Into<String>) -> ErrorResponse {
    error(StatusCode::BAD_REQUEST, message)
}

pub fn forbidden(message: impl Into<String>) -> ErrorResponse {
    error(StatusCode::FORBIDDEN, message)
}

pub fn not_found(message: impl Into<String>) -> ErrorResponse {
    error(StatusCode::NOT_FOUND, message)
}

pub fn too_many_requests(message: impl Into<String>) -> ErrorResponse {
    error(StatusCode::TOO_MANY_REQUESTS, message)
}

pub fn service_unavailable(message: impl Into<String>) -> ErrorResponse {
    error(StatusCode::SERVICE_UNAVAILABLE, message)
}

pub fn internal_error(message: impl Into<String>) -> ErrorResponse {
    error(StatusCode::INTERNAL_SERVER_ERROR, message)
}
