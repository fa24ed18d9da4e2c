use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use domain::error::ProxyError;

/// JSON body written for every failed request.
///
/// `code` duplicates the HTTP status so callers parsing only the body see
/// it; `error` carries the original error string for operators, while
/// `message` is the sanitized text for end users.
#[derive(Debug, Serialize)]
pub struct StructuredError {
    pub code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl From<&ProxyError> for StructuredError {
    fn from(err: &ProxyError) -> Self {
        Self {
            code: err.status_code(),
            message: err.public_message(),
            error: err.to_string(),
        }
    }
}

/// Serialize a pipeline or dispatch error as the structured JSON response.
pub fn structured_response(err: &ProxyError) -> Response {
    let body = StructuredError::from(err);
    let status = StatusCode::from_u16(body.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(body)).into_response()
}
