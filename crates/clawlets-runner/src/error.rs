//! Error types for the runner.
//!
//! [`BufferError`] and [`PromptError`] are returned by the secrets buffer
//! API. [`AppError`] is the HTTP-facing error: every variant renders a JSON
//! body of the form `{"error": <message>, "detail"?: <string>}` and never
//! includes a stack trace or any submitted value.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Errors from starting, using, or stopping the local secrets buffer.
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    /// The buffer configuration is unusable.
    #[error("invalid secrets buffer config: {reason}")]
    InvalidConfig { reason: String },

    /// The loopback listener could not be bound.
    #[error("failed to bind secrets buffer on {addr}: {reason}")]
    Bind { addr: String, reason: String },

    /// The HTTP server task failed.
    #[error("secrets buffer server error: {reason}")]
    Server { reason: String },

    /// No secrets arrived for the job in time and prompting was not allowed.
    #[error(
        "no secrets received for job '{job_id}' within {waited_ms}ms; submit them to {submit_url} \
         or rerun interactively to enter them on stdin"
    )]
    Timeout {
        job_id: String,
        waited_ms: u64,
        submit_url: String,
    },

    /// The interactive fallback failed.
    #[error(transparent)]
    Prompt(#[from] PromptError),
}

/// Errors from an interactive secret source.
#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    /// Reading the input failed.
    #[error("failed to read secrets input: {reason}")]
    Io { reason: String },

    /// The input ended before a line was read.
    #[error("secrets input closed before a line was read")]
    Closed,

    /// The line was not a JSON object.
    #[error("invalid secrets input: {reason}")]
    InvalidInput { reason: String },
}

/// Error message for a request from a foreign origin.
pub const ORIGIN_FORBIDDEN: &str = "origin forbidden";
/// Error message for a missing or wrong nonce header.
pub const NONCE_MISMATCH: &str = "nonce mismatch";
/// Error message for an unparseable request body.
pub const INVALID_JSON_BODY: &str = "invalid json body";
/// Error message for a body without a usable `jobId` / `secrets` pair.
pub const MISSING_FIELDS: &str = "jobId and secrets required";

/// Application-level error returned from HTTP handlers.
#[derive(Debug)]
pub enum AppError {
    /// Unknown route or method.
    NotFound,
    /// Origin or nonce check failed.
    Forbidden(&'static str),
    /// The body could not be used.
    BadRequest(&'static str),
    /// The body exceeded the configured limit.
    PayloadTooLarge,
    /// Something unexpected went wrong.
    Internal(String),
}

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, detail) = match self {
            Self::NotFound => (StatusCode::NOT_FOUND, "not found", None),
            Self::Forbidden(msg) => (StatusCode::FORBIDDEN, msg, None),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, None),
            Self::PayloadTooLarge => (StatusCode::PAYLOAD_TOO_LARGE, "body too large", None),
            Self::Internal(detail) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error",
                Some(detail),
            ),
        };

        (status, axum::Json(ErrorBody { error, detail })).into_response()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn render(err: AppError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn errors_render_fixed_shape() {
        let (status, body) = render(AppError::Forbidden(NONCE_MISMATCH)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body, serde_json::json!({ "error": "nonce mismatch" }));

        let (status, body) = render(AppError::NotFound).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, serde_json::json!({ "error": "not found" }));

        let (status, body) = render(AppError::Internal("lock poisoned".to_owned())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body,
            serde_json::json!({ "error": "internal error", "detail": "lock poisoned" })
        );
    }

    #[test]
    fn timeout_error_is_actionable() {
        let err = BufferError::Timeout {
            job_id: "j1".to_owned(),
            waited_ms: 5000,
            submit_url: "http://127.0.0.1:43110/secrets/submit".to_owned(),
        };
        let msg = err.to_string();
        assert!(msg.contains("http://127.0.0.1:43110/secrets/submit"));
        assert!(msg.contains("rerun interactively"));
    }
}
