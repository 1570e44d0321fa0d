//! Unified HTTP error type for axum request handlers.
//!
//! [`AppError`] wraps [`anyhow::Error`] and converts it into an HTTP response
//! automatically via [`IntoResponse`]. Handlers return `Result<T, AppError>`
//! and propagate errors with `?`.
//!
//! The status code is chosen by downcasting the wrapped error to
//! [`GatewayError`]; anything else is an internal fault. Every error response
//! uses the same envelope:
//!
//! ```json
//! { "error": { "message": "...", "type": "upstream_error" }, "type": "error" }
//! ```

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

/// Failures with a dedicated status code.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// No bearer credential in any of the accepted headers.
    #[error("missing API key: send `Authorization: Bearer <key>`, `x-api-key` or `api-key`")]
    MissingCredential,

    /// The vendor API answered with a non-2xx status.
    #[error("{message}")]
    Upstream { status: StatusCode, message: String },
}

impl GatewayError {
    /// Build an [`GatewayError::Upstream`] from a failed upstream response body.
    ///
    /// The message is taken from the vendor's JSON error body when one can be
    /// found, otherwise a generic message naming the status is used.
    pub fn upstream(status: StatusCode, body: &str) -> Self {
        let message = serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|v| upstream_message(&v))
            .unwrap_or_else(|| format!("upstream returned HTTP {status}"));
        Self::Upstream { status, message }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::MissingCredential => StatusCode::UNAUTHORIZED,
            Self::Upstream { status, .. } => *status,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::MissingCredential => "authentication_error",
            Self::Upstream { .. } => "upstream_error",
        }
    }
}

/// Pull a human-readable message out of a vendor error body.
///
/// Recognises `{"error": {"message": ..}}`, `{"error": ".."}` and
/// `{"message": ..}`.
fn upstream_message(body: &Value) -> Option<String> {
    body.pointer("/error/message")
        .or_else(|| body.get("error").filter(|e| e.is_string()))
        .or_else(|| body.get("message"))
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .map(str::to_owned)
}

/// Wraps [`anyhow::Error`] so it can be returned from axum handlers.
#[derive(Debug)]
pub struct AppError(anyhow::Error);

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self.0.downcast_ref::<GatewayError>() {
            Some(e) => (e.status(), e.kind(), e.to_string()),
            None => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("{:#}", self.0),
            ),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, kind, message) = self.parts();
        if status.is_server_error() {
            tracing::warn!(%status, error = %message, "handler error");
        } else {
            tracing::debug!(%status, error = %message, "request rejected");
        }
        (status, Json(envelope(&message, kind))).into_response()
    }
}

/// The JSON body shared by every error response.
pub fn envelope(message: &str, kind: &str) -> Value {
    json!({
        "error": { "message": message, "type": kind },
        "type": "error",
    })
}

/// Convert any `Into<anyhow::Error>` into an [`AppError`].
impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(e: E) -> Self {
        Self(e.into())
    }
}
