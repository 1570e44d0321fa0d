//! Request ID middleware.
//!
//! Each inbound request gets an `X-Request-ID`, taken from the caller when
//! present and non-empty, otherwise a fresh UUID v4. The ID wraps the
//! handler in a tracing span, so relay and reducer log lines can be tied to
//! the response that carries it back.

use axum::{extract::Request, http::HeaderValue, middleware::Next, response::Response};
use tracing::Instrument as _;
use uuid::Uuid;

const HEADER: &str = "x-request-id";

/// Axum middleware that tags a request with an ID and echoes it back.
///
/// Apply it inside the `TraceLayer` so its span nests under the HTTP span.
pub async fn request_id_middleware(req: Request, next: Next) -> Response {
    let id = req
        .headers()
        .get(HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let span = tracing::info_span!("request", id = %id);
    let mut response = next.run(req).instrument(span).await;

    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(HEADER, value);
    }
    response
}
