//! Liveness probe.

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

/// `GET /healthz`: always `200 {"status":"ok"}`; touches neither config nor upstream.
pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}
