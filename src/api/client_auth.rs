//! Client credential presence check.
//!
//! The gateway never validates keys; it only makes sure one was sent so the
//! upstream call can carry it. Three header forms are accepted, checked in
//! this order:
//!
//! 1. `Authorization: Bearer <key>`
//! 2. `x-api-key: <key>`
//! 3. `api-key: <key>`
//!
//! The key found is injected as a [`ClientCredential`] extension. A request
//! with none of them is answered with `401` in the standard error envelope.

use axum::{
    extract::Request,
    http::{header, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::error::{AppError, GatewayError};

/// Request extension set by [`client_auth_middleware`].
///
/// Handlers read this with `Extension<ClientCredential>`.
#[derive(Clone)]
pub struct ClientCredential(pub String);

// Keep keys out of debug logs.
impl std::fmt::Debug for ClientCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ClientCredential(..)")
    }
}

/// Axum middleware: rejects requests without a credential and injects a
/// [`ClientCredential`] for the handler.
pub async fn client_auth_middleware(mut req: Request, next: Next) -> Response {
    match credential(req.headers()) {
        Some(key) => {
            req.extensions_mut().insert(ClientCredential(key));
            next.run(req).await
        }
        None => AppError::from(GatewayError::MissingCredential).into_response(),
    }
}

/// Find the client's key in the accepted headers.
pub(crate) fn credential(headers: &HeaderMap) -> Option<String> {
    header_value(headers, header::AUTHORIZATION.as_str())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| header_value(headers, "x-api-key"))
        .or_else(|| header_value(headers, "api-key"))
        .map(str::to_owned)
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}
