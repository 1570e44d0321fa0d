//! HTTP surface of the gateway.

use std::sync::Arc;

use axum::Router;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

use crate::relay::RelayState;

pub mod client;
pub mod client_auth;
pub mod health;
pub mod request_id;

/// The full client application: routes plus request-ID, tracing and CORS
/// layers. CORS is outermost so preflight requests never reach auth.
pub fn app(state: Arc<RelayState>) -> Router {
    client::router(state)
        .layer(axum::middleware::from_fn(request_id::request_id_middleware))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(tracing::Level::INFO))
                .on_response(DefaultOnResponse::new().level(tracing::Level::INFO)),
        )
        .layer(CorsLayer::permissive())
}
