//! Request relaying, the core flow of chat-relay.
//!
//! Every chat request takes the same path:
//!
//! 1. The client's `messages` are repaired by [`normalize_messages`].
//! 2. `model` is mapped through the configured `[model_map]`.
//! 3. The upstream is always asked to stream (`stream: true`).
//! 4. If the client asked to stream too, the upstream bytes are handed back
//!    untouched. Otherwise the stream is folded by [`reduce_stream`] into one
//!    completion document.
//!
//! No state is shared between requests apart from the immutable config and
//! the HTTP connection pool. Dropping the returned future (client went away)
//! drops the upstream response and releases its connection.

use std::sync::Arc;

use anyhow::Context;
use serde_json::Value;
use tracing::{debug, info};

use crate::{
    config::Config,
    normalize::normalize_messages,
    reducer::{reduce_stream, CompletionDocument},
    upstream::{SseStream, UpstreamClient},
};

/// Shared application state injected into every request handler via [`axum::extract::State`].
pub struct RelayState {
    /// Loaded once at startup, never mutated.
    pub config: Arc<Config>,
    upstream: UpstreamClient,
}

impl RelayState {
    pub fn new(config: Arc<Config>) -> anyhow::Result<Self> {
        let upstream = UpstreamClient::new(&config.upstream)?;
        Ok(Self { config, upstream })
    }
}

/// What the handler sends back to the client.
pub enum RelayOutcome {
    /// Upstream SSE bytes, passed through verbatim.
    Stream(SseStream),
    /// The whole stream reduced to one document.
    Document(CompletionDocument),
}

/// Relay one `/v1/chat/completions` request body to the upstream.
///
/// `credential` is the client's key, already presence-checked.
#[tracing::instrument(
    skip(state, request_body, credential),
    fields(model = tracing::field::Empty, stream = tracing::field::Empty)
)]
pub async fn relay(
    state: &RelayState,
    request_body: Value,
    credential: &str,
) -> anyhow::Result<RelayOutcome> {
    let (outbound, client_stream) = build_upstream_request(&state.config, request_body)?;

    let span = tracing::Span::current();
    span.record("stream", client_stream);
    if let Some(model) = outbound.get("model").and_then(Value::as_str) {
        span.record("model", model);
    }

    let t0 = std::time::Instant::now();
    let stream = state
        .upstream
        .chat_completions_stream(&outbound, credential)
        .await?;

    if client_stream {
        debug!(ttfb_ms = t0.elapsed().as_millis() as u64, "passing upstream stream through");
        return Ok(RelayOutcome::Stream(stream));
    }

    let document = reduce_stream(stream, &state.config.gateway.fallback_model).await?;
    info!(
        latency_ms = t0.elapsed().as_millis() as u64,
        finish_reason = %document.choices[0].finish_reason,
        tool_calls = document.choices[0].message.tool_calls.len(),
        total_tokens = document.usage.total_tokens,
        "stream reduced"
    );
    Ok(RelayOutcome::Document(document))
}

/// Rewrite a client request body into the upstream request.
///
/// Returns the outbound body and whether the client asked for a stream. All
/// fields other than `messages`, `model` and `stream` are forwarded as-is.
pub(crate) fn build_upstream_request(config: &Config, mut body: Value) -> anyhow::Result<(Value, bool)> {
    let obj = body
        .as_object_mut()
        .context("request body must be a JSON object")?;

    let client_stream = obj.get("stream").and_then(Value::as_bool).unwrap_or(false);

    let messages = normalize_messages(obj.get("messages").unwrap_or(&Value::Null));
    obj.insert(
        "messages".into(),
        serde_json::to_value(messages).context("serializing normalized messages")?,
    );

    if let Some(model) = obj.get("model").and_then(Value::as_str) {
        let mapped = config.upstream_model(model).to_owned();
        obj.insert("model".into(), Value::String(mapped));
    }

    obj.insert("stream".into(), Value::Bool(true));

    Ok((body, client_stream))
}
