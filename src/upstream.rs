//! HTTP client for the vendor chat-completion API.
//!
//! One [`UpstreamClient`] is built at startup and shared by every request;
//! [`reqwest::Client`] holds its connection pool behind an `Arc`, so sharing
//! it is cheap. Only a connect timeout is configured: streamed bodies can run
//! as long as the model keeps generating.

use std::{pin::Pin, time::Duration};

use anyhow::Context;
use bytes::Bytes;
use futures_util::Stream;
use reqwest::{header, Client};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{config::UpstreamConfig, error::GatewayError};

/// Raw SSE bytes as they arrive from the upstream.
pub type SseStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

pub struct UpstreamClient {
    client: Client,
    url: String,
}

impl UpstreamClient {
    pub fn new(cfg: &UpstreamConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_millis(cfg.connect_timeout_ms))
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            url: cfg.chat_url(),
        })
    }

    /// POST `body` to the chat endpoint and return the response body stream.
    ///
    /// `credential` is the client's own key, forwarded as a bearer token.
    ///
    /// # Errors
    /// Network failures are returned as plain errors. A non-2xx answer is
    /// returned as [`GatewayError::Upstream`] carrying the upstream status and
    /// the best message that could be extracted from its body.
    pub async fn chat_completions_stream(
        &self,
        body: &Value,
        credential: &str,
    ) -> anyhow::Result<SseStream> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(credential)
            .header(header::ACCEPT, "text/event-stream")
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {}", self.url))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!(%status, body = %text, "upstream rejected request");
            return Err(GatewayError::upstream(status, &text).into());
        }

        debug!(%status, "upstream stream opened");
        Ok(Box::pin(response.bytes_stream()))
    }
}
