//! Configuration types for chat-relay.
//!
//! Config is loaded once at startup from a TOML file and validated before the
//! server opens any ports. Invalid configs are rejected with a clear error
//! rather than silently falling back to defaults. The loaded value is never
//! mutated afterwards; handlers share it through an `Arc`.
//!
//! # Example
//! ```toml
//! [gateway]
//! port = 8080
//!
//! [upstream]
//! base_url = "https://api.vendor.example"
//!
//! [model_map]
//! "gpt-4o" = "vendor-large"
//!
//! [[models]]
//! id = "gpt-4o"
//! owned_by = "vendor"
//! ```

use std::{
    collections::{HashMap, HashSet},
    path::Path,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Top-level gateway configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,

    pub upstream: UpstreamConfig,

    /// Client model name → upstream model name.
    ///
    /// Names missing from the table are forwarded unchanged.
    #[serde(default)]
    pub model_map: HashMap<String, String>,

    /// Static catalog served from `GET /v1/models`.
    #[serde(default)]
    pub models: Vec<ModelEntry>,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Self = toml::from_str(&content).context("parsing config TOML")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        let base = &self.upstream.base_url;
        anyhow::ensure!(
            base.starts_with("http://") || base.starts_with("https://"),
            "upstream base_url `{base}` must start with http:// or https://"
        );
        anyhow::ensure!(
            self.upstream.chat_path.starts_with('/'),
            "upstream chat_path `{}` must start with `/`",
            self.upstream.chat_path
        );

        for (from, to) in &self.model_map {
            anyhow::ensure!(
                !from.is_empty() && !to.is_empty(),
                "model_map entry `{from}` = `{to}` must not be empty"
            );
        }

        let mut seen = HashSet::new();
        for model in &self.models {
            anyhow::ensure!(!model.id.is_empty(), "[[models]] entry has an empty id");
            anyhow::ensure!(
                seen.insert(model.id.as_str()),
                "[[models]] lists `{}` more than once",
                model.id
            );
        }

        Ok(())
    }

    /// Map a client model name to the name the upstream expects.
    pub fn upstream_model<'a>(&'a self, model: &'a str) -> &'a str {
        self.model_map.get(model).map(String::as_str).unwrap_or(model)
    }
}

/// Listener and response settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Port for the client API (default: 8080). `RELAY_PORT` takes precedence.
    #[serde(default = "defaults::port")]
    pub port: u16,

    /// Model reported in a flattened response when the stream never names one.
    #[serde(default = "defaults::fallback_model")]
    pub fallback_model: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: defaults::port(),
            fallback_model: defaults::fallback_model(),
        }
    }
}

/// The vendor chat-completion API every request is relayed to.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    /// Scheme and host, without a trailing path.
    pub base_url: String,

    /// Path appended to `base_url` for chat completions.
    #[serde(default = "defaults::chat_path")]
    pub chat_path: String,

    /// TCP connect timeout in milliseconds (default: 10 000).
    ///
    /// Streamed bodies have no overall deadline.
    #[serde(default = "defaults::connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl UpstreamConfig {
    pub fn chat_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.chat_path)
    }
}

/// One entry of the static model catalog.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelEntry {
    pub id: String,
    #[serde(default = "defaults::owned_by")]
    pub owned_by: String,
    /// Unix seconds reported as `created`.
    #[serde(default)]
    pub created: i64,
}

mod defaults {
    pub fn port() -> u16 { 8080 }
    pub fn fallback_model() -> String { "unknown".into() }
    pub fn chat_path() -> String { "/v1/chat/completions".into() }
    pub fn connect_timeout_ms() -> u64 { 10_000 }
    pub fn owned_by() -> String { "upstream".into() }
}
