use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use tokio::signal;
use tracing::info;

mod api;
mod config;
mod error;
mod normalize;
mod reducer;
mod relay;
mod upstream;

pub use config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // When invoked as a Docker HEALTHCHECK, hit /healthz and exit immediately.
    if std::env::args().nth(1).as_deref() == Some("--healthcheck") {
        return healthcheck().await;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chat_relay=info,tower_http=warn".into()),
        )
        .init();

    let config_path = std::env::var("RELAY_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/etc/chat-relay/config.toml"));

    let mut config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    if let Some(port) = port_override()? {
        config.gateway.port = port;
    }

    info!(
        port = config.gateway.port,
        upstream = %config.upstream.chat_url(),
        mapped_models = config.model_map.len(),
        "chat-relay starting"
    );

    let state = Arc::new(relay::RelayState::new(Arc::new(config))?);
    let addr: SocketAddr = format!("0.0.0.0:{}", state.config.gateway.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    info!(%addr, "client API listening");

    axum::serve(listener, api::app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("client API server error")?;

    info!("shutdown complete");
    Ok(())
}

/// `RELAY_PORT`, when set, wins over `gateway.port`.
fn port_override() -> anyhow::Result<Option<u16>> {
    match std::env::var("RELAY_PORT") {
        Ok(v) => v
            .parse::<u16>()
            .map(Some)
            .with_context(|| format!("RELAY_PORT `{v}` is not a valid port")),
        Err(_) => Ok(None),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

/// Lightweight healthcheck: GET /healthz and exit 0 on 200, 1 otherwise.
/// Invoked via `chat-relay --healthcheck` from Docker HEALTHCHECK.
async fn healthcheck() -> anyhow::Result<()> {
    let port = std::env::var("RELAY_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(8080);

    let url = format!("http://127.0.0.1:{port}/healthz");
    let ok = reqwest::get(&url)
        .await
        .map(|resp| resp.status().is_success())
        .unwrap_or(false);

    std::process::exit(if ok { 0 } else { 1 });
}
