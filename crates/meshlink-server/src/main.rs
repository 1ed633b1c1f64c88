//! # meshlink-server
//!
//! Signaling relay for meshlink sessions.
//!
//! This binary provides:
//! - **REST API** (axum) exposing the signaling store: session bootstrap,
//!   offers and answers, directed signal queues, heartbeats and rosters
//! - **Background sweep** pruning silent participants and expired sessions
//! - **Per-IP rate limiting** to protect against abuse
//!
//! Only handshake metadata passes through the relay. Session payload flows
//! directly between peers once their links are up.

mod api;
mod config;
mod error;
mod rate_limit;

use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("info,meshlink_server=debug,meshlink_store=debug")
            }),
        )
        .init();

    info!("Starting meshlink relay v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    let http_addr = config.http_addr;
    let sweep_every = Duration::from_secs(config.sweep_interval_secs);
    let app_state = AppState::new(config);

    // -----------------------------------------------------------------------
    // 3. Spawn background tasks
    // -----------------------------------------------------------------------
    let _sweeper = app_state.store.spawn_sweeper(sweep_every);

    // Periodic rate limiter cleanup (every 5 minutes, evict buckets idle >10 min)
    let rl = app_state.rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            rl.purge_stale(600.0).await;
        }
    });

    // -----------------------------------------------------------------------
    // 4. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
