//! # courier-server
//!
//! Messaging backend for one-to-one conversations and groups.
//!
//! This binary provides:
//! - **REST API** (axum) for sending, replying, editing, reading and
//!   deleting messages, group management and the paginated feed
//! - **WebSocket gateway** that tracks presence across devices and pushes
//!   committed changes to every affected connection
//! - **Per-user rate limiting** on message and group writes

mod api;
mod config;
mod error;
mod fanout;
mod gateway;
mod identity;
mod presence;
mod rate_limit;

use std::time::Duration;

use courier_store::{Database, StorePool};
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
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,courier_server=debug")),
        )
        .init();

    info!("Starting Courier server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Open the store (runs migrations on every handle)
    // -----------------------------------------------------------------------
    let db_path = match config.database_path.clone() {
        Some(path) => path,
        None => Database::default_path()?,
    };
    let store = StorePool::open(&db_path, config.db_pool_size, config.db_busy_timeout)?;

    let http_addr = config.http_addr;
    let (app_state, fanout_task) = AppState::new(store, config);

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Evict rate limit buckets idle for more than 10 minutes
    let rl = app_state.rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            rl.purge_idle(Duration::from_secs(600)).await;
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP API server until it fails or Ctrl+C arrives
    // -----------------------------------------------------------------------
    let registry = app_state.registry.clone();
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

    registry.shutdown_all().await;
    fanout_task.abort();

    Ok(())
}
