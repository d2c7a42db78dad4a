//! # rencontre-server
//!
//! Real-time chat delivery server for the Rencontre platform.
//!
//! This binary provides:
//! - **WebSocket endpoint** over which clients send commands and receive
//!   message, presence, and read-receipt events
//! - **Message distribution hub** with presence tracking, bounded write
//!   buffering, and a cached per-conversation history
//! - **Automated dialog engine** that walks a user's prepared questions
//!   through a conversation on their behalf
//! - **REST endpoints** (axum) for health checks and live status

mod api;
mod config;
mod error;
mod ws;

use std::sync::Arc;
use std::time::Instant;

use tracing::info;
use tracing_subscriber::EnvFilter;

use rencontre_chat::backplane::MemoryBackplane;
use rencontre_chat::{ChatHub, StoreGateway};
use rencontre_store::Database;

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
                .unwrap_or_else(|_| EnvFilter::new("info,rencontre_server=debug")),
        )
        .init();

    info!("Starting Rencontre chat server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");
    info!(
        instance = %config.instance_name,
        database = %config.database_path.display(),
        "Instance settings"
    );

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------

    // Message store (creates the parent directory if missing)
    let database = Database::open_at(&config.database_path)?;
    let store = StoreGateway::new(database);

    // Process-local backplane.  A multi-process deployment swaps in an
    // implementation backed by shared infrastructure; single-node setups
    // lose nothing by keeping events in memory.
    let backplane = Arc::new(MemoryBackplane::new());

    // The hub spawns its own pipeline consumer and backplane listener.
    let hub = ChatHub::new(store, backplane, config.hub_options());
    info!(process_id = %hub.process_id(), "Chat hub running");

    let app_state = AppState {
        hub: hub.clone(),
        config: Arc::new(config.clone()),
        started_at: Instant::now(),
    };

    // -----------------------------------------------------------------------
    // 4. Run the HTTP server (blocks until shutdown)
    // -----------------------------------------------------------------------
    // tokio::select! ensures that if either the HTTP server or a shutdown
    // signal arrives, we exit cleanly.
    tokio::select! {
        result = api::serve(app_state, config.http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
        }
    }

    // -----------------------------------------------------------------------
    // 5. Drain in-flight work before exiting
    // -----------------------------------------------------------------------
    hub.shutdown().await;
    info!("Goodbye");

    Ok(())
}

/// Resolves on Ctrl+C or, on Unix, SIGTERM (what a supervisor sends).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
