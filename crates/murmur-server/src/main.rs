//! # murmur-server
//!
//! Realtime chat and call-signaling server.
//!
//! This binary provides:
//! - **REST API** (axum) for chats, group membership, messages, attachments
//!   and per-user visibility (archive, delete-for-me)
//! - **Realtime gateway** over WebSocket with per-user and per-chat rooms,
//!   typing indicators and live message fan-out
//! - **Presence** tracking across multiple connections per user
//! - **Call signaling relay** for offer/answer/ICE between two peers, with
//!   ephemeral session tracking

mod api;
mod attachments;
mod auth;
mod chats;
mod config;
mod error;
mod gateway;
mod presence;
mod realtime;
mod relay;
mod signaling;
mod views;
mod ws;

use tracing::info;
use tracing_subscriber::EnvFilter;

use murmur_store::SharedDatabase;

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
                .unwrap_or_else(|_| EnvFilter::new("info,murmur_server=debug")),
        )
        .init();

    info!("Starting murmur server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");
    if config.auth_server_pubkey == [0u8; 32] {
        tracing::warn!("AUTH_SERVER_PUBKEY not set; every token will be rejected");
    }

    // -----------------------------------------------------------------------
    // 3. Open the store and wire subsystems
    // -----------------------------------------------------------------------
    let db = SharedDatabase::open_at(&config.database_path)?;
    info!(path = %config.database_path.display(), "Database ready");

    let http_addr = config.http_addr;
    let app_state = AppState::build(config, db).await?;

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
