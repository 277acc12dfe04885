//! Reference signaling relay.
//!
//! Clients connect to `/ws?id=<identity>`. The relay enforces one live socket
//! per identity, forwards negotiation envelopes between identities (stamping
//! the sender as `source`) and broadcasts room membership changes to the
//! other members of each room.

pub mod config;
mod state;
mod websocket;

use std::net::SocketAddr;

use anyhow::Context;
use axum::{extract::State, routing::get, Router};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub use config::Config;
pub use state::RelayState;

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(websocket::websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health_check(State(state): State<RelayState>) -> String {
    format!("ok peers={} rooms={}", state.peer_count(), state.room_count())
}

/// Binds and serves until the server fails.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let addr = config.addr();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(target: "relay", %addr, "mesh relay listening");
    let state = RelayState::new(config);
    axum::serve(listener, router(state))
        .await
        .context("relay server failed")
}

/// A relay serving in the background, stopped when dropped.
pub struct RelayHandle {
    addr: SocketAddr,
    state: RelayState,
    task: JoinHandle<()>,
}

impl RelayHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Websocket endpoint, e.g. `ws://127.0.0.1:41234/ws`.
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn state(&self) -> &RelayState {
        &self.state
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Starts a relay on a background task. Use [`Config::local`] for an
/// ephemeral loopback port.
pub async fn spawn(config: Config) -> anyhow::Result<RelayHandle> {
    let listener = TcpListener::bind(config.addr())
        .await
        .with_context(|| format!("failed to bind {}", config.addr()))?;
    let addr = listener.local_addr()?;
    let state = RelayState::new(config);
    let app = router(state.clone());
    let task = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            error!(target: "relay", error = %err, "relay server stopped");
        }
    });
    info!(target: "relay", %addr, "mesh relay spawned");
    Ok(RelayHandle { addr, state, task })
}
