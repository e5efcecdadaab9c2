//! Rendezvous relay: peers register an identifier over a websocket and the
//! relay forwards their signaling envelopes (offers, answers, ICE
//! candidates) to whichever connection owns the target identifier.

pub mod cli;
pub mod config;
pub mod connection;
pub mod envelope;
pub mod gateway;
pub mod handlers;
pub mod registry;
pub mod router;
pub mod state;
pub mod telemetry;

use std::{future::Future, net::SocketAddr};

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::{
    gateway::websocket_handler,
    handlers::{health_handler, metrics_handler, stats_handler},
    state::RelayState,
};

pub fn build_router(state: RelayState) -> Router {
    let ws_path = state.config().ws_path.clone();
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .route(&ws_path, get(websocket_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the relay on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: RelayState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("relay server exited with error")
}
