use axum::{
    extract::State,
    http::header,
    response::{IntoResponse, Json},
};
use serde::Serialize;
use serde_json::json;

use crate::{registry::PeerSnapshot, state::RelayState};

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub active_connections: usize,
    pub registered_peers: usize,
    pub peers: Vec<PeerSnapshot>,
}

pub async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

pub async fn stats_handler(State(state): State<RelayState>) -> Json<StatsResponse> {
    let peers = state.registry().snapshot();
    Json(StatsResponse {
        active_connections: state.active_connections(),
        registered_peers: peers.len(),
        peers,
    })
}

pub async fn metrics_handler(State(state): State<RelayState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.render_metrics(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::RelayConfig, connection::Connection};
    use axum::http::StatusCode;
    use metrics_exporter_prometheus::PrometheusBuilder;

    fn state() -> RelayState {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        RelayState::new(RelayConfig::default(), handle)
    }

    #[test_timeout::tokio_timeout_test]
    async fn health_reports_ok() {
        let response = health_handler().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test_timeout::tokio_timeout_test]
    async fn stats_lists_registered_peers() {
        let state = state();
        let (connection, _rx) = Connection::open(None);
        state.registry().register("alice", &connection);

        let Json(stats) = stats_handler(State(state.clone())).await;
        assert_eq!(stats.registered_peers, 1);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.peers[0].id, "alice");
        assert_eq!(stats.peers[0].connection_id, connection.id());
        assert_eq!(stats.peers[0].state, "open");
    }

    #[test_timeout::tokio_timeout_test]
    async fn metrics_uses_prometheus_content_type() {
        let response = metrics_handler(State(state())).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok()),
            Some("text/plain; version=0.0.4")
        );
    }
}
