use axum::{
    extract::{ConnectInfo, State, WebSocketUpgrade, ws::rejection::WebSocketUpgradeRejection},
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use tracing::warn;

use crate::AppState;
use crate::signaling::{self, ClientIdentity};

#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    #[error("websocket upgrade failed: {0}")]
    Upgrade(#[from] WebSocketUpgradeRejection),
}

impl IntoResponse for SignalingError {
    fn into_response(self) -> Response {
        match self {
            SignalingError::Upgrade(rejection) => rejection.into_response(),
        }
    }
}

/// Signaling WebSocket: one connection per browser tab.
pub async fn signaling_handler(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, SignalingError> {
    let ws = ws.map_err(|rejection| {
        warn!(%remote, "Rejecting signaling handshake: {}", rejection);
        SignalingError::from(rejection)
    })?;

    let preferred_id = ClientIdentity::from_port(remote.port());
    let connections = state.connections.clone();
    let config = state.server_config.signaling.clone();
    let metrics = state.metrics.clone();
    let shutdown = state.shutdown.clone();

    Ok(ws.on_upgrade(move |socket| {
        signaling::handle_signaling_ws(
            socket,
            preferred_id,
            connections,
            config,
            metrics,
            shutdown,
        )
    }))
}
