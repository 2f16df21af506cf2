//! Signaling Connection Handler
//!
//! One task per WebSocket: admit the client, relay addressed control messages
//! to their target, and deregister on the way out.

use axum::extract::ws::{Message, WebSocket};
use futures::{sink::SinkExt, stream::StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SignalingConfig;
use crate::metrics::ServerMetrics;

use super::protocol::{ClientIdentity, Outbound, PeerMessage};
use super::registry::ConnectionRegistry;

/// Outcome of relaying one inbound frame.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RelayOutcome {
    Forwarded,
    /// Target identity not connected (or its queue is full); dropped silently
    TargetMissing,
    /// Parsed, but carries no string `to`
    Unaddressed,
    Malformed,
}

/// Handle a signaling WebSocket connection until it closes or the server shuts down.
pub async fn handle_signaling_ws(
    socket: WebSocket,
    preferred_id: ClientIdentity,
    connections: ConnectionRegistry,
    config: SignalingConfig,
    metrics: Arc<ServerMetrics>,
    shutdown: CancellationToken,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(config.channel_capacity);

    let id = connections.admit(preferred_id, tx).await;
    metrics.connection_opened();
    info!(client = %id, "Signaling connection established");

    let cancel = shutdown.child_token();

    // Task to send messages to WebSocket
    let sender_task = async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    error!("Failed to serialize message: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    };

    // Task to handle incoming messages
    let input_connections = connections.clone();
    let input_metrics = metrics.clone();
    let input_id = id.clone();
    let input_task = async move {
        while let Some(frame) = ws_receiver.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    match relay(&input_connections, &input_id, text.as_str()).await {
                        RelayOutcome::Forwarded => input_metrics.message_relayed(),
                        RelayOutcome::TargetMissing => input_metrics.message_dropped(),
                        RelayOutcome::Unaddressed | RelayOutcome::Malformed => {}
                    }
                }
                Ok(Message::Close(_)) => {
                    debug!(client = %input_id, "Client closed signaling connection");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(client = %input_id, "Signaling read failed: {}", e);
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = sender_task => debug!(client = %id, "Sender task ended"),
        _ = input_task => debug!(client = %id, "Input task ended"),
        _ = cancel.cancelled() => debug!(client = %id, "Signaling connection cancelled"),
    }

    connections.unregister(&id).await;
    metrics.connection_closed();
    info!(client = %id, "Signaling connection closed");
}

/// Forward one inbound text frame to its addressee with `from` stamped and
/// everything else left as the client sent it.
pub(crate) async fn relay(
    connections: &ConnectionRegistry,
    sender: &ClientIdentity,
    text: &str,
) -> RelayOutcome {
    let msg = match PeerMessage::parse(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(client = %sender, "Ignoring malformed control message: {}", e);
            return RelayOutcome::Malformed;
        }
    };

    let Some(target) = msg.recipient().map(str::to_owned) else {
        debug!(client = %sender, "Ignoring control message without recipient");
        return RelayOutcome::Unaddressed;
    };

    if connections
        .send_to(&target, msg.stamped(sender))
        .await
    {
        debug!(from = %sender, to = %target, "Relayed control message");
        RelayOutcome::Forwarded
    } else {
        debug!(from = %sender, to = %target, "Recipient not connected, dropping message");
        RelayOutcome::TargetMissing
    }
}
