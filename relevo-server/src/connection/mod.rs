//! Per-client WebSocket session handler.
//!
//! Each accepted WebSocket gets one task running a single select loop:
//! inbound frames are parsed as `{event, data}` and routed to
//! [`events`], outbound envelopes are drained from the connection's mpsc
//! outbox. The outbox is the only delivery path to a client, so events to
//! one connection always arrive in submission order.
//!
//! The handler is split for readability:
//! - this module — session lifecycle, frame loop, teardown
//! - [`events`] — client-originated event handlers

pub mod events;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::auth;
use crate::registry::ConnectionMeta;
use crate::server::RelayState;

/// Inbound client frame: `{event, data}`.
#[derive(Debug, Deserialize)]
struct ClientFrame {
    event: String,
    #[serde(default)]
    data: Value,
}

/// Handle one WebSocket session from upgrade to teardown.
pub async fn handle_socket(
    mut socket: WebSocket,
    state: Arc<RelayState>,
    remote_addr: String,
    user_agent: Option<String>,
) {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let conn_id = format!("conn-{}", COUNTER.fetch_add(1, Ordering::Relaxed));
    tracing::info!(
        %conn_id,
        %remote_addr,
        user_agent = user_agent.as_deref().unwrap_or("-"),
        "New connection"
    );

    let (tx, mut rx) = mpsc::channel::<String>(state.config.outbox_depth);
    state.registry.attach(
        &conn_id,
        tx,
        ConnectionMeta {
            remote_addr,
            user_agent,
            connected_at: chrono::Utc::now(),
        },
    );

    loop {
        tokio::select! {
            frame = socket.recv() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(frame) => {
                                tracing::debug!(%conn_id, event = %frame.event, "<- client event");
                                events::dispatch_client_event(&state, &conn_id, &frame.event, frame.data)
                                    .await;
                            }
                            Err(e) => {
                                tracing::debug!(%conn_id, "Unparseable client frame: {e}");
                                state.dispatcher.to_connection(
                                    &conn_id,
                                    "error",
                                    &serde_json::json!({
                                        "success": false,
                                        "message": "Formato de evento inválido, se espera {event, data}",
                                    }),
                                );
                            }
                        }
                    }
                    // Ping/pong frames are answered by axum.
                    Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Binary(_))) => {}
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(%conn_id, "WebSocket read error: {e}");
                        break;
                    }
                }
            }
            line = rx.recv() => {
                match line {
                    Some(line) => {
                        if socket.send(WsMessage::Text(line.into())).await.is_err() {
                            tracing::debug!(%conn_id, "WebSocket send failed, closing");
                            break;
                        }
                    }
                    // Sender dropped: the registry detached us (shutdown).
                    None => break,
                }
            }
        }
    }

    // Teardown: registry removal implies removal from every group. If an
    // identity was freed, announce the disconnect to everyone left.
    if let Some(announcement) = auth::handle_disconnect(&state, &conn_id) {
        state
            .dispatcher
            .to_all("user_disconnected", &announcement);
    }
}
