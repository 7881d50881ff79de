//! WebSocket endpoint for UI subscribers.
//!
//! Flow:
//! 1. Client connects to `/v1/events/ws` (auth via bearer header or `?token=`).
//! 2. Gateway sends a `snapshot` event with presence, health, voice-wake
//!    triggers and connected nodes.
//! 3. Every broadcast follows as `{event, payload, seq, stateVersion}`.
//!
//! A subscriber that falls too far behind is evicted by the hub and the
//! socket is closed.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;

use crate::state::AppState;

/// GET /v1/events/ws — upgrade to WebSocket.
pub async fn events_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// The first message every subscriber receives.
pub fn snapshot(state: &AppState) -> serde_json::Value {
    let bridge = &state.bridge;
    let versions = bridge.presence.versions();
    json!({
        "event": "snapshot",
        "payload": {
            "presence": bridge.presence.list(),
            "health": {
                "ok": true,
                "connected": bridge.handle.registry().len(),
                "skillsSnapshot": bridge.capabilities.snapshot_version(),
            },
            "nodes": bridge.handle.registry().summaries(),
            "voicewake": { "triggers": bridge.voicewake_triggers() },
        },
        "seq": state.hub.seq(),
        "stateVersion": versions,
    })
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    // Subscribe before building the snapshot so nothing falls in between.
    let mut sub = state.hub.subscribe();
    let sub_id = sub.id;

    if ws_sink
        .send(Message::Text(snapshot(&state).to_string()))
        .await
        .is_err()
    {
        state.hub.unsubscribe(sub_id);
        return;
    }
    tracing::debug!(subscriber = sub_id, "ui subscriber connected");

    loop {
        tokio::select! {
            msg = sub.recv() => {
                let Some(msg) = msg else {
                    tracing::info!(subscriber = sub_id, "ui subscriber evicted as slow consumer");
                    let _ = ws_sink.send(Message::Close(None)).await;
                    break;
                };
                let text = match serde_json::to_string(msg.as_ref()) {
                    Ok(t) => t,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to serialize ui event");
                        continue;
                    }
                };
                if ws_sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = ws_stream.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    // Subscribers are receive-only; axum answers pings itself.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.hub.unsubscribe(sub_id);
    tracing::debug!(subscriber = sub_id, "ui subscriber disconnected");
}
