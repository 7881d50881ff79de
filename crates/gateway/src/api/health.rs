use axum::extract::State;
use axum::response::{IntoResponse, Json};

use crate::state::AppState;

/// GET /v1/health
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let bridge = &state.bridge;
    let listen = bridge.listen_info();
    Json(serde_json::json!({
        "ok": true,
        "version": env!("CARGO_PKG_VERSION"),
        "stateVersion": bridge.presence.versions(),
        "connected": bridge.handle.registry().len(),
        "skillsSnapshot": bridge.capabilities.snapshot_version(),
        "uiSubscribers": state.hub.subscriber_count(),
        "bridge": listen.map(|l| serde_json::json!({
            "scheme": l.scheme,
            "host": l.host,
            "port": l.addr.port(),
        })),
    }))
}
