use axum::extract::State;
use axum::response::{IntoResponse, Json};

use crate::state::AppState;

/// GET /v1/presence
pub async fn list_presence(State(state): State<AppState>) -> impl IntoResponse {
    let presence = &state.bridge.presence;
    Json(serde_json::json!({
        "presence": presence.list(),
        "stateVersion": presence.versions(),
    }))
}
