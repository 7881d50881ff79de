use axum::extract::State;
use axum::response::{IntoResponse, Json};
use serde::Deserialize;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct TriggersBody {
    pub triggers: Vec<String>,
}

/// GET /v1/voicewake
pub async fn get_triggers(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({ "triggers": state.bridge.voicewake_triggers() }))
}

/// PUT /v1/voicewake — replace the triggers and push them to every node.
pub async fn set_triggers(
    State(state): State<AppState>,
    Json(body): Json<TriggersBody>,
) -> impl IntoResponse {
    let pushed = state.bridge.set_voicewake_triggers(body.triggers);
    Json(serde_json::json!({
        "triggers": state.bridge.voicewake_triggers(),
        "pushed": pushed,
    }))
}
