use axum::extract::State;
use axum::response::{IntoResponse, Json};

use crate::state::AppState;

/// GET /v1/skills/remote — what remote macOS nodes can run right now.
pub async fn remote_skills(State(state): State<AppState>) -> impl IntoResponse {
    let caps = &state.bridge.capabilities;
    Json(serde_json::json!({
        "eligibility": caps.remote_skill_eligibility(),
        "requiredBins": caps.required_bins(),
        "nodes": caps.records(),
        "skillsSnapshot": caps.snapshot_version(),
    }))
}
