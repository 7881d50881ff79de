pub mod auth;
pub mod events;
pub mod health;
pub mod nodes;
pub mod pairing;
pub mod presence;
pub mod skills;
pub mod voicewake;

use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

/// Build the full API router.
///
/// Every `/v1` route sits behind the bearer-token middleware, which is a
/// no-op when no token is configured.
pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        // Health
        .route("/v1/health", get(health::health))
        // Nodes
        .route("/v1/nodes", get(nodes::list_nodes))
        .route("/v1/nodes/refresh-bins", post(nodes::refresh_bins))
        .route("/v1/nodes/:node_id/invoke", post(nodes::invoke_node))
        .route("/v1/nodes/:node_id/events", post(nodes::send_node_event))
        // Remote skills
        .route("/v1/skills/remote", get(skills::remote_skills))
        // Pairing
        .route("/v1/pairing", get(pairing::list_pairing))
        .route("/v1/pairing/:request_id/approve", post(pairing::approve))
        .route("/v1/pairing/:request_id/reject", post(pairing::reject))
        // Presence
        .route("/v1/presence", get(presence::list_presence))
        // Voice wake
        .route(
            "/v1/voicewake",
            get(voicewake::get_triggers).put(voicewake::set_triggers),
        )
        // UI subscribers
        .route("/v1/events/ws", get(events::events_ws))
        .route_layer(middleware::from_fn_with_state(
            state,
            auth::require_api_token,
        ))
}

/// JSON error body shared by every handler: `{"error": {code, message}}`.
pub(crate) fn api_error(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({
            "error": { "code": code, "message": message.into() }
        })),
    )
        .into_response()
}
