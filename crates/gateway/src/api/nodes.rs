//! Node management REST endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use nb_bridge::{BridgeError, InvokeRequest, ProbeOutcome};
use serde::Deserialize;
use serde_json::{json, Value};

use super::api_error;
use crate::state::AppState;

/// GET /v1/nodes — list connected nodes.
pub async fn list_nodes(State(state): State<AppState>) -> impl IntoResponse {
    let nodes = state.bridge.handle.registry().summaries();
    Json(json!({
        "nodes": nodes,
        "count": nodes.len(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeBody {
    pub command: String,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// POST /v1/nodes/:node_id/invoke — run a command on a node.
///
/// The node's answer is returned as-is (including `ok: false`); bridge
/// connectivity failures map to `503 UNAVAILABLE`, frames over the bridge
/// limit to `413 PAYLOAD_TOO_LARGE`.
pub async fn invoke_node(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    Json(body): Json<InvokeBody>,
) -> Response {
    if body.command.trim().is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "INVALID_REQUEST", "command is required");
    }

    let mut request = InvokeRequest::new(&node_id, body.command.trim());
    if let Some(params) = &body.params {
        request = request.with_params(params);
    }
    if let Some(ms) = body.timeout_ms {
        request = request.with_timeout_ms(ms);
    }

    match state.bridge.handle.invoke(request).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => bridge_error(&node_id, e),
    }
}

fn bridge_error(node_id: &str, e: BridgeError) -> Response {
    tracing::info!(node_id = %node_id, error = %e, "node invoke failed");
    let status = match e {
        BridgeError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    };
    let shape = e.to_shape();
    api_error(status, &shape.code, shape.message)
}

#[derive(Debug, Deserialize)]
pub struct EventBody {
    pub event: String,
    #[serde(default)]
    pub payload: Option<Value>,
}

/// POST /v1/nodes/:node_id/events — best-effort event push.
pub async fn send_node_event(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    Json(body): Json<EventBody>,
) -> Response {
    if body.event.trim().is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "INVALID_REQUEST", "event is required");
    }
    let delivered = state.bridge.handle.send_event(
        &node_id,
        body.event.trim(),
        body.payload.map(|p| p.to_string()),
    );
    Json(json!({ "delivered": delivered })).into_response()
}

/// POST /v1/nodes/refresh-bins — re-probe every connected node.
pub async fn refresh_bins(State(state): State<AppState>) -> impl IntoResponse {
    let bridge = &state.bridge;
    let outcomes = bridge
        .capabilities
        .refresh_remote_bins_for_connected_nodes(&bridge.handle)
        .await;
    let results: Vec<Value> = outcomes
        .into_iter()
        .map(|(node_id, outcome)| match outcome {
            ProbeOutcome::Skipped => json!({ "nodeId": node_id, "outcome": "skipped" }),
            ProbeOutcome::Probed(bins) => {
                json!({ "nodeId": node_id, "outcome": "probed", "bins": bins })
            }
            ProbeOutcome::Failed(failure) => {
                json!({ "nodeId": node_id, "outcome": "failed", "reason": format!("{failure:?}") })
            }
        })
        .collect();
    Json(json!({
        "results": results,
        "skillsSnapshot": bridge.capabilities.snapshot_version(),
    }))
}
