//! Operator pairing endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use nb_bridge::PairingError;
use serde_json::json;

use super::api_error;
use crate::state::AppState;

/// GET /v1/pairing — pending requests and paired nodes.
pub async fn list_pairing(State(state): State<AppState>) -> Response {
    let pending = state.pairing.list_pending().await;
    match state.pairing.list_paired().await {
        Ok(paired) => Json(json!({ "pending": pending, "paired": paired })).into_response(),
        Err(e) => pairing_error(e),
    }
}

/// POST /v1/pairing/:request_id/approve
pub async fn approve(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
) -> Response {
    match state.pairing.approve(&request_id).await {
        Ok(node) => {
            tracing::info!(request_id = %request_id, node_id = %node.node_id, "pairing approved");
            Json(json!({ "approved": true, "node": node })).into_response()
        }
        Err(e) => pairing_error(e),
    }
}

/// POST /v1/pairing/:request_id/reject
pub async fn reject(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
) -> Response {
    match state.pairing.reject(&request_id).await {
        Ok(()) => {
            tracing::info!(request_id = %request_id, "pairing rejected");
            Json(json!({ "rejected": true })).into_response()
        }
        Err(e) => pairing_error(e),
    }
}

fn pairing_error(e: PairingError) -> Response {
    match e {
        PairingError::UnknownRequest(_) | PairingError::Expired => {
            api_error(StatusCode::NOT_FOUND, "NOT_FOUND", e.to_string())
        }
        PairingError::Rejected => api_error(StatusCode::CONFLICT, "PAIRING_REJECTED", e.to_string()),
        PairingError::Io(_) | PairingError::Format(_) => {
            tracing::warn!(error = %e, "pairing store error");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", e.to_string())
        }
    }
}
