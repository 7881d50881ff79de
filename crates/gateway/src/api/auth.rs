//! API authentication middleware.
//!
//! Reads the env var named by `config.server.api_token_env` (default
//! `NB_API_TOKEN`) **once at startup** and caches the SHA-256 digest in
//! `AppState`.
//! - If the env var is set and non-empty, every `/v1` request must carry
//!   `Authorization: Bearer <token>`.  WebSocket upgrades may pass
//!   `?token=<token>` instead, since browsers cannot set headers on them.
//! - If the env var is unset or empty, access is unauthenticated.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Request, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::state::AppState;

/// Axum middleware that enforces bearer-token authentication.
/// Attach via `axum::middleware::from_fn_with_state`.
pub async fn require_api_token(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let expected_hash = match &state.api_token_hash {
        Some(h) => h,
        None => return next.run(req).await,
    };

    let provided = bearer_token(&req)
        .or_else(|| query_token(&req))
        .unwrap_or_default();

    // Hash first so the comparison is fixed-length and constant-time.
    let provided_hash = Sha256::digest(provided.as_bytes());
    if !bool::from(provided_hash.ct_eq(expected_hash.as_slice())) {
        return super::api_error(
            StatusCode::UNAUTHORIZED,
            "UNAUTHORIZED",
            "invalid or missing API token",
        );
    }

    next.run(req).await
}

fn bearer_token(req: &Request<Body>) -> Option<String> {
    req.headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

/// `?token=` is honoured only on WebSocket upgrade requests.
fn query_token(req: &Request<Body>) -> Option<String> {
    let is_upgrade = req
        .headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    if !is_upgrade {
        return None;
    }
    req.uri()
        .query()?
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
        .map(str::to_string)
}
