//! AppState construction and background-task spawning extracted from `main.rs`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use nb_bridge::{
    EventHub, FilePairingStore, GatewayNodeBridge, NodeRequestHandler, PairingStore,
    SkillCatalog,
};
use nb_domain::config::{Config, ConfigSeverity};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::requests::GatewayRequests;
use crate::skills::WorkspaceSkillCatalog;
use crate::state::AppState;

/// Validate config and wire every subsystem.  The node listener is not
/// started here; see [`start_node_bridge`].
pub fn build_app_state(config: Arc<Config>) -> anyhow::Result<AppState> {
    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    let errors = issues
        .iter()
        .filter(|i| i.severity == ConfigSeverity::Error)
        .count();
    if errors > 0 {
        anyhow::bail!("config validation failed with {errors} error(s)");
    }

    // ── Pairing store ────────────────────────────────────────────────
    let pairing: Arc<dyn PairingStore> =
        Arc::new(FilePairingStore::open(&config.pairing).context("opening pairing store")?);

    // ── Skills ───────────────────────────────────────────────────────
    let catalog: Arc<dyn SkillCatalog> =
        Arc::new(WorkspaceSkillCatalog::new(config.skills.workspaces.clone()));
    tracing::info!(
        workspaces = config.skills.workspaces.len(),
        skills = catalog.load_skills().len(),
        "skill catalog ready"
    );

    // ── Broadcaster + node bridge ────────────────────────────────────
    let hub = Arc::new(EventHub::new(config.broadcast.subscriber_buffer));
    let bridge = GatewayNodeBridge::new(&config, pairing.clone(), catalog.clone(), hub.clone());

    // ── API token (read once, hash for constant-time comparison) ────
    let api_token_hash = {
        let env_var = &config.server.api_token_env;
        match std::env::var(env_var).ok().filter(|t| !t.is_empty()) {
            Some(token) => {
                tracing::info!(source = %env_var, "API token auth enabled");
                Some(Sha256::digest(token.as_bytes()).to_vec())
            }
            None => {
                tracing::warn!(
                    env_var = %env_var,
                    "API token not set; /v1 endpoints are unauthenticated"
                );
                None
            }
        }
    };

    Ok(AppState {
        config,
        hub,
        bridge,
        pairing,
        catalog,
        api_token_hash,
    })
}

/// Start the node listener.  A refusal is logged by the bridge and the
/// gateway keeps serving without remote nodes.
pub async fn start_node_bridge(state: &AppState) -> bool {
    let requests: Arc<dyn NodeRequestHandler> =
        Arc::new(GatewayRequests::new(&state.bridge, state.catalog.clone()));
    state
        .bridge
        .start(&state.config.bridge, Some(requests), None)
        .await
        .is_ok()
}

/// One health tick: bump the health version and broadcast it to UI
/// subscribers and subscribed nodes.  Returns the new health version.
pub fn broadcast_health(state: &AppState) -> u64 {
    let bridge = &state.bridge;
    bridge.presence.broadcast_health(json!({
        "ok": true,
        "ts": chrono::Utc::now().timestamp_millis(),
        "connected": bridge.handle.registry().len(),
        "skillsSnapshot": bridge.capabilities.snapshot_version(),
    }))
}

/// Spawn periodic background loops.
pub fn spawn_background_tasks(state: &AppState) {
    // ── Health tick ─────────────────────────────────────────────────
    {
        let state = state.clone();
        let period = Duration::from_secs(state.config.broadcast.health_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                interval.tick().await;
                broadcast_health(&state);
            }
        });
    }
    tracing::info!("background tasks spawned");
}
