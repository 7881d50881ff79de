use std::sync::Arc;

use nb_bridge::{EventHub, GatewayNodeBridge, PairingStore, SkillCatalog};
use nb_domain::config::Config;

/// Shared application state passed to all API handlers.
#[derive(Clone)]
pub struct AppState {
    // ── Core ──────────────────────────────────────────────────────────
    pub config: Arc<Config>,
    /// UI subscriber fan-out.
    pub hub: Arc<EventHub>,

    // ── Nodes ─────────────────────────────────────────────────────────
    pub bridge: Arc<GatewayNodeBridge>,
    pub pairing: Arc<dyn PairingStore>,
    pub catalog: Arc<dyn SkillCatalog>,

    // ── Security (startup-computed) ───────────────────────────────────
    /// SHA-256 hash of the API bearer token (read once at startup).
    /// `None` = dev mode (no auth enforced).
    pub api_token_hash: Option<Vec<u8>>,
}
