use std::net::IpAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Node bridge
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Where the node bridge listens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BindMode {
    /// `127.0.0.1` only.
    Loopback,
    /// All interfaces (`0.0.0.0`).
    #[default]
    Lan,
    /// The address in `bridge.host`.
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,
    #[serde(default)]
    pub bind: BindMode,
    /// Only read when `bind = "custom"`.
    #[serde(default)]
    pub host: String,
    #[serde(default = "d_bridge_port")]
    pub port: u16,
    /// Name advertised to nodes in `hello-ok`.  Empty = machine hostname.
    #[serde(default)]
    pub display_name: String,
    /// How long a fresh connection may take to send `hello` / `pair-request`.
    #[serde(default = "d_handshake_timeout")]
    pub handshake_timeout_ms: u64,
    /// A session with no inbound frame for this long is torn down.
    #[serde(default = "d_idle_timeout")]
    pub idle_timeout_ms: u64,
    /// Default timeout for invocations that don't specify one.
    #[serde(default = "d_invoke_timeout")]
    pub invoke_timeout_ms: u64,
    /// Frames longer than this are dropped.
    #[serde(default = "d_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Outbound frame queue depth per node connection.
    #[serde(default = "d_outbound_buffer")]
    pub outbound_buffer: usize,
    /// Presence re-announce interval for connected nodes.
    #[serde(default = "d_presence_interval")]
    pub presence_interval_secs: u64,
    /// TLS material.  The bridge itself does not terminate TLS; an
    /// encrypted transport must be registered by the embedding process.
    #[serde(default)]
    pub tls: Option<BridgeTlsConfig>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: BindMode::default(),
            host: String::new(),
            port: d_bridge_port(),
            display_name: String::new(),
            handshake_timeout_ms: d_handshake_timeout(),
            idle_timeout_ms: d_idle_timeout(),
            invoke_timeout_ms: d_invoke_timeout(),
            max_frame_bytes: d_max_frame_bytes(),
            outbound_buffer: d_outbound_buffer(),
            presence_interval_secs: d_presence_interval(),
            tls: None,
        }
    }
}

impl BridgeConfig {
    /// Resolve the host to bind, or `None` when the bind policy cannot be
    /// satisfied (the bridge then refuses to start).
    pub fn resolve_bind_host(&self) -> Option<String> {
        match self.bind {
            BindMode::Loopback => Some("127.0.0.1".into()),
            BindMode::Lan => Some("0.0.0.0".into()),
            BindMode::Custom => {
                let host = self.host.trim();
                host.parse::<IpAddr>().ok().map(|_| host.to_string())
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeTlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

// ── serde default helpers ───────────────────────────────────────────

fn d_true() -> bool {
    true
}
fn d_bridge_port() -> u16 {
    18790
}
fn d_handshake_timeout() -> u64 {
    10_000
}
fn d_idle_timeout() -> u64 {
    90_000
}
fn d_invoke_timeout() -> u64 {
    30_000
}
fn d_max_frame_bytes() -> usize {
    1024 * 1024
}
fn d_outbound_buffer() -> usize {
    64
}
fn d_presence_interval() -> u64 {
    180
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
