//! Builder pattern for constructing a [`NodeClient`].

use std::sync::Arc;
use std::time::Duration;

use nb_protocol::NodeIdentity;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::client::NodeClient;
use crate::reconnect::ReconnectBackoff;
use crate::types::{GatewayEvent, NodeSdkError};

/// Fluent builder for [`NodeClient`].
///
/// # Example
///
/// ```rust,no_run
/// # use nb_node_sdk::NodeClientBuilder;
/// let client = NodeClientBuilder::new()
///     .gateway_addr("gateway.local:18790")
///     .node_id("mac-studio")
///     .display_name("Studio")
///     .platform("darwin")
///     .device_family("Mac")
///     .token("previously-issued-token")
///     .build()
///     .unwrap();
/// ```
pub struct NodeClientBuilder {
    gateway_addr: String,
    node_id: String,
    display_name: Option<String>,
    platform: Option<String>,
    device_family: Option<String>,
    model_identifier: Option<String>,
    version: Option<String>,
    core_version: Option<String>,
    ui_version: Option<String>,
    token: Option<String>,
    silent_pairing: bool,
    heartbeat_interval: Duration,
    handshake_timeout: Duration,
    reconnect_backoff: ReconnectBackoff,
    max_concurrent_commands: usize,
    max_frame_bytes: usize,
    events: Option<mpsc::Sender<GatewayEvent>>,
}

impl NodeClientBuilder {
    pub fn new() -> Self {
        Self {
            gateway_addr: "127.0.0.1:18790".into(),
            node_id: String::new(),
            display_name: None,
            platform: Some(default_platform().to_string()),
            device_family: None,
            model_identifier: None,
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
            core_version: None,
            ui_version: None,
            token: None,
            silent_pairing: false,
            heartbeat_interval: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            reconnect_backoff: ReconnectBackoff::default(),
            max_concurrent_commands: 16,
            max_frame_bytes: nb_protocol::MAX_FRAME_BYTES,
            events: None,
        }
    }

    // ── Connection ───────────────────────────────────────────────────

    /// `host:port` of the gateway's node bridge.
    pub fn gateway_addr(mut self, addr: impl Into<String>) -> Self {
        self.gateway_addr = addr.into();
        self
    }

    /// Token issued by a previous pairing.  Without one the client sends a
    /// `pair-request` and waits for the operator.
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Ask the gateway not to prompt the UI for this pairing request.
    pub fn silent_pairing(mut self, silent: bool) -> Self {
        self.silent_pairing = silent;
        self
    }

    // ── Identity ─────────────────────────────────────────────────────

    pub fn node_id(mut self, id: impl Into<String>) -> Self {
        self.node_id = id.into();
        self
    }

    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    pub fn device_family(mut self, family: impl Into<String>) -> Self {
        self.device_family = Some(family.into());
        self
    }

    pub fn model_identifier(mut self, model: impl Into<String>) -> Self {
        self.model_identifier = Some(model.into());
        self
    }

    pub fn version(mut self, v: impl Into<String>) -> Self {
        self.version = Some(v.into());
        self
    }

    pub fn core_version(mut self, v: impl Into<String>) -> Self {
        self.core_version = Some(v.into());
        self
    }

    pub fn ui_version(mut self, v: impl Into<String>) -> Self {
        self.ui_version = Some(v.into());
        self
    }

    // ── Behavior ─────────────────────────────────────────────────────

    pub fn heartbeat_interval(mut self, d: Duration) -> Self {
        self.heartbeat_interval = d;
        self
    }

    /// How long to wait for `hello-ok` after sending `hello` (default 10s).
    /// Waiting for an operator's pairing decision is not bounded by this.
    pub fn handshake_timeout(mut self, d: Duration) -> Self {
        self.handshake_timeout = d;
        self
    }

    pub fn reconnect_backoff(mut self, policy: ReconnectBackoff) -> Self {
        self.reconnect_backoff = policy;
        self
    }

    pub fn max_concurrent_commands(mut self, n: usize) -> Self {
        self.max_concurrent_commands = n;
        self
    }

    pub fn max_frame_bytes(mut self, n: usize) -> Self {
        self.max_frame_bytes = n;
        self
    }

    /// Deliver gateway events (e.g. `voicewake.changed`) to this channel.
    /// Events are dropped when the channel is full.
    pub fn events(mut self, tx: mpsc::Sender<GatewayEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn build(self) -> Result<NodeClient, NodeSdkError> {
        if self.gateway_addr.trim().is_empty() {
            return Err(NodeSdkError::Config("gateway_addr is required".into()));
        }
        if self.node_id.trim().is_empty() {
            return Err(NodeSdkError::Config("node_id is required".into()));
        }
        if self.max_concurrent_commands == 0 {
            return Err(NodeSdkError::Config(
                "max_concurrent_commands must be greater than 0".into(),
            ));
        }

        Ok(NodeClient {
            gateway_addr: self.gateway_addr,
            identity: NodeIdentity {
                node_id: self.node_id,
                display_name: self.display_name,
                platform: self.platform,
                version: self.version,
                core_version: self.core_version,
                ui_version: self.ui_version,
                device_family: self.device_family,
                model_identifier: self.model_identifier,
                commands: Vec::new(),
            },
            token: Arc::new(RwLock::new(self.token)),
            silent_pairing: self.silent_pairing,
            heartbeat_interval: self.heartbeat_interval,
            handshake_timeout: self.handshake_timeout,
            reconnect_backoff: self.reconnect_backoff,
            max_concurrent_commands: self.max_concurrent_commands,
            max_frame_bytes: self.max_frame_bytes,
            events: self.events,
            jitter_seed: uuid::Uuid::new_v4().as_u128() as u64,
        })
    }
}

impl Default for NodeClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Platform string for the running OS, as the gateway expects it.
fn default_platform() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    }
}
