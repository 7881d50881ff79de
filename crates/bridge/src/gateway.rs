//! Gateway-side wiring of the node bridge.
//!
//! Connects the bridge callbacks to presence, the capability cache, node
//! event subscriptions and voice-wake trigger pushes, and applies the bind
//! policy when starting the listener.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use nb_domain::config::{BridgeConfig, Config};
use nb_protocol::codes;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};

use crate::broadcast::{BroadcastOptions, EventHub};
use crate::capability::RemoteCapabilityCache;
use crate::error::StartError;
use crate::pairing::{PairRequest, PairingStore};
use crate::presence::{PresenceBoard, PresenceTimers};
use crate::registry::NodeSession;
use crate::server::{
    BridgeHandle, BridgeHandler, BridgeServer, BridgeServerOptions, NodeEvent, NodeRequest,
    NodeResponse, TransportUpgrade,
};
use crate::skills::SkillCatalog;

pub const EVENT_VOICEWAKE_CHANGED: &str = "voicewake.changed";
pub const EVENT_PAIR_REQUESTED: &str = "node.pair.requested";
pub const EVENT_NODE_EVENT: &str = "node.event";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Node subscriptions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Gateway events a node asked to receive.  Cleared on disconnect.
#[derive(Default)]
pub struct NodeSubscriptions {
    by_node: RwLock<HashMap<String, HashSet<String>>>,
}

impl NodeSubscriptions {
    pub fn subscribe(&self, node_id: &str, events: &[String]) {
        let mut by_node = self.by_node.write();
        let set = by_node.entry(node_id.to_string()).or_default();
        set.extend(events.iter().map(|e| e.trim().to_string()).filter(|e| !e.is_empty()));
    }

    pub fn unsubscribe(&self, node_id: &str, events: &[String]) {
        let mut by_node = self.by_node.write();
        if let Some(set) = by_node.get_mut(node_id) {
            for e in events {
                set.remove(e.trim());
            }
            if set.is_empty() {
                by_node.remove(node_id);
            }
        }
    }

    pub fn unsubscribe_all(&self, node_id: &str) -> usize {
        self.by_node
            .write()
            .remove(node_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    pub fn subscribers_for(&self, event: &str) -> Vec<String> {
        self.by_node
            .read()
            .iter()
            .filter(|(_, events)| events.contains(event))
            .map(|(node_id, _)| node_id.clone())
            .collect()
    }

    /// Push `event` to every node subscribed to it.  Returns how many nodes
    /// accepted the frame.
    pub fn deliver(&self, handle: &BridgeHandle, event: &str, payload: &Value) -> usize {
        let node_ids = self.subscribers_for(event);
        if node_ids.is_empty() {
            return 0;
        }
        let payload_json = payload.to_string();
        node_ids
            .iter()
            .filter(|node_id| handle.send_event(node_id, event, Some(payload_json.clone())))
            .count()
    }

    pub fn events_for(&self, node_id: &str) -> Vec<String> {
        let mut events: Vec<String> = self
            .by_node
            .read()
            .get(node_id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        events.sort();
        events
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request seam
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Gateway logic for node-initiated `req` and `event` frames.
#[async_trait]
pub trait NodeRequestHandler: Send + Sync {
    async fn handle_request(&self, node_id: &str, request: NodeRequest) -> NodeResponse;
    async fn handle_event(&self, node_id: &str, event: NodeEvent);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GatewayNodeBridge
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct ListenInfo {
    pub scheme: &'static str,
    pub host: String,
    pub addr: SocketAddr,
}

pub struct GatewayNodeBridge {
    pub handle: BridgeHandle,
    pub hub: Arc<EventHub>,
    pub presence: Arc<PresenceBoard>,
    pub timers: PresenceTimers,
    pub capabilities: Arc<RemoteCapabilityCache>,
    pub pairing: Arc<dyn PairingStore>,
    pub subscriptions: Arc<NodeSubscriptions>,
    voicewake: RwLock<Vec<String>>,
    presence_interval: Duration,
    display_name: String,
    server: Mutex<Option<BridgeServer>>,
    listen: RwLock<Option<ListenInfo>>,
}

impl GatewayNodeBridge {
    pub fn new(
        config: &Config,
        pairing: Arc<dyn PairingStore>,
        catalog: Arc<dyn SkillCatalog>,
        hub: Arc<EventHub>,
    ) -> Arc<Self> {
        let capabilities = RemoteCapabilityCache::new(
            catalog,
            Duration::from_millis(config.skills.probe_timeout_ms),
        )
        .with_pairing_store(pairing.clone());
        let handle = BridgeHandle::new(Duration::from_millis(config.bridge.invoke_timeout_ms));
        let subscriptions = Arc::new(NodeSubscriptions::default());
        let presence = PresenceBoard::new(hub.clone())
            .with_node_delivery(handle.clone(), subscriptions.clone());
        Arc::new(Self {
            handle,
            presence: Arc::new(presence),
            hub,
            timers: PresenceTimers::new(),
            capabilities: Arc::new(capabilities),
            pairing,
            subscriptions,
            voicewake: RwLock::new(config.voicewake.triggers.clone()),
            presence_interval: Duration::from_secs(config.bridge.presence_interval_secs.max(1)),
            display_name: resolve_display_name(&config.bridge),
            server: Mutex::new(None),
            listen: RwLock::new(None),
        })
    }

    /// Start the node listener.  Every failure is logged as a warning and
    /// returned; the gateway keeps running without remote-node features.
    pub async fn start(
        self: &Arc<Self>,
        config: &BridgeConfig,
        requests: Option<Arc<dyn NodeRequestHandler>>,
        upgrade: Option<Arc<dyn TransportUpgrade>>,
    ) -> Result<ListenInfo, StartError> {
        let result = self.try_start(config, requests, upgrade).await;
        if let Err(e) = &result {
            match e {
                StartError::Disabled => tracing::info!("node bridge disabled"),
                _ => tracing::warn!(error = %e, "node bridge not started; refusing to start bridge"),
            }
        }
        result
    }

    async fn try_start(
        self: &Arc<Self>,
        config: &BridgeConfig,
        requests: Option<Arc<dyn NodeRequestHandler>>,
        upgrade: Option<Arc<dyn TransportUpgrade>>,
    ) -> Result<ListenInfo, StartError> {
        if !config.enabled {
            return Err(StartError::Disabled);
        }
        let host = config.resolve_bind_host().ok_or_else(|| {
            StartError::BindPolicy(format!(
                "bind = {:?} needs a valid IP address in bridge.host (got {:?})",
                config.bind, config.host
            ))
        })?;
        if config.tls.is_some() && upgrade.is_none() {
            return Err(StartError::TlsUnavailable);
        }

        self.capabilities.prime().await;

        let handler = Arc::new(GatewayBridgeHandler {
            bridge: Arc::downgrade(self),
            requests,
        });
        let options = BridgeServerOptions::from_config(config, host.clone(), self.display_name.clone());
        let server = BridgeServer::start(
            self.handle.clone(),
            options,
            self.pairing.clone(),
            handler,
            upgrade,
        )
        .await?;

        let info = ListenInfo {
            scheme: server.scheme(),
            host: host.clone(),
            addr: server.local_addr(),
        };
        tracing::info!(
            "listening on {}://{}:{} (node)",
            info.scheme,
            host,
            info.addr.port()
        );
        *self.listen.write() = Some(info.clone());
        *self.server.lock() = Some(server);
        Ok(info)
    }

    pub fn listen_info(&self) -> Option<ListenInfo> {
        self.listen.read().clone()
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Broadcast to UI subscribers and to nodes subscribed to `event`.
    pub fn broadcast(&self, event: &str, payload: Value, opts: BroadcastOptions) -> u64 {
        self.subscriptions.deliver(&self.handle, event, &payload);
        self.hub.broadcast(event, payload, opts)
    }

    pub fn voicewake_triggers(&self) -> Vec<String> {
        self.voicewake.read().clone()
    }

    /// Replace the trigger words and push them to every connected node.
    pub fn set_voicewake_triggers(&self, triggers: Vec<String>) -> usize {
        let triggers: Vec<String> = triggers
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        *self.voicewake.write() = triggers;
        let mut pushed = 0;
        for node in self.handle.list_connected() {
            if self.push_voicewake(&node.node_id) {
                pushed += 1;
            }
        }
        tracing::info!(nodes = pushed, "voicewake triggers updated");
        pushed
    }

    fn push_voicewake(&self, node_id: &str) -> bool {
        let payload = json!({ "triggers": self.voicewake_triggers() });
        self.handle
            .send_event(node_id, EVENT_VOICEWAKE_CHANGED, Some(payload.to_string()))
    }

    pub async fn shutdown(&self) {
        self.timers.stop_all();
        let server = self.server.lock().take();
        if let Some(server) = server {
            server.shutdown().await;
        }
        *self.listen.write() = None;
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    async fn node_authenticated(&self, node: &NodeSession) {
        self.presence.beacon(node, "node-connected");
        self.timers
            .start(node.clone(), self.presence.clone(), self.presence_interval);
        self.capabilities.record_remote_node_info(node);
        self.capabilities.bump_snapshot("remote-node");
        self.capabilities
            .refresh_remote_node_bins(&self.handle, node)
            .await;
        self.push_voicewake(&node.node_id);
    }

    fn node_disconnected(&self, node: &NodeSession) {
        let dropped = self.subscriptions.unsubscribe_all(&node.node_id);
        if dropped > 0 {
            tracing::debug!(node_id = %node.node_id, dropped, "node subscriptions cleared");
        }
        self.timers.stop(&node.node_id);
        self.capabilities.mark_disconnected(&node.node_id);
        self.presence.beacon(node, "node-disconnected");
    }

    fn pair_requested(&self, request: &PairRequest) {
        let payload = serde_json::to_value(request).unwrap_or(Value::Null);
        self.hub
            .broadcast(EVENT_PAIR_REQUESTED, payload, BroadcastOptions::drop_if_slow());
    }
}

fn resolve_display_name(config: &BridgeConfig) -> String {
    let configured = config.display_name.trim();
    if !configured.is_empty() {
        return configured.to_string();
    }
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "nodebridge".to_string())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct GatewayBridgeHandler {
    bridge: Weak<GatewayNodeBridge>,
    requests: Option<Arc<dyn NodeRequestHandler>>,
}

#[async_trait]
impl BridgeHandler for GatewayBridgeHandler {
    async fn on_request(&self, node_id: &str, request: NodeRequest) -> NodeResponse {
        match &self.requests {
            Some(requests) => requests.handle_request(node_id, request).await,
            None => NodeResponse::error(
                codes::INVALID_REQUEST,
                format!("unknown method: {}", request.method),
            ),
        }
    }

    async fn on_authenticated(&self, node: &NodeSession) {
        if let Some(bridge) = self.bridge.upgrade() {
            bridge.node_authenticated(node).await;
        }
    }

    async fn on_disconnected(&self, node: &NodeSession) {
        if let Some(bridge) = self.bridge.upgrade() {
            bridge.node_disconnected(node);
        }
    }

    async fn on_event(&self, node_id: &str, event: NodeEvent) {
        if let Some(requests) = &self.requests {
            requests.handle_event(node_id, event).await;
            return;
        }
        if let Some(bridge) = self.bridge.upgrade() {
            let payload = event
                .payload_json
                .as_deref()
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or(Value::Null);
            bridge.hub.broadcast(
                EVENT_NODE_EVENT,
                json!({ "nodeId": node_id, "event": event.event, "payload": payload }),
                BroadcastOptions::drop_if_slow(),
            );
        }
    }

    async fn on_pair_requested(&self, request: &PairRequest) {
        if let Some(bridge) = self.bridge.upgrade() {
            bridge.pair_requested(request);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairing::FilePairingStore;
    use crate::skills::StaticSkillCatalog;
    use nb_domain::config::BindMode;
    use nb_protocol::NodeIdentity;

    fn bridge() -> Arc<GatewayNodeBridge> {
        GatewayNodeBridge::new(
            &Config::default(),
            Arc::new(FilePairingStore::in_memory()),
            Arc::new(StaticSkillCatalog::default()),
            Arc::new(EventHub::new(16)),
        )
    }

    #[test]
    fn subscriptions_track_events_per_node() {
        let subs = NodeSubscriptions::default();
        subs.subscribe("n1", &["chat".into(), "presence".into()]);
        subs.subscribe("n2", &["chat".into()]);

        let mut chat = subs.subscribers_for("chat");
        chat.sort();
        assert_eq!(chat, vec!["n1", "n2"]);

        subs.unsubscribe("n1", &["chat".into()]);
        assert_eq!(subs.events_for("n1"), vec!["presence"]);
        assert_eq!(subs.unsubscribe_all("n1"), 1);
        assert_eq!(subs.unsubscribe_all("n1"), 0);
    }

    #[tokio::test]
    async fn custom_bind_without_ip_refuses_to_start() {
        let b = bridge();
        let config = BridgeConfig {
            bind: BindMode::Custom,
            host: "tailnet".into(),
            ..Default::default()
        };
        let err = b.start(&config, None, None).await.unwrap_err();
        assert!(matches!(err, StartError::BindPolicy(_)));
        assert!(b.listen_info().is_none());
    }

    #[tokio::test]
    async fn tls_without_transport_refuses_to_start() {
        let b = bridge();
        let config = BridgeConfig {
            bind: BindMode::Loopback,
            port: 0,
            tls: Some(nb_domain::config::BridgeTlsConfig {
                cert_path: "/tmp/cert.pem".into(),
                key_path: "/tmp/key.pem".into(),
            }),
            ..Default::default()
        };
        assert!(matches!(
            b.start(&config, None, None).await,
            Err(StartError::TlsUnavailable)
        ));
    }

    #[tokio::test]
    async fn disabled_bridge_does_not_listen() {
        let b = bridge();
        let config = BridgeConfig {
            enabled: false,
            ..Default::default()
        };
        assert!(matches!(
            b.start(&config, None, None).await,
            Err(StartError::Disabled)
        ));
    }

    #[tokio::test]
    async fn loopback_start_reports_tcp_scheme() {
        let b = bridge();
        let config = BridgeConfig {
            bind: BindMode::Loopback,
            port: 0,
            ..Default::default()
        };
        let info = b.start(&config, None, None).await.unwrap();
        assert_eq!(info.scheme, "tcp");
        assert_eq!(info.host, "127.0.0.1");
        assert_ne!(info.addr.port(), 0);
        b.shutdown().await;
        assert!(b.listen_info().is_none());
    }

    #[test]
    fn voicewake_triggers_are_trimmed() {
        let b = bridge();
        b.set_voicewake_triggers(vec![" computer ".into(), "".into()]);
        assert_eq!(b.voicewake_triggers(), vec!["computer"]);
    }

    #[test]
    fn pair_requests_reach_ui_subscribers() {
        let b = bridge();
        let mut sub = b.hub.subscribe();
        b.pair_requested(&PairRequest {
            request_id: "req-1".into(),
            node: NodeIdentity {
                node_id: "studio".into(),
                ..Default::default()
            },
            remote_ip: None,
            silent: false,
            requested_at: chrono::Utc::now(),
        });
        let event = sub.try_recv().unwrap();
        assert_eq!(event.event, EVENT_PAIR_REQUESTED);
        assert_eq!(event.payload["requestId"], "req-1");
        assert_eq!(event.payload["node"]["nodeId"], "studio");
    }

    #[test]
    fn configured_display_name_wins() {
        let config = BridgeConfig {
            display_name: " studio ".into(),
            ..Default::default()
        };
        assert_eq!(resolve_display_name(&config), "studio");
    }
}
