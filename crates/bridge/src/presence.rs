//! Presence board and per-node presence timers.
//!
//! Every presence mutation bumps the presence version and re-broadcasts the
//! full list tagged with the current `(presence, health)` versions.  Health
//! ticks are published through the same lock, so the version pair seen by a
//! subscriber never goes backwards.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crate::broadcast::{BroadcastOptions, EventHub, StateVersion};
use crate::gateway::NodeSubscriptions;
use crate::registry::NodeSession;
use crate::server::BridgeHandle;

/// Entries not refreshed for this long are dropped from the list.
const ENTRY_TTL_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceMode {
    Local,
    Remote,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_family: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_identifier: Option<String>,
    pub mode: PresenceMode,
    pub reason: String,
    pub last_input_seconds: u64,
    pub instance_id: String,
    pub text: String,
    pub updated_at: DateTime<Utc>,
}

pub struct PresenceBoard {
    entries: Mutex<HashMap<String, PresenceRecord>>,
    presence_version: AtomicU64,
    health_version: AtomicU64,
    hub: Arc<EventHub>,
    nodes: Option<(BridgeHandle, Arc<NodeSubscriptions>)>,
}

impl PresenceBoard {
    pub fn new(hub: Arc<EventHub>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            presence_version: AtomicU64::new(0),
            health_version: AtomicU64::new(0),
            hub,
            nodes: None,
        }
    }

    /// Also deliver `presence` and `health` to nodes that subscribed to them.
    pub fn with_node_delivery(
        mut self,
        handle: BridgeHandle,
        subscriptions: Arc<NodeSubscriptions>,
    ) -> Self {
        self.nodes = Some((handle, subscriptions));
        self
    }

    pub fn versions(&self) -> StateVersion {
        StateVersion {
            presence: Some(self.presence_version.load(Ordering::SeqCst)),
            health: Some(self.health_version.load(Ordering::SeqCst)),
        }
    }

    fn bump_health(&self) -> u64 {
        self.health_version.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Current presence list, most recently updated first.
    pub fn list(&self) -> Vec<PresenceRecord> {
        let mut entries = self.entries.lock();
        prune(&mut entries);
        sorted(&entries)
    }

    /// Upsert the presence entry for `node`, bump the presence version and
    /// broadcast the new list.  Returns the new presence version.
    pub fn beacon(&self, node: &NodeSession, reason: &str) -> u64 {
        let record = presence_record(node, reason);
        let mut entries = self.entries.lock();
        entries.insert(node.node_id.clone(), record);
        prune(&mut entries);
        let version = self.presence_version.fetch_add(1, Ordering::SeqCst) + 1;
        let list = sorted(&entries);
        // Published under the lock so versions reach subscribers in order.
        self.publish("presence", json!({ "presence": list }), self.versions());
        drop(entries);
        tracing::debug!(node_id = %node.node_id, reason = %reason, version, "presence beacon");
        version
    }

    /// Bump the health version and broadcast `payload` as `health`.
    /// Returns the new health version.
    pub fn broadcast_health(&self, payload: Value) -> u64 {
        let _entries = self.entries.lock();
        let version = self.bump_health();
        self.publish("health", payload, self.versions());
        version
    }

    fn publish(&self, event: &str, payload: Value, versions: StateVersion) {
        if let Some((handle, subscriptions)) = &self.nodes {
            subscriptions.deliver(handle, event, &payload);
        }
        self.hub.broadcast(
            event,
            payload,
            BroadcastOptions::drop_if_slow().with_state_version(versions),
        );
    }
}

fn prune(entries: &mut HashMap<String, PresenceRecord>) {
    let now = Utc::now();
    entries.retain(|_, r| now.signed_duration_since(r.updated_at).num_seconds() < ENTRY_TTL_SECS);
}

fn sorted(entries: &HashMap<String, PresenceRecord>) -> Vec<PresenceRecord> {
    let mut list: Vec<PresenceRecord> = entries.values().cloned().collect();
    list.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    list
}

/// Build the presence entry a remote node announces with.
pub fn presence_record(node: &NodeSession, reason: &str) -> PresenceRecord {
    let host = trimmed(node.display_name.as_deref()).unwrap_or_else(|| node.node_id.clone());
    let ip = trimmed(node.remote_ip.as_deref()).filter(|ip| !is_loopback_address(ip));
    let version = resolve_version_label(node.core_version.as_deref(), node.ui_version.as_deref())
        .or_else(|| trimmed(node.version.as_deref()))
        .unwrap_or_else(|| "unknown".to_string());
    let text = match &ip {
        Some(ip) => format!(
            "Node: {host} ({ip}) · app {version} · last input 0s ago · mode remote · reason {reason}"
        ),
        None => format!(
            "Node: {host} · app {version} · last input 0s ago · mode remote · reason {reason}"
        ),
    };
    PresenceRecord {
        host,
        ip,
        version,
        platform: trimmed(node.platform.as_deref()),
        device_family: trimmed(node.device_family.as_deref()),
        model_identifier: trimmed(node.model_identifier.as_deref()),
        mode: PresenceMode::Remote,
        reason: reason.to_string(),
        last_input_seconds: 0,
        instance_id: node.node_id.clone(),
        text,
        updated_at: Utc::now(),
    }
}

fn trimmed(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// `1.2.3` → `v1.2.3`; values already starting with `v` or a non-digit are
/// kept as-is.
pub fn format_version_label(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.to_lowercase().starts_with('v') {
        return trimmed.to_string();
    }
    if trimmed.starts_with(|c: char| c.is_ascii_digit()) {
        format!("v{trimmed}")
    } else {
        trimmed.to_string()
    }
}

/// `core v1.0 · ui v2.0`, or whichever half is present.
pub fn resolve_version_label(core: Option<&str>, ui: Option<&str>) -> Option<String> {
    let mut parts = Vec::new();
    if let Some(core) = trimmed(core) {
        parts.push(format!("core {}", format_version_label(&core)));
    }
    if let Some(ui) = trimmed(ui) {
        parts.push(format!("ui {}", format_version_label(&ui)));
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" · "))
    }
}

pub fn is_loopback_address(ip: &str) -> bool {
    let ip = ip.trim();
    let ip = ip.strip_prefix("::ffff:").unwrap_or(ip);
    match ip.parse::<IpAddr>() {
        Ok(addr) => addr.is_loopback(),
        Err(_) => ip.eq_ignore_ascii_case("localhost"),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Periodic re-announce
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One periodic presence timer per connected node.
#[derive(Default)]
pub struct PresenceTimers {
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl PresenceTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start re-announcing `node` every `interval`.  Replaces any timer
    /// already running for the node.
    pub fn start(&self, node: NodeSession, board: Arc<PresenceBoard>, interval: Duration) {
        let node_id = node.node_id.clone();
        let handle = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                board.beacon(&node, "periodic");
            }
        });
        if let Some(old) = self.timers.lock().insert(node_id, handle) {
            old.abort();
        }
    }

    /// Stop the node's timer.  Safe to call when none is running.
    pub fn stop(&self, node_id: &str) -> bool {
        match self.timers.lock().remove(node_id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, node_id: &str) -> bool {
        self.timers.lock().contains_key(node_id)
    }

    pub fn stop_all(&self) {
        for (_, handle) in self.timers.lock().drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nb_protocol::NodeIdentity;

    fn node(id: &str) -> NodeSession {
        NodeSession::from_identity(
            NodeIdentity {
                node_id: id.into(),
                display_name: Some("Studio".into()),
                core_version: Some("1.4.0".into()),
                ui_version: Some("v2.0".into()),
                platform: Some("darwin".into()),
                ..Default::default()
            },
            Some("192.168.1.20".into()),
        )
    }

    #[test]
    fn version_label_prefers_core_and_ui() {
        assert_eq!(format_version_label("1.2"), "v1.2");
        assert_eq!(format_version_label("V3"), "V3");
        assert_eq!(format_version_label("beta"), "beta");
        assert_eq!(
            resolve_version_label(Some("1.4.0"), Some("v2.0")).as_deref(),
            Some("core v1.4.0 · ui v2.0")
        );
        assert_eq!(resolve_version_label(Some(" "), None), None);
    }

    #[test]
    fn record_text_includes_ip_unless_loopback() {
        let rec = presence_record(&node("n1"), "node-connected");
        assert_eq!(
            rec.text,
            "Node: Studio (192.168.1.20) · app core v1.4.0 · ui v2.0 · last input 0s ago · mode remote · reason node-connected"
        );

        let mut local = node("n2");
        local.remote_ip = Some("127.0.0.1".into());
        local.display_name = None;
        local.core_version = None;
        local.ui_version = None;
        let rec = presence_record(&local, "periodic");
        assert!(rec.ip.is_none());
        assert_eq!(rec.host, "n2");
        assert_eq!(rec.version, "unknown");
        assert!(rec.text.starts_with("Node: n2 · app unknown"));
    }

    #[test]
    fn loopback_detection() {
        assert!(is_loopback_address("127.0.0.1"));
        assert!(is_loopback_address("::1"));
        assert!(is_loopback_address("::ffff:127.0.0.1"));
        assert!(!is_loopback_address("10.1.2.3"));
    }

    #[test]
    fn beacon_bumps_version_and_broadcasts() {
        let hub = Arc::new(EventHub::new(8));
        let mut sub = hub.subscribe();
        let board = PresenceBoard::new(hub);
        board.bump_health();

        let v1 = board.beacon(&node("n1"), "node-connected");
        let v2 = board.beacon(&node("n1"), "node-disconnected");
        assert!(v2 > v1);
        assert_eq!(board.list().len(), 1);
        assert_eq!(board.list()[0].reason, "node-disconnected");

        let first = sub.try_recv().unwrap();
        assert_eq!(first.event, "presence");
        assert_eq!(
            first.state_version,
            Some(StateVersion {
                presence: Some(v1),
                health: Some(1)
            })
        );
        assert_eq!(sub.try_recv().unwrap().state_version.unwrap().presence, Some(v2));
    }

    #[test]
    fn concurrent_health_ticks_keep_versions_monotonic() {
        let hub = Arc::new(EventHub::new(4096));
        let mut sub = hub.subscribe();
        let board = Arc::new(PresenceBoard::new(hub));

        std::thread::scope(|s| {
            for t in 0..4 {
                let board = board.clone();
                s.spawn(move || {
                    let n = node(&format!("n{t}"));
                    for _ in 0..200 {
                        board.beacon(&n, "periodic");
                    }
                });
            }
            let board = board.clone();
            s.spawn(move || {
                for _ in 0..200 {
                    board.broadcast_health(json!({ "ok": true }));
                }
            });
        });

        let mut last = (0, 0);
        let mut seen = 0;
        while let Some(msg) = sub.try_recv() {
            let v = msg.state_version.unwrap();
            let pair = (v.presence.unwrap(), v.health.unwrap());
            assert!(
                pair.0 >= last.0 && pair.1 >= last.1,
                "seq {} {} carries {pair:?} after {last:?}",
                msg.seq,
                msg.event
            );
            last = pair;
            seen += 1;
        }
        assert_eq!(seen, 1000);
        assert_eq!(last, (800, 200));
    }

    #[test]
    fn subscribed_nodes_receive_presence_and_health() {
        use nb_protocol::BridgeFrame;
        use tokio::sync::mpsc;

        use crate::registry::SessionHandle;

        let handle = BridgeHandle::new(Duration::from_secs(5));
        let (tx, mut rx) = mpsc::channel(8);
        let info = node("n1");
        handle
            .registry()
            .register(Arc::new(SessionHandle::new(info.clone(), 1, tx)));
        let subscriptions = Arc::new(NodeSubscriptions::default());
        subscriptions.subscribe("n1", &["presence".into(), "health".into()]);

        let board = PresenceBoard::new(Arc::new(EventHub::new(8)))
            .with_node_delivery(handle, subscriptions.clone());
        board.beacon(&info, "node-connected");
        board.broadcast_health(json!({ "ok": true }));

        let mut events = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            match frame {
                BridgeFrame::Event { event, payload_json } => {
                    let payload: Value = serde_json::from_str(&payload_json.unwrap()).unwrap();
                    events.push((event, payload));
                }
                other => panic!("expected event, got {other:?}"),
            }
        }
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0, "presence");
        assert_eq!(events[0].1["presence"][0]["host"], "Studio");
        assert_eq!(events[1], ("health".to_string(), json!({ "ok": true })));

        subscriptions.unsubscribe_all("n1");
        board.beacon(&info, "periodic");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn timer_reannounces_until_stopped() {
        let hub = Arc::new(EventHub::new(16));
        let board = Arc::new(PresenceBoard::new(hub));
        let timers = PresenceTimers::new();

        timers.start(node("n1"), board.clone(), Duration::from_secs(180));
        assert!(timers.is_running("n1"));

        tokio::time::sleep(Duration::from_secs(181)).await;
        assert_eq!(board.versions().presence, Some(1));
        tokio::time::sleep(Duration::from_secs(180)).await;
        assert_eq!(board.versions().presence, Some(2));

        assert!(timers.stop("n1"));
        assert!(!timers.stop("n1"));
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(board.versions().presence, Some(2));
    }
}
