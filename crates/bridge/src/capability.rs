//! Remote capability cache.
//!
//! Tracks which binaries each qualifying remote node has installed and
//! turns that into a skill-eligibility predicate.  Records are refreshed by
//! probing the node over the bridge and survive disconnects, but a node
//! whose session is gone no longer counts towards eligibility.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;

use crate::error::BridgeError;
use crate::invoke::{InvokeRequest, InvokeResult};
use crate::pairing::{NodeMetadataPatch, PairingStore};
use crate::registry::NodeSession;
use crate::skills::{collect_required_bins, SkillCatalog};

/// Platform the remote skill set is evaluated for.
pub const REMOTE_PLATFORM: &str = "darwin";

pub const CMD_SYSTEM_RUN: &str = "system.run";
pub const CMD_SYSTEM_WHICH: &str = "system.which";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Invoker seam
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The part of the bridge the cache needs: invoke a node, list sessions.
#[async_trait]
pub trait NodeInvoker: Send + Sync {
    async fn invoke(&self, request: InvokeRequest) -> Result<InvokeResult, BridgeError>;
    fn list_connected(&self) -> Vec<NodeSession>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Restored from the pairing store; no session seen yet.
    Primed,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteNodeRecord {
    pub node_id: String,
    pub display_name: Option<String>,
    pub platform: Option<String>,
    pub device_family: Option<String>,
    pub commands: Vec<String>,
    pub remote_ip: Option<String>,
    pub bins: BTreeSet<String>,
    pub last_probed_at: Option<DateTime<Utc>>,
    pub state: SessionState,
}

impl RemoteNodeRecord {
    fn new(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            display_name: None,
            platform: None,
            device_family: None,
            commands: Vec::new(),
            remote_ip: None,
            bins: BTreeSet::new(),
            last_probed_at: None,
            state: SessionState::Primed,
        }
    }

    fn qualifies(&self) -> bool {
        is_mac_platform(self.platform.as_deref(), self.device_family.as_deref())
            && self.commands.iter().any(|c| c == CMD_SYSTEM_RUN)
    }

    fn label(&self) -> String {
        self.display_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(&self.node_id)
            .to_string()
    }

    /// `name (id) @ ip`, for log lines.
    fn describe(&self) -> String {
        let base = match self.display_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() && name != self.node_id => {
                format!("{name} ({})", self.node_id)
            }
            _ => self.node_id.clone(),
        };
        match self.remote_ip.as_deref().map(str::trim) {
            Some(ip) if !ip.is_empty() => format!("{base} @ {ip}"),
            _ => base,
        }
    }
}

/// Eligibility view handed to skill filtering.
#[derive(Debug, Clone, Serialize)]
pub struct RemoteSkillEligibility {
    pub platforms: Vec<String>,
    pub bins: BTreeSet<String>,
    pub note: String,
}

impl RemoteSkillEligibility {
    pub fn has_bin(&self, bin: &str) -> bool {
        self.bins.contains(bin)
    }

    pub fn has_any_bin<S: AsRef<str>>(&self, bins: &[S]) -> bool {
        bins.iter().any(|b| self.bins.contains(b.as_ref()))
    }
}

/// Why a probe did not produce bins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeFailure {
    NotConnected,
    Timeout,
    ConnectionClosed,
    Other(String),
}

impl ProbeFailure {
    pub fn classify(message: &str) -> Self {
        if message.contains("UNAVAILABLE: node not connected") {
            Self::NotConnected
        } else if message.contains("UNAVAILABLE: invoke timeout") {
            Self::Timeout
        } else if message.contains("bridge connection closed") {
            Self::ConnectionClosed
        } else {
            Self::Other(message.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The node does not qualify, or no skill needs any binary.
    Skipped,
    Probed(Vec<String>),
    Failed(ProbeFailure),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cache
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct RemoteCapabilityCache {
    records: RwLock<HashMap<String, RemoteNodeRecord>>,
    snapshot: watch::Sender<u64>,
    catalog: Arc<dyn SkillCatalog>,
    pairing: Option<Arc<dyn PairingStore>>,
    probe_timeout: Duration,
}

impl RemoteCapabilityCache {
    pub fn new(catalog: Arc<dyn SkillCatalog>, probe_timeout: Duration) -> Self {
        let (snapshot, _) = watch::channel(0);
        Self {
            records: RwLock::new(HashMap::new()),
            snapshot,
            catalog,
            pairing: None,
            probe_timeout,
        }
    }

    /// Persist probed bins to (and prime from) this pairing store.
    pub fn with_pairing_store(mut self, pairing: Arc<dyn PairingStore>) -> Self {
        self.pairing = Some(pairing);
        self
    }

    // ── Snapshot version ────────────────────────────────────────────

    pub fn snapshot_version(&self) -> u64 {
        *self.snapshot.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.snapshot.subscribe()
    }

    /// Invalidate derived skill views.  Returns the new version.
    pub fn bump_snapshot(&self, reason: &str) -> u64 {
        let mut next = 0;
        self.snapshot.send_modify(|v| {
            *v += 1;
            next = *v;
        });
        tracing::debug!(reason = %reason, version = next, "skills snapshot bumped");
        next
    }

    // ── Records ─────────────────────────────────────────────────────

    /// Seed records from the pairing store.  Bumps the snapshot once when at
    /// least one qualifying node was restored.
    pub async fn prime(&self) {
        let Some(pairing) = &self.pairing else {
            return;
        };
        let paired = match pairing.list_paired().await {
            Ok(paired) => paired,
            Err(e) => {
                tracing::warn!(error = %e, "failed to prime remote skills cache");
                return;
            }
        };
        let mut saw_qualifying = false;
        {
            let mut records = self.records.write();
            for node in paired {
                let record = records
                    .entry(node.node_id.clone())
                    .or_insert_with(|| RemoteNodeRecord::new(&node.node_id));
                merge(&mut record.display_name, node.display_name);
                merge(&mut record.platform, node.platform);
                merge(&mut record.device_family, node.device_family);
                merge(&mut record.remote_ip, node.remote_ip);
                if !node.commands.is_empty() {
                    record.commands = node.commands;
                }
                record.bins = node.bins.into_iter().collect();
                saw_qualifying |= record.qualifies();
            }
        }
        if saw_qualifying {
            self.bump_snapshot("remote-node");
        }
    }

    /// Record metadata of a freshly authenticated node.  Cached bins are
    /// kept until the next probe replaces them.
    pub fn record_remote_node_info(&self, node: &NodeSession) {
        let mut records = self.records.write();
        let record = records
            .entry(node.node_id.clone())
            .or_insert_with(|| RemoteNodeRecord::new(&node.node_id));
        merge(&mut record.display_name, node.display_name.clone());
        merge(&mut record.platform, node.platform.clone());
        merge(&mut record.device_family, node.device_family.clone());
        merge(&mut record.remote_ip, node.remote_ip.clone());
        record.commands = node.commands.clone();
        record.state = SessionState::Connected;
    }

    pub fn record_remote_node_bins(&self, node_id: &str, bins: &[String]) {
        let mut records = self.records.write();
        let record = records
            .entry(node_id.to_string())
            .or_insert_with(|| RemoteNodeRecord::new(node_id));
        record.bins = bins.iter().cloned().collect();
        record.last_probed_at = Some(Utc::now());
    }

    /// The node's session is gone.  Its record stays for the next connect.
    pub fn mark_disconnected(&self, node_id: &str) {
        if let Some(record) = self.records.write().get_mut(node_id) {
            record.state = SessionState::Disconnected;
        }
    }

    pub fn records(&self) -> Vec<RemoteNodeRecord> {
        let mut list: Vec<_> = self.records.read().values().cloned().collect();
        list.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        list
    }

    fn describe(&self, node_id: &str) -> String {
        self.records
            .read()
            .get(node_id)
            .map(|r| r.describe())
            .unwrap_or_else(|| node_id.to_string())
    }

    // ── Eligibility ─────────────────────────────────────────────────

    /// Eligibility across every qualifying node that is not disconnected,
    /// or `None` when there is no such node.
    pub fn remote_skill_eligibility(&self) -> Option<RemoteSkillEligibility> {
        let records = self.records.read();
        let mut nodes: Vec<&RemoteNodeRecord> = records
            .values()
            .filter(|r| r.state != SessionState::Disconnected && r.qualifies())
            .collect();
        if nodes.is_empty() {
            return None;
        }
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));

        let bins: BTreeSet<String> = nodes.iter().flat_map(|r| r.bins.iter().cloned()).collect();
        let labels: Vec<String> = nodes.iter().map(|r| r.label()).collect();
        let note = format!(
            "Remote macOS node available ({}). Run macOS-only skills via nodes.run on that node.",
            labels.join(", ")
        );
        Some(RemoteSkillEligibility {
            platforms: vec![REMOTE_PLATFORM.to_string()],
            bins,
            note,
        })
    }

    // ── Probing ─────────────────────────────────────────────────────

    /// Binaries every skill for the remote platform needs.
    pub fn required_bins(&self) -> Vec<String> {
        collect_required_bins(&self.catalog.load_skills(), REMOTE_PLATFORM)
    }

    /// Probe `node` for the required binaries and cache the result.
    /// Failures are logged, never raised.
    pub async fn refresh_remote_node_bins(
        &self,
        invoker: &dyn NodeInvoker,
        node: &NodeSession,
    ) -> ProbeOutcome {
        if !is_mac_platform(node.platform.as_deref(), node.device_family.as_deref()) {
            return ProbeOutcome::Skipped;
        }
        let can_which = node.declares(CMD_SYSTEM_WHICH);
        let can_run = node.declares(CMD_SYSTEM_RUN);
        if !can_which && !can_run {
            return ProbeOutcome::Skipped;
        }
        let required = self.required_bins();
        if required.is_empty() {
            return ProbeOutcome::Skipped;
        }

        let request = if can_which {
            InvokeRequest::new(&node.node_id, CMD_SYSTEM_WHICH)
                .with_params(&json!({ "bins": required }))
        } else {
            InvokeRequest::new(&node.node_id, CMD_SYSTEM_RUN).with_params(&json!({
                "command": ["/bin/sh", "-lc", build_bin_probe_script(&required)],
            }))
        }
        .with_timeout_ms(self.probe_timeout.as_millis() as u64);

        let message = match invoker.invoke(request).await {
            Ok(res) if res.ok => {
                let bins = parse_bin_probe_payload(res.payload_json.as_deref());
                self.record_remote_node_bins(&node.node_id, &bins);
                if let Some(pairing) = &self.pairing {
                    if let Err(e) = pairing
                        .update_metadata(&node.node_id, NodeMetadataPatch::bins(bins.clone()))
                        .await
                    {
                        tracing::warn!(node_id = %node.node_id, error = %e, "failed to persist probed bins");
                    }
                }
                self.bump_snapshot("remote-node");
                tracing::info!(
                    node_id = %node.node_id,
                    required = required.len(),
                    found = bins.len(),
                    "remote bin probe complete"
                );
                return ProbeOutcome::Probed(bins);
            }
            Ok(res) => res
                .error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            Err(e) => e.to_string(),
        };

        let failure = ProbeFailure::classify(&message);
        self.log_probe_failure(&node.node_id, &failure);
        ProbeOutcome::Failed(failure)
    }

    /// Re-probe every connected node, one at a time.
    pub async fn refresh_remote_bins_for_connected_nodes(
        &self,
        invoker: &dyn NodeInvoker,
    ) -> Vec<(String, ProbeOutcome)> {
        let mut outcomes = Vec::new();
        for node in invoker.list_connected() {
            let outcome = self.refresh_remote_node_bins(invoker, &node).await;
            outcomes.push((node.node_id, outcome));
        }
        outcomes
    }

    fn log_probe_failure(&self, node_id: &str, failure: &ProbeFailure) {
        let label = self.describe(node_id);
        match failure {
            ProbeFailure::NotConnected => tracing::info!(
                node = %label,
                "remote bin probe skipped: node not connected; check nodes list/status"
            ),
            ProbeFailure::Timeout => tracing::warn!(
                node = %label,
                "remote bin probe timed out; check node connectivity"
            ),
            ProbeFailure::ConnectionClosed => tracing::warn!(
                node = %label,
                "remote bin probe aborted: bridge connection closed; check nodes list/status"
            ),
            ProbeFailure::Other(message) => tracing::warn!(
                node = %label,
                error = %message,
                "remote bin probe error"
            ),
        }
    }
}

fn merge(slot: &mut Option<String>, value: Option<String>) {
    if value.is_some() {
        *slot = value;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// macOS: platform mentions `mac` or `darwin`, or the device family is `mac`.
pub fn is_mac_platform(platform: Option<&str>, device_family: Option<&str>) -> bool {
    let platform = platform.unwrap_or("").trim().to_lowercase();
    let family = device_family.unwrap_or("").trim().to_lowercase();
    platform.contains("mac") || platform.contains("darwin") || family == "mac"
}

/// Platform key skill `os` lists are matched against: `darwin` for Macs,
/// otherwise the first word of the reported platform, lowercased.
pub fn skill_platform(platform: Option<&str>, device_family: Option<&str>) -> String {
    if is_mac_platform(platform, device_family) {
        return REMOTE_PLATFORM.to_string();
    }
    platform
        .unwrap_or("")
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_lowercase()
}

/// Shell loop echoing every bin `command -v` can find.
pub fn build_bin_probe_script(bins: &[String]) -> String {
    let quoted: Vec<String> = bins
        .iter()
        .map(|b| format!("'{}'", b.replace('\'', r"'\''")))
        .collect();
    format!(
        r#"for b in {}; do if command -v "$b" >/dev/null 2>&1; then echo "$b"; fi; done"#,
        quoted.join(" ")
    )
}

/// Accepts `{"bins": [...]}` or `{"stdout": "..."}` (one bin per line).
/// Anything else yields no bins.
pub fn parse_bin_probe_payload(payload_json: Option<&str>) -> Vec<String> {
    let Some(raw) = payload_json else {
        return Vec::new();
    };
    let value: serde_json::Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(error = %e, "unparseable bin probe payload");
            return Vec::new();
        }
    };
    if let Some(bins) = value.get("bins").and_then(|b| b.as_array()) {
        return bins
            .iter()
            .map(|b| match b {
                serde_json::Value::String(s) => s.trim().to_string(),
                other => other.to_string(),
            })
            .filter(|b| !b.is_empty())
            .collect();
    }
    if let Some(stdout) = value.get("stdout").and_then(|s| s.as_str()) {
        return stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
    }
    Vec::new()
}
