//! Pairing store: which nodes may authenticate, and with which token.
//!
//! Paired records are persisted as JSON.  Tokens are only ever stored as
//! SHA-256 digests and compared in constant time.  A pairing request stays
//! pending until an operator approves or rejects it, or until it expires.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nb_domain::config::PairingConfig;
use nb_protocol::NodeIdentity;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::sync::watch;

use crate::error::PairingError;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A paired node and its last-known metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairedNode {
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_family: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_identifier: Option<String>,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_ip: Option<String>,
    /// Binaries confirmed present by the last capability probe.
    #[serde(default)]
    pub bins: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paired_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_connected_at: Option<DateTime<Utc>>,
}

/// A pending pairing request, as shown to operators.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairRequest {
    pub request_id: String,
    pub node: NodeIdentity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_ip: Option<String>,
    pub silent: bool,
    pub requested_at: DateTime<Utc>,
}

/// Outcome of a pairing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairDecision {
    Approved { token: String },
    Rejected,
    Expired,
}

/// Partial update of a paired record.  `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct NodeMetadataPatch {
    pub display_name: Option<String>,
    pub platform: Option<String>,
    pub version: Option<String>,
    pub device_family: Option<String>,
    pub model_identifier: Option<String>,
    pub commands: Option<Vec<String>>,
    pub remote_ip: Option<String>,
    pub bins: Option<Vec<String>>,
    pub last_connected_at: Option<DateTime<Utc>>,
}

impl NodeMetadataPatch {
    pub fn bins(bins: Vec<String>) -> Self {
        Self {
            bins: Some(bins),
            ..Default::default()
        }
    }

    /// Connection metadata presented in the handshake.
    pub fn from_identity(node: &NodeIdentity, remote_ip: Option<&str>) -> Self {
        Self {
            display_name: node.display_name.clone(),
            platform: node.platform.clone(),
            version: node.version.clone(),
            device_family: node.device_family.clone(),
            model_identifier: node.model_identifier.clone(),
            commands: Some(node.commands.clone()),
            remote_ip: remote_ip.map(str::to_string),
            bins: None,
            last_connected_at: Some(Utc::now()),
        }
    }

    fn apply(self, node: &mut PairedNode) {
        fn set<T>(slot: &mut Option<T>, value: Option<T>) {
            if value.is_some() {
                *slot = value;
            }
        }
        set(&mut node.display_name, self.display_name);
        set(&mut node.platform, self.platform);
        set(&mut node.version, self.version);
        set(&mut node.device_family, self.device_family);
        set(&mut node.model_identifier, self.model_identifier);
        set(&mut node.remote_ip, self.remote_ip);
        set(&mut node.last_connected_at, self.last_connected_at);
        if let Some(commands) = self.commands {
            node.commands = commands;
        }
        if let Some(bins) = self.bins {
            node.bins = bins;
        }
    }
}

/// Handle on a pending request.  Several connections for the same node
/// share one request and all observe the same decision.
pub struct PairTicket {
    pub request: PairRequest,
    decision: watch::Receiver<Option<PairDecision>>,
    ttl: Duration,
}

impl PairTicket {
    /// Wait for the operator's decision, or `Expired` after the TTL.
    pub async fn decision(mut self) -> PairDecision {
        let wait = async {
            loop {
                let current = self.decision.borrow().clone();
                if let Some(decision) = current {
                    return decision;
                }
                if self.decision.changed().await.is_err() {
                    return PairDecision::Rejected;
                }
            }
        };
        tokio::time::timeout(self.ttl, wait)
            .await
            .unwrap_or(PairDecision::Expired)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait]
pub trait PairingStore: Send + Sync {
    /// Check a node's token.
    async fn verify(&self, node_id: &str, token: &str) -> bool;

    /// Open (or join) a pairing request for `node`.
    async fn request_pairing(
        &self,
        node: &NodeIdentity,
        remote_ip: Option<&str>,
        silent: bool,
    ) -> Result<PairTicket, PairingError>;

    async fn approve(&self, request_id: &str) -> Result<PairedNode, PairingError>;

    async fn reject(&self, request_id: &str) -> Result<(), PairingError>;

    async fn list_paired(&self) -> Result<Vec<PairedNode>, PairingError>;

    async fn list_pending(&self) -> Vec<PairRequest>;

    /// Merge connection metadata or probed bins into a paired record.
    /// Unknown nodes are ignored.
    async fn update_metadata(
        &self,
        node_id: &str,
        patch: NodeMetadataPatch,
    ) -> Result<(), PairingError>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// File-backed store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredNode {
    #[serde(flatten)]
    node: PairedNode,
    token_hash: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    paired: Vec<StoredNode>,
}

struct PendingEntry {
    request: PairRequest,
    decision: watch::Sender<Option<PairDecision>>,
}

#[derive(Default)]
struct Inner {
    paired: HashMap<String, StoredNode>,
    pending: HashMap<String, PendingEntry>,
}

/// [`PairingStore`] persisted as a JSON file (or kept in memory when no
/// path is configured).
pub struct FilePairingStore {
    path: Option<PathBuf>,
    auto_approve: bool,
    request_ttl: Duration,
    inner: Mutex<Inner>,
    write_lock: tokio::sync::Mutex<()>,
}

impl FilePairingStore {
    /// Load the store from `config.store_path`.  A missing file is an empty
    /// store.
    pub fn open(config: &PairingConfig) -> Result<Self, PairingError> {
        let mut inner = Inner::default();
        if let Some(path) = &config.store_path {
            match std::fs::read_to_string(path) {
                Ok(raw) => {
                    let file: StoreFile = serde_json::from_str(&raw)?;
                    for stored in file.paired {
                        inner.paired.insert(stored.node.node_id.clone(), stored);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            tracing::info!(
                path = %path.display(),
                paired = inner.paired.len(),
                "pairing store loaded"
            );
        }
        Ok(Self {
            path: config.store_path.clone(),
            auto_approve: config.auto_approve,
            request_ttl: Duration::from_secs(config.request_ttl_secs),
            inner: Mutex::new(inner),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// An empty store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            auto_approve: false,
            request_ttl: Duration::from_secs(300),
            inner: Mutex::new(Inner::default()),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_auto_approve(mut self, auto_approve: bool) -> Self {
        self.auto_approve = auto_approve;
        self
    }

    pub fn with_request_ttl(mut self, ttl: Duration) -> Self {
        self.request_ttl = ttl;
        self
    }

    /// Pair `node` directly and return its token.  Used by tests and by
    /// operators pre-provisioning nodes.
    pub async fn insert_paired(&self, node: PairedNode) -> Result<String, PairingError> {
        let token = generate_token();
        self.inner.lock().paired.insert(
            node.node_id.clone(),
            StoredNode {
                node,
                token_hash: hash_token(&token),
            },
        );
        self.persist().await?;
        Ok(token)
    }

    async fn persist(&self) -> Result<(), PairingError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self.write_lock.lock().await;
        let json = {
            let inner = self.inner.lock();
            let mut paired: Vec<StoredNode> = inner.paired.values().cloned().collect();
            paired.sort_by(|a, b| a.node.node_id.cmp(&b.node.node_id));
            serde_json::to_string_pretty(&StoreFile { paired })?
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    fn prune_expired(&self, inner: &mut Inner) {
        let ttl = chrono::Duration::from_std(self.request_ttl)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let now = Utc::now();
        inner.pending.retain(|_, entry| {
            let live = now.signed_duration_since(entry.request.requested_at) < ttl;
            if !live {
                let _ = entry.decision.send(Some(PairDecision::Expired));
            }
            live
        });
    }

    fn approve_locked(inner: &mut Inner, request_id: &str) -> Result<PairedNode, PairingError> {
        let entry = inner
            .pending
            .remove(request_id)
            .ok_or_else(|| PairingError::UnknownRequest(request_id.to_string()))?;
        let token = generate_token();
        let request = entry.request;

        let mut node = inner
            .paired
            .remove(&request.node.node_id)
            .map(|s| s.node)
            .unwrap_or_else(|| PairedNode {
                node_id: request.node.node_id.clone(),
                ..Default::default()
            });
        NodeMetadataPatch::from_identity(&request.node, request.remote_ip.as_deref())
            .apply(&mut node);
        node.paired_at = Some(Utc::now());

        inner.paired.insert(
            node.node_id.clone(),
            StoredNode {
                node: node.clone(),
                token_hash: hash_token(&token),
            },
        );
        let _ = entry.decision.send(Some(PairDecision::Approved { token }));
        tracing::info!(node_id = %node.node_id, request_id = %request_id, "node paired");
        Ok(node)
    }
}

#[async_trait]
impl PairingStore for FilePairingStore {
    async fn verify(&self, node_id: &str, token: &str) -> bool {
        let inner = self.inner.lock();
        match inner.paired.get(node_id) {
            Some(stored) => {
                let candidate = hash_token(token);
                candidate
                    .as_bytes()
                    .ct_eq(stored.token_hash.as_bytes())
                    .into()
            }
            None => false,
        }
    }

    async fn request_pairing(
        &self,
        node: &NodeIdentity,
        remote_ip: Option<&str>,
        silent: bool,
    ) -> Result<PairTicket, PairingError> {
        let (ticket, approved) = {
            let mut inner = self.inner.lock();
            self.prune_expired(&mut inner);

            let existing = inner
                .pending
                .values()
                .find(|e| e.request.node.node_id == node.node_id)
                .map(|e| (e.request.clone(), e.decision.subscribe()));

            match existing {
                Some((request, decision)) => {
                    tracing::debug!(
                        node_id = %node.node_id,
                        request_id = %request.request_id,
                        "joined pending pairing request"
                    );
                    (
                        PairTicket {
                            request,
                            decision,
                            ttl: self.request_ttl,
                        },
                        None,
                    )
                }
                None => {
                    let request = PairRequest {
                        request_id: uuid::Uuid::new_v4().to_string(),
                        node: node.clone(),
                        remote_ip: remote_ip.map(str::to_string),
                        silent,
                        requested_at: Utc::now(),
                    };
                    let (tx, rx) = watch::channel(None);
                    inner.pending.insert(
                        request.request_id.clone(),
                        PendingEntry {
                            request: request.clone(),
                            decision: tx,
                        },
                    );
                    tracing::info!(
                        node_id = %node.node_id,
                        request_id = %request.request_id,
                        "pairing requested"
                    );
                    let approved = if self.auto_approve {
                        Some(Self::approve_locked(&mut inner, &request.request_id)?)
                    } else {
                        None
                    };
                    (
                        PairTicket {
                            request,
                            decision: rx,
                            ttl: self.request_ttl,
                        },
                        approved,
                    )
                }
            }
        };
        if approved.is_some() {
            self.persist().await?;
        }
        Ok(ticket)
    }

    async fn approve(&self, request_id: &str) -> Result<PairedNode, PairingError> {
        let node = {
            let mut inner = self.inner.lock();
            self.prune_expired(&mut inner);
            Self::approve_locked(&mut inner, request_id)?
        };
        self.persist().await?;
        Ok(node)
    }

    async fn reject(&self, request_id: &str) -> Result<(), PairingError> {
        let mut inner = self.inner.lock();
        self.prune_expired(&mut inner);
        let entry = inner
            .pending
            .remove(request_id)
            .ok_or_else(|| PairingError::UnknownRequest(request_id.to_string()))?;
        let _ = entry.decision.send(Some(PairDecision::Rejected));
        tracing::info!(
            node_id = %entry.request.node.node_id,
            request_id = %request_id,
            "pairing rejected"
        );
        Ok(())
    }

    async fn list_paired(&self) -> Result<Vec<PairedNode>, PairingError> {
        let mut nodes: Vec<PairedNode> = self
            .inner
            .lock()
            .paired
            .values()
            .map(|s| s.node.clone())
            .collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(nodes)
    }

    async fn list_pending(&self) -> Vec<PairRequest> {
        let mut inner = self.inner.lock();
        self.prune_expired(&mut inner);
        let mut pending: Vec<PairRequest> =
            inner.pending.values().map(|e| e.request.clone()).collect();
        pending.sort_by_key(|r| r.requested_at);
        pending
    }

    async fn update_metadata(
        &self,
        node_id: &str,
        patch: NodeMetadataPatch,
    ) -> Result<(), PairingError> {
        let updated = {
            let mut inner = self.inner.lock();
            match inner.paired.get_mut(node_id) {
                Some(stored) => {
                    patch.apply(&mut stored.node);
                    true
                }
                None => false,
            }
        };
        if updated {
            self.persist().await
        } else {
            tracing::debug!(node_id = %node_id, "metadata update for unpaired node ignored");
            Ok(())
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn hash_token(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

fn generate_token() -> String {
    format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(id: &str) -> NodeIdentity {
        NodeIdentity {
            node_id: id.into(),
            display_name: Some("Studio Mac".into()),
            platform: Some("darwin".into()),
            commands: vec!["system.which".into()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn approve_issues_token_that_verifies() {
        let store = FilePairingStore::in_memory();
        let ticket = store
            .request_pairing(&identity("n1"), Some("10.0.0.2"), false)
            .await
            .unwrap();
        let request_id = ticket.request.request_id.clone();
        assert_eq!(store.list_pending().await.len(), 1);

        let node = store.approve(&request_id).await.unwrap();
        assert_eq!(node.display_name.as_deref(), Some("Studio Mac"));
        assert_eq!(node.remote_ip.as_deref(), Some("10.0.0.2"));

        let token = match ticket.decision().await {
            PairDecision::Approved { token } => token,
            other => panic!("expected approval, got {other:?}"),
        };
        assert!(store.verify("n1", &token).await);
        assert!(!store.verify("n1", "wrong").await);
        assert!(!store.verify("n2", &token).await);
        assert!(store.list_pending().await.is_empty());
    }

    #[tokio::test]
    async fn reject_resolves_waiters() {
        let store = FilePairingStore::in_memory();
        let ticket = store
            .request_pairing(&identity("n1"), None, false)
            .await
            .unwrap();
        store.reject(&ticket.request.request_id).await.unwrap();
        assert_eq!(ticket.decision().await, PairDecision::Rejected);
        assert!(store.list_paired().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn repeat_request_joins_existing() {
        let store = FilePairingStore::in_memory();
        let a = store.request_pairing(&identity("n1"), None, false).await.unwrap();
        let b = store.request_pairing(&identity("n1"), None, true).await.unwrap();
        assert_eq!(a.request.request_id, b.request.request_id);
        assert_eq!(store.list_pending().await.len(), 1);

        store.approve(&a.request.request_id).await.unwrap();
        assert!(matches!(a.decision().await, PairDecision::Approved { .. }));
        assert!(matches!(b.decision().await, PairDecision::Approved { .. }));
    }

    #[tokio::test]
    async fn auto_approve_resolves_immediately() {
        let store = FilePairingStore::in_memory().with_auto_approve(true);
        let ticket = store.request_pairing(&identity("n1"), None, true).await.unwrap();
        assert!(matches!(ticket.decision().await, PairDecision::Approved { .. }));
        assert_eq!(store.list_paired().await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn undecided_request_expires() {
        let store = FilePairingStore::in_memory().with_request_ttl(Duration::from_secs(5));
        let ticket = store.request_pairing(&identity("n1"), None, false).await.unwrap();
        assert_eq!(ticket.decision().await, PairDecision::Expired);
    }

    #[tokio::test]
    async fn unknown_request_is_an_error() {
        let store = FilePairingStore::in_memory();
        assert!(matches!(
            store.approve("nope").await,
            Err(PairingError::UnknownRequest(_))
        ));
    }

    #[tokio::test]
    async fn metadata_and_tokens_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let config = PairingConfig {
            store_path: Some(dir.path().join("nested/paired.json")),
            ..Default::default()
        };

        let token = {
            let store = FilePairingStore::open(&config).unwrap();
            let token = store
                .insert_paired(PairedNode {
                    node_id: "n1".into(),
                    platform: Some("darwin".into()),
                    ..Default::default()
                })
                .await
                .unwrap();
            store
                .update_metadata("n1", NodeMetadataPatch::bins(vec!["git".into(), "jq".into()]))
                .await
                .unwrap();
            store
                .update_metadata("ghost", NodeMetadataPatch::bins(vec!["x".into()]))
                .await
                .unwrap();
            token
        };

        let reopened = FilePairingStore::open(&config).unwrap();
        let paired = reopened.list_paired().await.unwrap();
        assert_eq!(paired.len(), 1);
        assert_eq!(paired[0].bins, vec!["git".to_string(), "jq".to_string()]);
        assert_eq!(paired[0].platform.as_deref(), Some("darwin"));
        assert!(reopened.verify("n1", &token).await);

        let raw = std::fs::read_to_string(dir.path().join("nested/paired.json")).unwrap();
        assert!(!raw.contains(&token), "plaintext token must not be persisted");
    }
}
