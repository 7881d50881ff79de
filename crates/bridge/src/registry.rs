//! In-memory registry of authenticated node sessions.
//!
//! At most one live session exists per `node_id`.  Registering a second
//! session for the same node closes the first before the new one becomes
//! visible to readers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use nb_protocol::{BridgeFrame, NodeIdentity};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::BridgeError;
use crate::invoke::InvokeResult;

/// Outbound frame queue of one node connection.
pub type NodeSink = mpsc::Sender<BridgeFrame>;

pub(crate) type PendingSlot = oneshot::Sender<Result<InvokeResult, BridgeError>>;

/// What the gateway knows about an authenticated node.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSession {
    pub node_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub core_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ui_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_family: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_identifier: Option<String>,
    pub commands: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_ip: Option<String>,
    pub authenticated_at: DateTime<Utc>,
}

impl NodeSession {
    pub fn from_identity(node: NodeIdentity, remote_ip: Option<String>) -> Self {
        Self {
            node_id: node.node_id,
            display_name: node.display_name,
            platform: node.platform,
            version: node.version,
            core_version: node.core_version,
            ui_version: node.ui_version,
            device_family: node.device_family,
            model_identifier: node.model_identifier,
            commands: node.commands,
            remote_ip,
            authenticated_at: Utc::now(),
        }
    }

    pub fn declares(&self, command: &str) -> bool {
        self.commands.iter().any(|c| c == command)
    }
}

/// Summary returned by list endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedNode {
    #[serde(flatten)]
    pub session: NodeSession,
    pub conn_id: u64,
    pub last_seen: DateTime<Utc>,
    pub pending_invokes: usize,
}

/// A live, authenticated connection.
///
/// Owned by the connection task; the registry and invokers hold `Arc`s.
pub struct SessionHandle {
    pub info: NodeSession,
    pub(crate) conn_id: u64,
    pub(crate) sink: NodeSink,
    pub(crate) pending: Mutex<HashMap<String, PendingSlot>>,
    /// Largest encoded frame the writer will put on the wire.
    pub(crate) max_frame_bytes: usize,
    last_seen: Mutex<DateTime<Utc>>,
    closed: AtomicBool,
    /// Cancelled when the session closes for any reason.
    cancel: CancellationToken,
    /// Cancelled once `on_disconnected` has returned for this session.
    lifecycle_done: CancellationToken,
}

impl SessionHandle {
    pub fn new(info: NodeSession, conn_id: u64, sink: NodeSink) -> Self {
        Self {
            info,
            conn_id,
            sink,
            pending: Mutex::new(HashMap::new()),
            max_frame_bytes: nb_protocol::MAX_FRAME_BYTES,
            last_seen: Mutex::new(Utc::now()),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            lifecycle_done: CancellationToken::new(),
        }
    }

    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }

    pub fn node_id(&self) -> &str {
        &self.info.node_id
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn touch(&self) {
        *self.last_seen.lock() = Utc::now();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Close the session: stop its connection and resolve every pending
    /// invocation with `ConnectionClosed`.  Only the first call has effect.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.cancel.cancel();
        let failed = self.fail_pending(BridgeError::ConnectionClosed);
        if failed > 0 {
            tracing::warn!(
                node_id = %self.info.node_id,
                failed_requests = failed,
                "failed in-flight invokes for closed session"
            );
        }
        true
    }

    fn fail_pending(&self, err: BridgeError) -> usize {
        let drained: Vec<PendingSlot> = self.pending.lock().drain().map(|(_, tx)| tx).collect();
        let count = drained.len();
        for tx in drained {
            let _ = tx.send(Err(err.clone()));
        }
        count
    }

    pub(crate) fn mark_lifecycle_done(&self) {
        self.lifecycle_done.cancel();
    }

    /// Resolves once this session's `on_disconnected` callback has returned.
    pub async fn lifecycle_finished(&self) {
        self.lifecycle_done.cancelled().await
    }

    pub fn summary(&self) -> ConnectedNode {
        ConnectedNode {
            session: self.info.clone(),
            conn_id: self.conn_id,
            last_seen: *self.last_seen.lock(),
            pending_invokes: self.pending.lock().len(),
        }
    }
}

/// Thread-safe registry of connected node sessions.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Register a session.  A prior session for the same `node_id` is closed
    /// and returned so the caller can wait for its teardown.
    pub fn register(&self, session: Arc<SessionHandle>) -> Option<Arc<SessionHandle>> {
        let id = session.info.node_id.clone();
        let mut sessions = self.sessions.write();
        let previous = sessions.remove(&id);
        if let Some(prev) = &previous {
            prev.close();
            tracing::info!(
                node_id = %id,
                old_conn = prev.conn_id,
                new_conn = session.conn_id,
                "session superseded"
            );
        }
        tracing::info!(
            node_id = %id,
            conn_id = session.conn_id,
            commands = session.info.commands.len(),
            "node registered"
        );
        sessions.insert(id, session);
        previous
    }

    /// Remove the session for `node_id` only if it is still `conn_id`.
    pub fn remove_if_current(&self, node_id: &str, conn_id: u64) -> bool {
        let mut sessions = self.sessions.write();
        let current = sessions
            .get(node_id)
            .map(|s| s.conn_id == conn_id)
            .unwrap_or(false);
        if current {
            sessions.remove(node_id);
            tracing::info!(node_id = %node_id, conn_id, "node removed");
        }
        current
    }

    pub fn get(&self, node_id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.read().get(node_id).cloned()
    }

    pub fn list(&self) -> Vec<NodeSession> {
        self.sessions.read().values().map(|s| s.info.clone()).collect()
    }

    pub fn summaries(&self) -> Vec<ConnectedNode> {
        self.sessions.read().values().map(|s| s.summary()).collect()
    }

    pub fn is_connected(&self, node_id: &str) -> bool {
        self.sessions.read().contains_key(node_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Close every session (shutdown).
    pub fn close_all(&self) {
        let sessions: Vec<_> = self.sessions.write().drain().map(|(_, s)| s).collect();
        for s in sessions {
            s.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(node_id: &str, conn_id: u64) -> (Arc<SessionHandle>, mpsc::Receiver<BridgeFrame>) {
        let (tx, rx) = mpsc::channel(8);
        let info = NodeSession::from_identity(
            NodeIdentity {
                node_id: node_id.into(),
                commands: vec!["system.run".into()],
                ..Default::default()
            },
            None,
        );
        (Arc::new(SessionHandle::new(info, conn_id, tx)), rx)
    }

    #[test]
    fn register_supersedes_and_closes_previous() {
        let reg = SessionRegistry::new();
        let (first, _rx1) = session("n1", 1);
        let (second, _rx2) = session("n1", 2);

        assert!(reg.register(first.clone()).is_none());
        let prev = reg.register(second).expect("previous session returned");
        assert_eq!(prev.conn_id(), 1);
        assert!(first.is_closed());
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get("n1").unwrap().conn_id(), 2);
    }

    #[test]
    fn stale_connection_cannot_remove_successor() {
        let reg = SessionRegistry::new();
        let (first, _rx1) = session("n1", 1);
        let (second, _rx2) = session("n1", 2);
        reg.register(first);
        reg.register(second);

        assert!(!reg.remove_if_current("n1", 1));
        assert!(reg.is_connected("n1"));
        assert!(reg.remove_if_current("n1", 2));
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn close_fails_pending_once() {
        let (s, _rx) = session("n1", 1);
        let (tx, rx) = oneshot::channel();
        s.pending.lock().insert("r1".into(), tx);

        assert!(s.close());
        assert!(!s.close());
        assert_eq!(rx.await.unwrap(), Err(BridgeError::ConnectionClosed));
        assert!(s.cancel_token().is_cancelled());
    }

    #[test]
    fn summary_serializes_camel_case() {
        let (s, _rx) = session("n1", 7);
        let v = serde_json::to_value(s.summary()).unwrap();
        assert_eq!(v["nodeId"], "n1");
        assert_eq!(v["connId"], 7);
        assert_eq!(v["pendingInvokes"], 0);
    }
}
