//! Bridge listener, callback surface and the cloneable bridge handle.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nb_domain::config::BridgeConfig;
use nb_protocol::{codes, ErrorShape};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::capability::NodeInvoker;
use crate::connection;
use crate::error::{BridgeError, StartError};
use crate::invoke::{InvokeRequest, InvokeResult};
use crate::pairing::{PairRequest, PairingStore};
use crate::registry::{NodeSession, SessionRegistry};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Callbacks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A node-initiated `req` frame.
#[derive(Debug, Clone)]
pub struct NodeRequest {
    pub id: String,
    pub method: String,
    pub params_json: Option<String>,
}

/// Answer to a [`NodeRequest`], sent back as `res`.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeResponse {
    pub ok: bool,
    pub payload_json: Option<String>,
    pub error: Option<ErrorShape>,
}

impl NodeResponse {
    pub fn ok(payload: &serde_json::Value) -> Self {
        Self {
            ok: true,
            payload_json: Some(payload.to_string()),
            error: None,
        }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            payload_json: None,
            error: Some(ErrorShape::new(code, message)),
        }
    }
}

/// A node-initiated one-way `event` frame.
#[derive(Debug, Clone)]
pub struct NodeEvent {
    pub event: String,
    pub payload_json: Option<String>,
}

/// Callbacks registered once at server start.
///
/// `on_authenticated` and `on_disconnected` run serially per connection and
/// each fires exactly once for every session that was established.
#[async_trait]
pub trait BridgeHandler: Send + Sync + 'static {
    async fn on_request(&self, node_id: &str, request: NodeRequest) -> NodeResponse {
        let _ = node_id;
        NodeResponse::error(
            codes::INVALID_REQUEST,
            format!("unknown method: {}", request.method),
        )
    }

    async fn on_authenticated(&self, _node: &NodeSession) {}

    async fn on_disconnected(&self, _node: &NodeSession) {}

    async fn on_event(&self, _node_id: &str, _event: NodeEvent) {}

    async fn on_pair_requested(&self, _request: &PairRequest) {}
}

/// Handler that accepts every default.
pub struct NoopHandler;

impl BridgeHandler for NoopHandler {}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Byte stream a session runs over.
pub trait BridgeStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> BridgeStream for T {}

/// Wraps accepted TCP connections in an encrypted stream.  The bridge never
/// terminates TLS itself; the embedding process installs one of these.
#[async_trait]
pub trait TransportUpgrade: Send + Sync {
    fn scheme(&self) -> &'static str {
        "tls"
    }

    async fn upgrade(&self, stream: TcpStream) -> std::io::Result<Box<dyn BridgeStream>>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Cloneable access to the connected sessions: invoke, push events, list.
#[derive(Clone)]
pub struct BridgeHandle {
    registry: Arc<SessionRegistry>,
    default_timeout: Duration,
}

impl BridgeHandle {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new()),
            default_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Invoke a command on a node.  Fails immediately when the node has no
    /// live session.
    pub async fn invoke(&self, request: InvokeRequest) -> Result<InvokeResult, BridgeError> {
        let session = self
            .registry
            .get(&request.node_id)
            .ok_or(BridgeError::NotConnected)?;
        let timeout = request
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);
        session
            .invoke(&request.command, request.params_json, timeout)
            .await
    }

    /// Fire-and-forget event to one node.  Silently dropped when the node
    /// is not connected.
    pub fn send_event(&self, node_id: &str, event: &str, payload_json: Option<String>) -> bool {
        match self.registry.get(node_id) {
            Some(session) => session.send_event(event, payload_json),
            None => {
                tracing::debug!(node_id = %node_id, event = %event, "event for disconnected node dropped");
                false
            }
        }
    }

    pub fn list_connected(&self) -> Vec<NodeSession> {
        self.registry.list()
    }
}

#[async_trait]
impl NodeInvoker for BridgeHandle {
    async fn invoke(&self, request: InvokeRequest) -> Result<InvokeResult, BridgeError> {
        BridgeHandle::invoke(self, request).await
    }

    fn list_connected(&self) -> Vec<NodeSession> {
        BridgeHandle::list_connected(self)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct BridgeServerOptions {
    pub host: String,
    pub port: u16,
    /// Advertised to nodes in `hello-ok`.
    pub server_name: String,
    pub handshake_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_frame_bytes: usize,
    pub outbound_buffer: usize,
}

impl BridgeServerOptions {
    pub fn from_config(config: &BridgeConfig, host: String, server_name: String) -> Self {
        Self {
            host,
            port: config.port,
            server_name,
            handshake_timeout: Duration::from_millis(config.handshake_timeout_ms),
            idle_timeout: Duration::from_millis(config.idle_timeout_ms),
            max_frame_bytes: config.max_frame_bytes,
            outbound_buffer: config.outbound_buffer.max(1),
        }
    }

    /// Loopback on an ephemeral port, for tests.
    pub fn local(server_name: &str) -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            server_name: server_name.into(),
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(90),
            max_frame_bytes: nb_protocol::MAX_FRAME_BYTES,
            outbound_buffer: 64,
        }
    }
}

pub(crate) struct Shared {
    pub(crate) handle: BridgeHandle,
    pub(crate) pairing: Arc<dyn PairingStore>,
    pub(crate) handler: Arc<dyn BridgeHandler>,
    pub(crate) options: BridgeServerOptions,
    next_conn: AtomicU64,
}

impl Shared {
    pub(crate) fn next_conn_id(&self) -> u64 {
        self.next_conn.fetch_add(1, Ordering::Relaxed)
    }
}

/// A running bridge listener.
pub struct BridgeServer {
    handle: BridgeHandle,
    local_addr: SocketAddr,
    scheme: &'static str,
    shutdown: CancellationToken,
    accept_task: JoinHandle<()>,
}

impl BridgeServer {
    /// Bind and start accepting node connections.
    pub async fn start(
        handle: BridgeHandle,
        options: BridgeServerOptions,
        pairing: Arc<dyn PairingStore>,
        handler: Arc<dyn BridgeHandler>,
        upgrade: Option<Arc<dyn TransportUpgrade>>,
    ) -> Result<Self, StartError> {
        let addr = format!("{}:{}", options.host, options.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| StartError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| StartError::Bind {
            addr: addr.clone(),
            source,
        })?;
        let scheme = upgrade.as_ref().map(|u| u.scheme()).unwrap_or("tcp");

        let shared = Arc::new(Shared {
            handle: handle.clone(),
            pairing,
            handler,
            options,
            next_conn: AtomicU64::new(1),
        });
        let shutdown = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(listener, shared, upgrade, shutdown.clone()));

        Ok(Self {
            handle,
            local_addr,
            scheme,
            shutdown,
            accept_task,
        })
    }

    pub fn handle(&self) -> &BridgeHandle {
        &self.handle
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// `tcp` or the installed transport's scheme.
    pub fn scheme(&self) -> &'static str {
        self.scheme
    }

    /// Stop accepting and close every session.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.handle.registry().close_all();
        let _ = self.accept_task.await;
        tracing::info!(addr = %self.local_addr, "bridge stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    upgrade: Option<Arc<dyn TransportUpgrade>>,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (tcp, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "bridge accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let _ = tcp.set_nodelay(true);
        let shared = shared.clone();
        let upgrade = upgrade.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let stream: Box<dyn BridgeStream> = match upgrade {
                Some(upgrade) => match upgrade.upgrade(tcp).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        tracing::warn!(peer = %peer, error = %e, "transport upgrade failed");
                        return;
                    }
                },
                None => Box::new(tcp),
            };
            connection::run(shared, stream, peer, shutdown).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn invoke_without_session_fails_fast() {
        let handle = BridgeHandle::new(Duration::from_secs(30));
        let started = std::time::Instant::now();
        let res = handle
            .invoke(InvokeRequest::new("ghost", "system.run"))
            .await;
        assert_eq!(res, Err(BridgeError::NotConnected));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!handle.send_event("ghost", "voicewake.changed", None));
    }

    #[tokio::test]
    async fn default_handler_rejects_requests() {
        let res = NoopHandler
            .on_request(
                "n1",
                NodeRequest {
                    id: "1".into(),
                    method: "teleport".into(),
                    params_json: None,
                },
            )
            .await;
        assert!(!res.ok);
        assert_eq!(res.error.unwrap().code, codes::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn bind_conflict_is_reported() {
        let blocker = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut options = BridgeServerOptions::local("test");
        options.port = blocker.local_addr().unwrap().port();
        let err = BridgeServer::start(
            BridgeHandle::new(Duration::from_secs(1)),
            options,
            Arc::new(crate::pairing::FilePairingStore::in_memory()),
            Arc::new(NoopHandler),
            None,
        )
        .await
        .err()
        .expect("second bind must fail");
        assert!(matches!(err, StartError::Bind { .. }));
    }
}
