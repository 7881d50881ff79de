//! Core node client: manages the connection lifecycle, heartbeat, and
//! command dispatch via [`CommandRegistry`].

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{FutureExt, SinkExt, StreamExt};
use nb_protocol::{codes, BridgeFrame, Decoded, ErrorShape, FrameCodec, NodeIdentity};
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::reconnect::ReconnectBackoff;
use crate::registry::CommandRegistry;
use crate::types::{CommandContext, CommandError, GatewayEvent, NodeSdkError};

type NodeFramed = Framed<TcpStream, FrameCodec>;

/// A fully-configured node client ready to connect to the gateway.
///
/// Create via [`NodeClientBuilder`](crate::builder::NodeClientBuilder).
pub struct NodeClient {
    pub(crate) gateway_addr: String,
    pub(crate) identity: NodeIdentity,
    pub(crate) token: Arc<RwLock<Option<String>>>,
    pub(crate) silent_pairing: bool,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) handshake_timeout: Duration,
    pub(crate) reconnect_backoff: ReconnectBackoff,
    pub(crate) max_concurrent_commands: usize,
    pub(crate) max_frame_bytes: usize,
    pub(crate) events: Option<mpsc::Sender<GatewayEvent>>,
    pub(crate) jitter_seed: u64,
}

impl NodeClient {
    pub fn builder() -> crate::builder::NodeClientBuilder {
        crate::builder::NodeClientBuilder::new()
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// The current auth token: the configured one, or the one issued by
    /// the last successful pairing.  Persist it to skip pairing next time.
    pub fn token(&self) -> Option<String> {
        self.token.read().clone()
    }

    /// Connect, authenticate (pairing first when there is no token) and
    /// serve invocations.  Reconnects according to the
    /// [`ReconnectBackoff`] policy.
    ///
    /// Returns on shutdown, a rejected pairing, or back-off exhaustion.
    pub async fn run(
        &self,
        registry: CommandRegistry,
        shutdown: CancellationToken,
    ) -> Result<(), NodeSdkError> {
        let registry = Arc::new(registry);
        let mut attempt: u32 = 0;

        loop {
            if shutdown.is_cancelled() {
                return Err(NodeSdkError::Shutdown);
            }

            let result = tokio::select! {
                r = self.connect_and_run(&registry, &shutdown) => r,
                _ = shutdown.cancelled() => {
                    tracing::info!(node_id = %self.identity.node_id, "shutdown requested");
                    return Err(NodeSdkError::Shutdown);
                }
            };

            match result {
                Ok(()) => {
                    tracing::info!(node_id = %self.identity.node_id, "connection closed");
                    // Only an established session resets the back-off.
                    attempt = 0;
                }
                Err(NodeSdkError::PairingRejected(reason)) => {
                    tracing::error!(node_id = %self.identity.node_id, reason = %reason, "pairing rejected");
                    return Err(NodeSdkError::PairingRejected(reason));
                }
                Err(e) => {
                    tracing::warn!(
                        node_id = %self.identity.node_id,
                        attempt,
                        error = %e,
                        "connection lost"
                    );
                }
            }

            if self.reconnect_backoff.should_give_up(attempt) {
                tracing::error!(
                    node_id = %self.identity.node_id,
                    attempts = attempt,
                    "max reconnect attempts exhausted"
                );
                return Err(NodeSdkError::ReconnectExhausted(attempt));
            }

            let delay = self
                .reconnect_backoff
                .delay_for_attempt(attempt, self.jitter_seed);
            tracing::info!(
                node_id = %self.identity.node_id,
                delay_ms = delay.as_millis() as u64,
                attempt = attempt + 1,
                "reconnecting"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => return Err(NodeSdkError::Shutdown),
            }

            attempt += 1;
        }
    }

    /// Same as [`run`](Self::run) on a spawned task.
    pub fn spawn(
        self: Arc<Self>,
        registry: CommandRegistry,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<Result<(), NodeSdkError>> {
        tokio::spawn(async move { self.run(registry, shutdown).await })
    }

    /// One connection: connect → handshake → frame loop.  `Ok` means an
    /// established session ended.
    async fn connect_and_run(
        &self,
        registry: &Arc<CommandRegistry>,
        shutdown: &CancellationToken,
    ) -> Result<(), NodeSdkError> {
        tracing::info!(addr = %self.gateway_addr, node_id = %self.identity.node_id, "connecting to gateway");
        let tcp = TcpStream::connect(&self.gateway_addr).await?;
        let _ = tcp.set_nodelay(true);
        let mut framed = Framed::new(tcp, FrameCodec::new(self.max_frame_bytes));

        let server_name = self.handshake(&mut framed, registry).await?;
        tracing::info!(
            node_id = %self.identity.node_id,
            server = %server_name,
            commands = registry.len(),
            "connected to gateway"
        );

        self.serve(framed, registry, shutdown).await;
        Ok(())
    }

    // ── Handshake ────────────────────────────────────────────────────

    async fn handshake(
        &self,
        framed: &mut NodeFramed,
        registry: &CommandRegistry,
    ) -> Result<String, NodeSdkError> {
        let mut node = self.identity.clone();
        node.commands = registry.command_names();

        let token = self.token();
        let pairing = token.is_none();
        let first = match token {
            Some(token) => BridgeFrame::Hello { node, token },
            None => BridgeFrame::PairRequest {
                node,
                silent: self.silent_pairing,
            },
        };
        framed.send(first).await?;
        if pairing {
            tracing::info!(node_id = %self.identity.node_id, "pairing requested; waiting for approval");
        }

        // Operator approval is unbounded; everything else is not.
        let mut deadline = (!pairing).then(|| tokio::time::Instant::now() + self.handshake_timeout);

        loop {
            let next = match deadline {
                Some(at) => tokio::time::timeout_at(at, framed.next())
                    .await
                    .map_err(|_| NodeSdkError::Handshake("hello-ok timeout".into()))?,
                None => framed.next().await,
            };
            let frame = match next {
                Some(Ok(Decoded::Frame(frame))) => frame,
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => {
                    return Err(NodeSdkError::Handshake(
                        "connection closed during handshake".into(),
                    ))
                }
            };

            match frame {
                BridgeFrame::PairResult {
                    ok: true,
                    token: Some(token),
                    ..
                } => {
                    tracing::info!(node_id = %self.identity.node_id, "pairing approved");
                    *self.token.write() = Some(token);
                    deadline = Some(tokio::time::Instant::now() + self.handshake_timeout);
                }
                BridgeFrame::PairResult { error, .. } => {
                    let reason = error
                        .map(|e| e.message)
                        .unwrap_or_else(|| "pairing failed".into());
                    return Err(NodeSdkError::PairingRejected(reason));
                }
                BridgeFrame::HelloOk { server_name, .. } => return Ok(server_name),
                BridgeFrame::Error { code, message } => {
                    if code == codes::UNAUTHORIZED {
                        // Token revoked or unknown: pair again next time.
                        tracing::warn!(node_id = %self.identity.node_id, "token rejected; clearing it");
                        *self.token.write() = None;
                    }
                    return Err(NodeSdkError::Handshake(format!("{code}: {message}")));
                }
                other => {
                    tracing::debug!(kind = other.kind(), "ignoring frame during handshake");
                }
            }
        }
    }

    // ── Session ──────────────────────────────────────────────────────

    async fn serve(
        &self,
        framed: NodeFramed,
        registry: &Arc<CommandRegistry>,
        shutdown: &CancellationToken,
    ) {
        let (mut sink, mut stream) = framed.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<BridgeFrame>(64);
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_commands));
        let inflight = CancellationToken::new();

        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let kind = frame.kind();
                match sink.send(frame).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                        tracing::warn!(kind, error = %e, "outbound frame dropped");
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "write to gateway failed");
                        break;
                    }
                }
            }
        });

        let ping_tx = outbound_tx.clone();
        let heartbeat = self.heartbeat_interval;
        let pinger = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);
            loop {
                interval.tick().await;
                let ping = BridgeFrame::Ping {
                    ts: Utc::now().timestamp_millis(),
                };
                if ping_tx.send(ping).await.is_err() {
                    break;
                }
            }
        });

        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = stream.next() => next,
            };
            let frame = match next {
                Some(Ok(Decoded::Frame(frame))) => frame,
                Some(Ok(Decoded::Malformed(e))) => {
                    tracing::warn!(error = %e, "ignoring malformed frame");
                    continue;
                }
                Some(Ok(Decoded::Oversized)) => {
                    tracing::warn!(max_bytes = self.max_frame_bytes, "ignoring oversized frame");
                    continue;
                }
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "read from gateway failed");
                    break;
                }
                None => break,
            };

            match frame {
                BridgeFrame::Invoke {
                    id,
                    command,
                    params_json,
                    timeout_ms,
                } => {
                    tracing::debug!(request_id = %id, command = %command, "invoke received");
                    let ctx = CommandContext {
                        request_id: id,
                        command,
                        timeout: timeout_ms.map(Duration::from_millis),
                        cancel: inflight.child_token(),
                    };
                    let registry = registry.clone();
                    let tx = outbound_tx.clone();
                    let semaphore = semaphore.clone();
                    let max_frame_bytes = self.max_frame_bytes;
                    tokio::spawn(async move {
                        let _permit = semaphore.acquire().await;
                        let frame = dispatch(&registry, ctx, params_json, max_frame_bytes).await;
                        let _ = tx.send(frame).await;
                    });
                }
                BridgeFrame::Event {
                    event,
                    payload_json,
                } => self.deliver_event(event, payload_json),
                BridgeFrame::Ping { ts } => {
                    let _ = outbound_tx.send(BridgeFrame::Pong { ts }).await;
                }
                BridgeFrame::Pong { .. } => tracing::trace!("pong received"),
                BridgeFrame::Error { code, message } => {
                    tracing::warn!(code = %code, message = %message, "gateway reported an error");
                    break;
                }
                other => {
                    tracing::debug!(kind = other.kind(), "ignoring frame");
                }
            }
        }

        inflight.cancel();
        pinger.abort();
        drop(outbound_tx);
        writer.abort();
    }

    fn deliver_event(&self, event: String, payload_json: Option<String>) {
        let Some(tx) = &self.events else {
            tracing::debug!(event = %event, "gateway event ignored");
            return;
        };
        let payload = payload_json
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or(serde_json::Value::Null);
        if tx.try_send(GatewayEvent { event, payload }).is_err() {
            tracing::warn!("gateway event dropped: receiver full or gone");
        }
    }
}

/// Run one invocation and build its `invoke-res`.  Always produces a frame,
/// even when the handler panics.
async fn dispatch(
    registry: &CommandRegistry,
    ctx: CommandContext,
    params_json: Option<String>,
    max_frame_bytes: usize,
) -> BridgeFrame {
    let id = ctx.request_id.clone();
    let command = ctx.command.clone();
    let failed = |error: ErrorShape| BridgeFrame::InvokeRes {
        id: id.clone(),
        ok: false,
        payload_json: None,
        error: Some(error),
    };

    let Some(handler) = registry.get(&command) else {
        tracing::warn!(command = %command, "no handler registered for command");
        return failed(ErrorShape::new(codes::INVALID_REQUEST, "unknown command"));
    };

    let params = match params_json.as_deref() {
        None => serde_json::Value::Null,
        Some(raw) => match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                return failed(CommandError::InvalidParams(format!("paramsJSON: {e}")).to_shape())
            }
        },
    };

    match AssertUnwindSafe(handler.call(ctx, params)).catch_unwind().await {
        Ok(Ok(value)) => {
            let frame = BridgeFrame::InvokeRes {
                id: id.clone(),
                ok: true,
                payload_json: Some(value.to_string()),
                error: None,
            };
            // Measured after escaping: `payloadJSON` travels as a string.
            match frame.encoded_len() {
                Ok(size) if size <= max_frame_bytes => frame,
                Ok(size) => {
                    tracing::warn!(command = %command, bytes = size, "result too large");
                    failed(
                        CommandError::Failed(format!(
                            "result frame is {size} bytes (max {max_frame_bytes})"
                        ))
                        .to_shape(),
                    )
                }
                Err(e) => failed(CommandError::Failed(format!("encoding result: {e}")).to_shape()),
            }
        }
        Ok(Err(e)) => failed(e.to_shape()),
        Err(_panic) => {
            tracing::error!(command = %command, request_id = %id, "command handler panicked");
            failed(CommandError::Failed("command handler panicked".into()).to_shape())
        }
    }
}
