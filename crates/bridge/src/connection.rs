//! One node connection: handshake, then the read loop, writer task and
//! lifecycle actor of the session.
//!
//! Flow:
//! 1. Node sends `hello {node, token}` (or `pair-request {node}` and waits
//!    for the operator's decision, answered with `pair-result`).
//! 2. Gateway answers `hello-ok` and registers the session, superseding any
//!    previous session of the same node.
//! 3. Frames flow both ways until EOF, idle timeout, supersession or
//!    shutdown.  Teardown fails every pending invoke of the session.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use nb_protocol::{codes, BridgeFrame, Decoded, ErrorShape, FrameCodec, NodeIdentity, PROTOCOL_VERSION};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::invoke::InvokeResult;
use crate::pairing::{NodeMetadataPatch, PairDecision};
use crate::registry::{NodeSession, SessionHandle};
use crate::server::{BridgeStream, NodeEvent, NodeRequest, Shared};

type FrameSink = SplitSink<Framed<Box<dyn BridgeStream>, FrameCodec>, BridgeFrame>;
type FrameStream = SplitStream<Framed<Box<dyn BridgeStream>, FrameCodec>>;

/// Queue depth of node events awaiting `on_event`.
const EVENT_QUEUE: usize = 64;

pub(crate) async fn run(
    shared: Arc<Shared>,
    stream: Box<dyn BridgeStream>,
    peer: SocketAddr,
    shutdown: CancellationToken,
) {
    let conn_id = shared.next_conn_id();
    let remote_ip = peer.ip().to_string();
    let framed = Framed::new(stream, FrameCodec::new(shared.options.max_frame_bytes));
    let (mut sink, mut stream) = framed.split();

    tracing::debug!(conn_id, peer = %peer, "bridge connection accepted");

    let node = match handshake(&shared, &mut sink, &mut stream, &remote_ip, conn_id).await {
        Some(node) => node,
        None => {
            let _ = sink.close().await;
            return;
        }
    };

    if let Err(e) = shared
        .pairing
        .update_metadata(
            &node.node_id,
            NodeMetadataPatch::from_identity(&node, Some(&remote_ip)),
        )
        .await
    {
        tracing::warn!(node_id = %node.node_id, error = %e, "failed to record node metadata");
    }

    let hello_ok = BridgeFrame::HelloOk {
        server_name: shared.options.server_name.clone(),
        protocol: PROTOCOL_VERSION,
    };
    if let Err(e) = sink.send(hello_ok).await {
        tracing::warn!(node_id = %node.node_id, error = %e, "failed to send hello-ok");
        return;
    }

    run_session(shared, sink, stream, node, remote_ip, conn_id, shutdown).await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handshake
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Returns the authenticated identity, or `None` after telling the node
/// why it was refused.
async fn handshake(
    shared: &Shared,
    sink: &mut FrameSink,
    stream: &mut FrameStream,
    remote_ip: &str,
    conn_id: u64,
) -> Option<NodeIdentity> {
    let first = tokio::time::timeout(shared.options.handshake_timeout, next_frame(stream)).await;
    let frame = match first {
        Ok(Some(frame)) => frame,
        Ok(None) => {
            tracing::debug!(conn_id, "connection closed before handshake");
            return None;
        }
        Err(_) => {
            tracing::warn!(conn_id, remote_ip = %remote_ip, "handshake timed out");
            return None;
        }
    };

    match frame {
        BridgeFrame::Hello { node, token } => {
            if node.node_id.trim().is_empty() {
                reject(sink, codes::INVALID_REQUEST, "nodeId required").await;
                return None;
            }
            if !shared.pairing.verify(&node.node_id, &token).await {
                tracing::warn!(
                    node_id = %node.node_id,
                    remote_ip = %remote_ip,
                    "node authentication failed"
                );
                reject(sink, codes::UNAUTHORIZED, "node not paired or token invalid").await;
                return None;
            }
            Some(node)
        }
        BridgeFrame::PairRequest { node, silent } => {
            if node.node_id.trim().is_empty() {
                reject(sink, codes::INVALID_REQUEST, "nodeId required").await;
                return None;
            }
            pair(shared, sink, stream, node, remote_ip, silent).await
        }
        other => {
            tracing::debug!(conn_id, kind = other.kind(), "unexpected frame before handshake");
            reject(sink, codes::INVALID_REQUEST, "expected hello or pair-request").await;
            None
        }
    }
}

async fn pair(
    shared: &Shared,
    sink: &mut FrameSink,
    stream: &mut FrameStream,
    node: NodeIdentity,
    remote_ip: &str,
    silent: bool,
) -> Option<NodeIdentity> {
    let ticket = match shared
        .pairing
        .request_pairing(&node, Some(remote_ip), silent)
        .await
    {
        Ok(ticket) => ticket,
        Err(e) => {
            tracing::warn!(node_id = %node.node_id, error = %e, "pairing request failed");
            reject(sink, codes::INTERNAL, "pairing unavailable").await;
            return None;
        }
    };
    shared.handler.on_pair_requested(&ticket.request).await;

    // Keep draining the socket so a node that gives up is noticed.
    let decision = tokio::select! {
        decision = ticket.decision() => decision,
        _ = drain_until_closed(stream) => {
            tracing::debug!(node_id = %node.node_id, "node left while pairing was pending");
            return None;
        }
    };

    let refusal = match decision {
        PairDecision::Approved { token } => {
            let result = BridgeFrame::PairResult {
                ok: true,
                token: Some(token),
                error: None,
            };
            if sink.send(result).await.is_err() {
                return None;
            }
            return Some(node);
        }
        PairDecision::Rejected => "pairing rejected",
        PairDecision::Expired => "pairing request expired",
    };
    tracing::info!(node_id = %node.node_id, reason = refusal, "pairing refused");
    let _ = sink
        .send(BridgeFrame::PairResult {
            ok: false,
            token: None,
            error: Some(ErrorShape::new(codes::PAIRING_REJECTED, refusal)),
        })
        .await;
    None
}

async fn reject(sink: &mut FrameSink, code: &str, message: &str) {
    let _ = sink
        .send(BridgeFrame::Error {
            code: code.to_string(),
            message: message.to_string(),
        })
        .await;
}

/// Next well-formed frame; malformed and oversized lines are skipped.
async fn next_frame(stream: &mut FrameStream) -> Option<BridgeFrame> {
    while let Some(item) = stream.next().await {
        match item {
            Ok(Decoded::Frame(frame)) => return Some(frame),
            Ok(Decoded::Malformed(e)) => tracing::debug!(error = %e, "skipping malformed frame"),
            Ok(Decoded::Oversized) => tracing::debug!("skipping oversized frame"),
            Err(e) => {
                tracing::debug!(error = %e, "bridge read failed");
                return None;
            }
        }
    }
    None
}

async fn drain_until_closed(stream: &mut FrameStream) {
    while let Some(Ok(_)) = stream.next().await {}
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn run_session(
    shared: Arc<Shared>,
    mut sink: FrameSink,
    mut stream: FrameStream,
    node: NodeIdentity,
    remote_ip: String,
    conn_id: u64,
    shutdown: CancellationToken,
) {
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<BridgeFrame>(shared.options.outbound_buffer);
    let info = NodeSession::from_identity(node, Some(remote_ip));
    let node_id = info.node_id.clone();
    let session = Arc::new(
        SessionHandle::new(info, conn_id, outbound_tx)
            .with_max_frame_bytes(shared.options.max_frame_bytes),
    );
    let cancel = session.cancel_token();

    // Writer task: forwards queued frames to the socket.
    let writer = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = outbound_rx.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };
                let kind = frame.kind();
                match sink.send(frame).await {
                    Ok(()) => {}
                    // Encoding refused this frame; nothing reached the socket.
                    Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                        tracing::warn!(kind, error = %e, "outbound frame dropped");
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "bridge write failed");
                        cancel.cancel();
                        break;
                    }
                }
            }
            let _ = sink.close().await;
        })
    };

    let registry = shared.handle.registry().clone();
    if let Some(previous) = registry.register(session.clone()) {
        // The old session's on_disconnected must finish first.
        previous.lifecycle_finished().await;
    }

    tracing::info!(
        node_id = %node_id,
        conn_id,
        platform = session.info.platform.as_deref().unwrap_or(""),
        commands = session.info.commands.len(),
        "node connected"
    );

    // Lifecycle actor: on_authenticated, then on_disconnected once closed.
    let lifecycle = {
        let handler = shared.handler.clone();
        let session = session.clone();
        tokio::spawn(async move {
            handler.on_authenticated(&session.info).await;
            session.cancel_token().cancelled().await;
            handler.on_disconnected(&session.info).await;
            session.mark_lifecycle_done();
        })
    };

    // Node events are delivered in order on their own task.
    let (event_tx, mut event_rx) = mpsc::channel::<NodeEvent>(EVENT_QUEUE);
    let events = {
        let handler = shared.handler.clone();
        let node_id = node_id.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                handler.on_event(&node_id, event).await;
            }
        })
    };

    let idle = shared.options.idle_timeout;
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = shutdown.cancelled() => break,
            next = tokio::time::timeout(idle, stream.next()) => next,
        };
        let decoded = match next {
            Err(_) => {
                tracing::info!(node_id = %node_id, idle_ms = idle.as_millis() as u64, "node idle timeout");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                tracing::debug!(node_id = %node_id, error = %e, "bridge read failed");
                break;
            }
            Ok(Some(Ok(decoded))) => decoded,
        };
        session.touch();
        match decoded {
            Decoded::Frame(frame) => handle_frame(&shared, &session, &event_tx, frame),
            Decoded::Malformed(e) => {
                tracing::warn!(node_id = %node_id, error = %e, "ignoring malformed frame");
            }
            Decoded::Oversized => {
                tracing::warn!(
                    node_id = %node_id,
                    max_bytes = shared.options.max_frame_bytes,
                    "ignoring oversized frame"
                );
            }
        }
    }

    // Teardown.
    let current = registry.remove_if_current(&node_id, conn_id);
    session.close();
    drop(event_tx);
    let _ = writer.await;
    let _ = events.await;
    let _ = lifecycle.await;
    tracing::info!(node_id = %node_id, conn_id, superseded = !current, "node disconnected");
}

fn handle_frame(
    shared: &Arc<Shared>,
    session: &Arc<SessionHandle>,
    events: &mpsc::Sender<NodeEvent>,
    frame: BridgeFrame,
) {
    let node_id = session.node_id();
    match frame {
        BridgeFrame::InvokeRes {
            id,
            ok,
            payload_json,
            error,
        } => {
            session.complete_invoke(
                &id,
                InvokeResult {
                    ok,
                    payload_json,
                    error,
                },
            );
        }
        BridgeFrame::Req {
            id,
            method,
            params_json,
        } => {
            let handler = shared.handler.clone();
            let session = session.clone();
            tokio::spawn(async move {
                let node_id = session.node_id().to_string();
                let res = handler
                    .on_request(
                        &node_id,
                        NodeRequest {
                            id: id.clone(),
                            method,
                            params_json,
                        },
                    )
                    .await;
                let mut frame = BridgeFrame::Res {
                    id: id.clone(),
                    ok: res.ok,
                    payload_json: res.payload_json,
                    error: res.error,
                };
                if let Err(e) = session.check_frame_size(&frame) {
                    tracing::warn!(node_id = %node_id, error = %e, "res payload too large");
                    frame = BridgeFrame::Res {
                        id,
                        ok: false,
                        payload_json: None,
                        error: Some(e.to_shape()),
                    };
                }
                if session.sink.send(frame).await.is_err() {
                    tracing::debug!(node_id = %node_id, "res dropped: connection closed");
                }
            });
        }
        BridgeFrame::Event {
            event,
            payload_json,
        } => {
            if let Err(e) = events.try_send(NodeEvent {
                event,
                payload_json,
            }) {
                tracing::warn!(node_id = %node_id, error = %e, "node event dropped");
            }
        }
        BridgeFrame::Ping { ts } => {
            let _ = session.sink.try_send(BridgeFrame::Pong { ts });
        }
        BridgeFrame::Pong { .. } => {}
        other => {
            tracing::debug!(node_id = %node_id, kind = other.kind(), "unexpected frame from node");
        }
    }
}
