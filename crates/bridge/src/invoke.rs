//! Invocation multiplexer.
//!
//! Each invoke gets a fresh correlation id and a oneshot slot in the owning
//! session's pending map.  The slot is resolved exactly once: by the
//! matching `invoke-res`, by the timeout (which retires the id), or by the
//! session closing.

use std::time::Duration;

use nb_protocol::{BridgeFrame, ErrorShape};
use serde::Serialize;
use tokio::sync::oneshot;

use crate::error::BridgeError;
use crate::registry::SessionHandle;

/// A command to run on one node.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub node_id: String,
    pub command: String,
    /// Already-serialized params.  Passed through to the node as-is.
    pub params_json: Option<String>,
    /// Falls back to the bridge default when `None`.
    pub timeout_ms: Option<u64>,
}

impl InvokeRequest {
    pub fn new(node_id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            command: command.into(),
            params_json: None,
            timeout_ms: None,
        }
    }

    pub fn with_params(mut self, params: &serde_json::Value) -> Self {
        self.params_json = Some(params.to_string());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// The node's answer, exactly as reported.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeResult {
    pub ok: bool,
    #[serde(rename = "payloadJSON", skip_serializing_if = "Option::is_none")]
    pub payload_json: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl SessionHandle {
    /// Send `invoke` and wait for the matching `invoke-res`.
    pub async fn invoke(
        &self,
        command: &str,
        params_json: Option<String>,
        timeout: Duration,
    ) -> Result<InvokeResult, BridgeError> {
        if self.is_closed() {
            return Err(BridgeError::ConnectionClosed);
        }

        let id = uuid::Uuid::new_v4().to_string();
        let frame = BridgeFrame::Invoke {
            id: id.clone(),
            command: command.to_string(),
            params_json,
            timeout_ms: Some(timeout.as_millis() as u64),
        };
        // Rejected before it gets a slot: the writer never sees it.
        self.check_frame_size(&frame)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id.clone(), tx);
        let _slot = PendingGuard {
            session: self,
            id: &id,
        };
        // `close` flips the flag before draining, so a close that raced the
        // insert is seen here.
        if self.is_closed() {
            return Err(BridgeError::ConnectionClosed);
        }

        tracing::debug!(
            node_id = %self.info.node_id,
            request_id = %id,
            command = %command,
            timeout_ms = timeout.as_millis() as u64,
            "invoke sent"
        );

        let outcome = tokio::time::timeout(timeout, async {
            self.sink
                .send(frame)
                .await
                .map_err(|_| BridgeError::ConnectionClosed)?;
            match rx.await {
                Ok(reply) => reply,
                Err(_) => Err(BridgeError::ConnectionClosed),
            }
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    node_id = %self.info.node_id,
                    request_id = %id,
                    command = %command,
                    "invoke timed out"
                );
                Err(BridgeError::Timeout)
            }
        }
    }

    /// Reject frames the codec would refuse to encode.
    pub(crate) fn check_frame_size(&self, frame: &BridgeFrame) -> Result<(), BridgeError> {
        let size = frame
            .encoded_len()
            .map_err(|e| BridgeError::SendFailed(e.to_string()))?;
        if size > self.max_frame_bytes {
            return Err(BridgeError::PayloadTooLarge {
                kind: frame.kind(),
                size,
                max: self.max_frame_bytes,
            });
        }
        Ok(())
    }

    /// Resolve a pending invoke from an `invoke-res` frame.  Responses for
    /// retired ids (timed out, or never issued) are discarded.
    pub fn complete_invoke(&self, id: &str, result: InvokeResult) -> bool {
        match self.pending.lock().remove(id) {
            Some(tx) => {
                let _ = tx.send(Ok(result));
                true
            }
            None => {
                tracing::debug!(
                    node_id = %self.info.node_id,
                    request_id = %id,
                    "discarding invoke-res for unknown or expired request"
                );
                false
            }
        }
    }

    /// Queue a one-way event to the node.  Dropped when the queue is full
    /// or the connection is gone.
    pub fn send_event(&self, event: &str, payload_json: Option<String>) -> bool {
        let frame = BridgeFrame::Event {
            event: event.to_string(),
            payload_json,
        };
        if let Err(e) = self.check_frame_size(&frame) {
            tracing::warn!(
                node_id = %self.info.node_id,
                event = %event,
                error = %e,
                "event to node dropped"
            );
            return false;
        }
        match self.sink.try_send(frame) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(
                    node_id = %self.info.node_id,
                    event = %event,
                    error = %e,
                    "event to node dropped"
                );
                false
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Retires a correlation id however the invoke ends, including when the
/// caller drops the future.  A no-op once `complete_invoke` or `close`
/// already took the slot.
struct PendingGuard<'a> {
    session: &'a SessionHandle,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.session.pending.lock().remove(self.id);
    }
}
