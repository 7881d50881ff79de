//! Core types for command handling: context, results, and errors.

use std::time::Duration;

use nb_protocol::{codes, ErrorShape};
use tokio_util::sync::CancellationToken;

/// Context provided to every command handler invocation.
#[derive(Clone, Debug)]
pub struct CommandContext {
    /// Correlation id of the `invoke` frame.
    pub request_id: String,
    /// Command name as sent by the gateway (e.g. `"system.run"`).
    pub command: String,
    /// Deadline the gateway applies to this invocation, when it sent one.
    pub timeout: Option<Duration>,
    /// Cancelled when the connection drops or the node shuts down.
    pub cancel: CancellationToken,
}

/// Result type for command handlers.
pub type CommandResult = Result<serde_json::Value, CommandError>;

/// Errors a command handler can return.  Each maps onto a wire error code.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("failed: {0}")]
    Failed(String),
}

impl CommandError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidParams(_) => codes::INVALID_REQUEST,
            Self::Unavailable(_) | Self::Timeout(_) => codes::UNAVAILABLE,
            Self::Failed(_) => codes::INTERNAL,
        }
    }

    pub fn to_shape(&self) -> ErrorShape {
        let message = match self {
            Self::InvalidParams(m) | Self::Unavailable(m) | Self::Timeout(m) | Self::Failed(m) => {
                m.clone()
            }
        };
        ErrorShape::new(self.code(), message)
    }
}

/// A one-way event pushed by the gateway (e.g. `voicewake.changed`).
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayEvent {
    pub event: String,
    /// Parsed `payloadJSON`; `Null` when absent or unparseable.
    pub payload: serde_json::Value,
}

/// Top-level SDK error.
#[derive(thiserror::Error, Debug)]
pub enum NodeSdkError {
    #[error("config: {0}")]
    Config(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("handshake: {0}")]
    Handshake(String),
    #[error("pairing rejected: {0}")]
    PairingRejected(String),
    #[error("reconnect exhausted after {0} attempts")]
    ReconnectExhausted(u32),
    #[error("shutdown")]
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_wire_codes() {
        assert_eq!(
            CommandError::InvalidParams("x".into()).to_shape(),
            ErrorShape::new("INVALID_REQUEST", "x")
        );
        assert_eq!(CommandError::Timeout("t".into()).code(), "UNAVAILABLE");
        assert_eq!(CommandError::Failed("boom".into()).code(), "INTERNAL");
    }
}
