use nb_protocol::{codes, ErrorShape};

/// Failures of a single bridge call.
///
/// These are ordinary results, never fatal: callers log them and move on.
/// `Display` renders the same strings nodes and operators see.  Only
/// `PayloadTooLarge` is the caller's fault; it never touches the session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("UNAVAILABLE: node not connected")]
    NotConnected,
    #[error("UNAVAILABLE: invoke timeout")]
    Timeout,
    #[error("UNAVAILABLE: bridge connection closed")]
    ConnectionClosed,
    #[error("UNAVAILABLE: send failed: {0}")]
    SendFailed(String),
    #[error("PAYLOAD_TOO_LARGE: {kind} frame is {size} bytes (max {max})")]
    PayloadTooLarge {
        kind: &'static str,
        size: usize,
        max: usize,
    },
}

impl BridgeError {
    /// Error class reported to API callers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::PayloadTooLarge { .. } => codes::PAYLOAD_TOO_LARGE,
            _ => codes::UNAVAILABLE,
        }
    }

    pub fn to_shape(&self) -> ErrorShape {
        let full = self.to_string();
        let message = full
            .strip_prefix(self.code())
            .and_then(|rest| rest.strip_prefix(": "))
            .unwrap_or(&full)
            .to_string();
        ErrorShape::new(self.code(), message)
    }
}

/// Failures of the pairing store.
#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    #[error("pairing rejected")]
    Rejected,
    #[error("pairing request expired")]
    Expired,
    #[error("unknown pairing request: {0}")]
    UnknownRequest(String),
    #[error("pairing store I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("pairing store format: {0}")]
    Format(#[from] serde_json::Error),
}

/// Why the bridge listener did not start.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("bridge disabled")]
    Disabled,
    #[error("bind policy could not be satisfied: {0}")]
    BindPolicy(String),
    #[error("tls configured but no encrypted transport is installed")]
    TlsUnavailable,
    #[error("bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}
