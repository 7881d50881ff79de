//! Node bridge protocol: frame types exchanged between the gateway and its
//! nodes, structured error shapes, and the line-delimited JSON codec.
//!
//! Nodes are remote agents (e.g. a macOS helper) that pair with the gateway,
//! declare the commands they support, and execute invocations on its behalf.
//!
//! Every frame is one JSON object on its own line, tagged by `type`:
//!
//! | type           | direction       | purpose                                  |
//! |----------------|-----------------|------------------------------------------|
//! | `pair-request` | node → gateway  | ask to be paired (no token yet)          |
//! | `pair-result`  | gateway → node  | pairing decision, carries the token      |
//! | `hello`        | node → gateway  | authenticate with a token                |
//! | `hello-ok`     | gateway → node  | session established                      |
//! | `error`        | gateway → node  | handshake failure, connection closes     |
//! | `invoke`       | gateway → node  | run a command                            |
//! | `invoke-res`   | node → gateway  | command result                           |
//! | `req` / `res`  | node → gateway  | node-initiated request and its answer    |
//! | `event`        | both            | one-way, fire-and-forget                 |
//! | `ping` / `pong`| both            | liveness                                 |

pub mod codec;

use serde::{Deserialize, Serialize};

pub use codec::{Decoded, FrameCodec};

/// Bumped on incompatible wire changes.  Sent in `hello-ok`.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default maximum frame length (1 MB).
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Well-known error codes.  Nodes may report codes outside this list; they
/// are passed through untouched.
pub mod codes {
    pub const UNAVAILABLE: &str = "UNAVAILABLE";
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    pub const NOT_PAIRED: &str = "NOT_PAIRED";
    pub const PAIRING_REJECTED: &str = "PAIRING_REJECTED";
    pub const INTERNAL: &str = "INTERNAL";
    pub const PAYLOAD_TOO_LARGE: &str = "PAYLOAD_TOO_LARGE";
}

/// One wire frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BridgeFrame {
    /// Node → Gateway: unpaired node asks to be paired.
    #[serde(rename = "pair-request")]
    PairRequest {
        node: NodeIdentity,
        /// Suppress UI prompts on the gateway side (auto-approval flows).
        #[serde(default)]
        silent: bool,
    },

    /// Gateway → Node: pairing decision.
    #[serde(rename = "pair-result")]
    PairResult {
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorShape>,
    },

    /// Node → Gateway: authenticate with a previously issued token.
    #[serde(rename = "hello")]
    Hello { node: NodeIdentity, token: String },

    /// Gateway → Node: handshake accepted.
    #[serde(rename = "hello-ok")]
    HelloOk {
        #[serde(rename = "serverName")]
        server_name: String,
        protocol: u32,
    },

    /// Gateway → Node: handshake failed; the gateway closes the connection.
    #[serde(rename = "error")]
    Error { code: String, message: String },

    /// Gateway → Node: invoke a command.
    #[serde(rename = "invoke")]
    Invoke {
        id: String,
        command: String,
        #[serde(rename = "paramsJSON", default, skip_serializing_if = "Option::is_none")]
        params_json: Option<String>,
        #[serde(rename = "timeoutMs", default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },

    /// Node → Gateway: result of an `invoke`.
    #[serde(rename = "invoke-res")]
    InvokeRes {
        id: String,
        ok: bool,
        #[serde(rename = "payloadJSON", default, skip_serializing_if = "Option::is_none")]
        payload_json: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorShape>,
    },

    /// Either direction: one-way event.
    #[serde(rename = "event")]
    Event {
        event: String,
        #[serde(rename = "payloadJSON", default, skip_serializing_if = "Option::is_none")]
        payload_json: Option<String>,
    },

    /// Node → Gateway: node-initiated request.
    #[serde(rename = "req")]
    Req {
        id: String,
        method: String,
        #[serde(rename = "paramsJSON", default, skip_serializing_if = "Option::is_none")]
        params_json: Option<String>,
    },

    /// Gateway → Node: answer to a `req`.
    #[serde(rename = "res")]
    Res {
        id: String,
        ok: bool,
        #[serde(rename = "payloadJSON", default, skip_serializing_if = "Option::is_none")]
        payload_json: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorShape>,
    },

    #[serde(rename = "ping")]
    Ping { ts: i64 },

    #[serde(rename = "pong")]
    Pong { ts: i64 },
}

impl BridgeFrame {
    /// Wire tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PairRequest { .. } => "pair-request",
            Self::PairResult { .. } => "pair-result",
            Self::Hello { .. } => "hello",
            Self::HelloOk { .. } => "hello-ok",
            Self::Error { .. } => "error",
            Self::Invoke { .. } => "invoke",
            Self::InvokeRes { .. } => "invoke-res",
            Self::Event { .. } => "event",
            Self::Req { .. } => "req",
            Self::Res { .. } => "res",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
        }
    }

    /// Size of the frame on the wire, without the trailing newline.
    pub fn encoded_len(&self) -> Result<usize, serde_json::Error> {
        serde_json::to_vec(self).map(|json| json.len())
    }
}

/// Identity and declared capabilities a node presents during the handshake.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeIdentity {
    /// Stable opaque identity (unique per node).
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// e.g. `"darwin"`, `"macos 15.1"`, `"linux"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub core_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui_version: Option<String>,
    /// e.g. `"Mac"`, `"iPhone"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_family: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_identifier: Option<String>,
    /// Command names the node declares support for (e.g. `"system.run"`).
    #[serde(default)]
    pub commands: Vec<String>,
}

/// Structured error carried by `pair-result`, `invoke-res` and `res`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
}

impl ErrorShape {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invoke_uses_wire_field_names() {
        let frame = BridgeFrame::Invoke {
            id: "1".into(),
            command: "system.which".into(),
            params_json: Some(r#"{"bins":["git"]}"#.into()),
            timeout_ms: Some(15_000),
        };
        let v: serde_json::Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(v["type"], "invoke");
        assert_eq!(v["paramsJSON"], r#"{"bins":["git"]}"#);
        assert_eq!(v["timeoutMs"], 15_000);
    }

    #[test]
    fn hello_parses_with_minimal_identity() {
        let raw = r#"{"type":"hello","token":"t","node":{"nodeId":"n1"}}"#;
        let frame: BridgeFrame = serde_json::from_str(raw).unwrap();
        match frame {
            BridgeFrame::Hello { node, token } => {
                assert_eq!(node.node_id, "n1");
                assert!(node.commands.is_empty());
                assert_eq!(token, "t");
            }
            other => panic!("expected Hello, got {other:?}"),
        }
    }

    #[test]
    fn invoke_res_error_omits_payload() {
        let frame = BridgeFrame::InvokeRes {
            id: "7".into(),
            ok: false,
            payload_json: None,
            error: Some(ErrorShape::new(codes::INVALID_REQUEST, "bad params")),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(!json.contains("payloadJSON"));
        assert!(json.contains(r#""code":"INVALID_REQUEST""#));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let raw = r#"{"type":"teleport","id":"1"}"#;
        assert!(serde_json::from_str::<BridgeFrame>(raw).is_err());
    }

    #[test]
    fn kind_matches_serde_tag() {
        let frame = BridgeFrame::Pong { ts: 1 };
        let v: serde_json::Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(v["type"], frame.kind());
    }
}
