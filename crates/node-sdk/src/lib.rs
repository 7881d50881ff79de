//! `nb-node-sdk`: building blocks for NodeBridge nodes.
//!
//! A node is a process on another machine (typically a Mac) that connects to
//! the gateway's node bridge, declares the commands it supports, and runs
//! them when the gateway invokes it.  This crate handles the connection,
//! pairing, heartbeat, reconnects and dispatch so node authors only write
//! command handlers.
//!
//! ```text
//!   let mut reg = CommandRegistry::with_system_commands();
//!   reg.register("notes.search", NotesSearch);
//!
//!   let client = NodeClientBuilder::new()
//!       .gateway_addr("gateway.local:18790")
//!       .node_id("mac-studio")
//!       .platform("darwin")
//!       .build()?;
//!   client.run(reg, shutdown).await;
//! ```
//!
//! # Connection flow
//!
//! 1. Connect over TCP.
//! 2. With a token: send `hello {node, token}`.  Without one: send
//!    `pair-request {node}`, wait for the operator's `pair-result`, keep the
//!    issued token (see [`NodeClient::token`]).
//! 3. Wait for `hello-ok`.
//! 4. Main loop: `invoke` → registered handler → `invoke-res` (always sent,
//!    even if the handler panics); `event` → events channel; `ping` → `pong`;
//!    periodic `ping` as heartbeat.
//! 5. On disconnect: reconnect with jittered exponential back-off.

pub mod builder;
pub mod builtins;
pub mod client;
pub mod reconnect;
pub mod registry;
pub mod types;

pub use builder::NodeClientBuilder;
pub use builtins::{SystemRun, SystemWhich, CMD_SYSTEM_RUN, CMD_SYSTEM_WHICH};
pub use client::NodeClient;
pub use reconnect::ReconnectBackoff;
pub use registry::{CommandRegistry, NodeCommand};
pub use types::{CommandContext, CommandError, CommandResult, GatewayEvent, NodeSdkError};

pub use nb_protocol::NodeIdentity;
