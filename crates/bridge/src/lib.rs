//! Gateway side of the node bridge.
//!
//! Accepts node connections over the line-delimited JSON protocol, keeps
//! one live session per node, forwards invocations and events, and tracks
//! what each remote node can run.
//!
//! - [`server`]: listener, accept loop and the [`BridgeHandle`] used to
//!   reach connected nodes
//! - [`registry`] / [`invoke`]: per-node sessions and the pending-invoke
//!   map
//! - [`pairing`]: paired-node store and the pairing handshake
//! - [`capability`]: remote bin cache and skill eligibility
//! - [`presence`] / [`broadcast`]: presence beacons and UI fan-out
//! - [`gateway`]: the wiring the gateway process uses

pub mod broadcast;
pub mod capability;
mod connection;
pub mod error;
pub mod gateway;
pub mod invoke;
pub mod pairing;
pub mod presence;
pub mod registry;
pub mod server;
pub mod skills;

pub use broadcast::{BroadcastOptions, EventHub, StateVersion, Subscription, UiEvent};
pub use capability::{
    NodeInvoker, ProbeOutcome, RemoteCapabilityCache, RemoteNodeRecord, RemoteSkillEligibility,
};
pub use error::{BridgeError, PairingError, StartError};
pub use gateway::{GatewayNodeBridge, ListenInfo, NodeRequestHandler, NodeSubscriptions};
pub use invoke::{InvokeRequest, InvokeResult};
pub use pairing::{FilePairingStore, PairDecision, PairRequest, PairedNode, PairingStore};
pub use presence::{PresenceBoard, PresenceRecord, PresenceTimers};
pub use registry::{ConnectedNode, NodeSession, SessionHandle, SessionRegistry};
pub use server::{
    BridgeHandle, BridgeHandler, BridgeServer, BridgeServerOptions, NodeEvent, NodeRequest,
    NodeResponse, NoopHandler, TransportUpgrade,
};
pub use skills::{SkillCatalog, SkillRequirements, StaticSkillCatalog};
