//! Answers node-initiated `req` frames and relays node events to the UI.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use nb_bridge::capability::skill_platform;
use nb_bridge::gateway::EVENT_NODE_EVENT;
use nb_bridge::skills::collect_required_bins;
use nb_bridge::{
    BroadcastOptions, GatewayNodeBridge, NodeEvent, NodeRequest, NodeRequestHandler, NodeResponse,
    SkillCatalog,
};
use nb_protocol::codes;
use serde::Deserialize;
use serde_json::{json, Value};

pub const METHOD_HEALTH: &str = "health";
pub const METHOD_SKILLS_BINS: &str = "skills.bins";
pub const METHOD_SUBSCRIBE: &str = "subscribe";
pub const METHOD_UNSUBSCRIBE: &str = "unsubscribe";

#[derive(Debug, Default, Deserialize)]
struct EventsParams {
    #[serde(default)]
    events: Vec<String>,
}

/// Node request handler installed by the gateway.
///
/// Holds the bridge weakly: the bridge owns the listener that owns this
/// handler.
pub struct GatewayRequests {
    bridge: Weak<GatewayNodeBridge>,
    catalog: Arc<dyn SkillCatalog>,
}

impl GatewayRequests {
    pub fn new(bridge: &Arc<GatewayNodeBridge>, catalog: Arc<dyn SkillCatalog>) -> Self {
        Self {
            bridge: Arc::downgrade(bridge),
            catalog,
        }
    }

    fn health(&self, bridge: &GatewayNodeBridge) -> Value {
        let versions = bridge.presence.versions();
        json!({
            "ok": true,
            "ts": chrono::Utc::now().timestamp_millis(),
            "connected": bridge.handle.registry().len(),
            "stateVersion": versions,
            "skillsSnapshot": bridge.capabilities.snapshot_version(),
        })
    }

    fn skills_bins(&self, bridge: &GatewayNodeBridge, node_id: &str) -> Value {
        let platform = bridge
            .handle
            .registry()
            .get(node_id)
            .map(|s| skill_platform(s.info.platform.as_deref(), s.info.device_family.as_deref()))
            .unwrap_or_default();
        let bins = collect_required_bins(&self.catalog.load_skills(), &platform);
        json!({ "bins": bins })
    }
}

#[async_trait]
impl NodeRequestHandler for GatewayRequests {
    async fn handle_request(&self, node_id: &str, request: NodeRequest) -> NodeResponse {
        let Some(bridge) = self.bridge.upgrade() else {
            return NodeResponse::error(codes::UNAVAILABLE, "gateway shutting down");
        };

        match request.method.as_str() {
            METHOD_HEALTH => NodeResponse::ok(&self.health(&bridge)),
            METHOD_SKILLS_BINS => NodeResponse::ok(&self.skills_bins(&bridge, node_id)),
            METHOD_SUBSCRIBE | METHOD_UNSUBSCRIBE => {
                let params: EventsParams = match request.params_json.as_deref() {
                    Some(raw) => match serde_json::from_str(raw) {
                        Ok(p) => p,
                        Err(e) => {
                            return NodeResponse::error(
                                codes::INVALID_REQUEST,
                                format!("invalid params: {e}"),
                            )
                        }
                    },
                    None => EventsParams::default(),
                };
                if request.method == METHOD_SUBSCRIBE {
                    bridge.subscriptions.subscribe(node_id, &params.events);
                } else {
                    bridge.subscriptions.unsubscribe(node_id, &params.events);
                }
                tracing::debug!(
                    node_id = %node_id,
                    method = %request.method,
                    events = ?params.events,
                    "node subscriptions updated"
                );
                NodeResponse::ok(&json!({ "events": bridge.subscriptions.events_for(node_id) }))
            }
            other => NodeResponse::error(codes::INVALID_REQUEST, format!("unknown method: {other}")),
        }
    }

    async fn handle_event(&self, node_id: &str, event: NodeEvent) {
        let Some(bridge) = self.bridge.upgrade() else {
            return;
        };
        let payload = event
            .payload_json
            .as_deref()
            .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
            .unwrap_or(Value::Null);
        tracing::debug!(node_id = %node_id, event = %event.event, "node event");
        bridge.hub.broadcast(
            EVENT_NODE_EVENT,
            json!({ "nodeId": node_id, "event": event.event, "payload": payload }),
            BroadcastOptions::drop_if_slow(),
        );
    }
}
