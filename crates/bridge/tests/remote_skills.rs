//! Gateway wiring end to end: a macOS node connects, gets probed for the
//! binaries local skills need, and becomes eligible for remote skills.

mod common;

use std::sync::Arc;

use common::{mac_identity, wait_until, TestNode};
use nb_bridge::{
    BroadcastOptions, EventHub, FilePairingStore, GatewayNodeBridge, PairedNode, PairingStore,
    SkillRequirements, StaticSkillCatalog,
};
use nb_domain::config::{BindMode, Config};
use nb_protocol::BridgeFrame;
use serde_json::{json, Value};

struct Gateway {
    bridge: Arc<GatewayNodeBridge>,
    hub: Arc<EventHub>,
    pairing: Arc<FilePairingStore>,
    token: String,
}

async fn start_gateway(probe_timeout_ms: u64) -> Gateway {
    let mut config = Config::default();
    config.bridge.bind = BindMode::Loopback;
    config.bridge.port = 0;
    config.skills.probe_timeout_ms = probe_timeout_ms;

    let pairing = Arc::new(FilePairingStore::in_memory());
    let token = pairing
        .insert_paired(PairedNode {
            node_id: "N1".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    let catalog = Arc::new(StaticSkillCatalog::new(vec![
        SkillRequirements {
            name: "json-tools".into(),
            bins: vec!["jq".into()],
            ..Default::default()
        },
        SkillRequirements {
            name: "apple-notes".into(),
            bins: vec!["memo".into()],
            os: vec!["darwin".into()],
            ..Default::default()
        },
        SkillRequirements {
            name: "apt".into(),
            bins: vec!["apt".into()],
            os: vec!["linux".into()],
            ..Default::default()
        },
    ]));
    let hub = Arc::new(EventHub::new(64));
    let bridge = GatewayNodeBridge::new(
        &config,
        pairing.clone() as Arc<dyn PairingStore>,
        catalog,
        hub.clone(),
    );
    bridge.start(&config.bridge, None, None).await.unwrap();
    Gateway {
        bridge,
        hub,
        pairing,
        token,
    }
}

fn payload(frame: &BridgeFrame) -> Value {
    match frame {
        BridgeFrame::Invoke { params_json, .. } | BridgeFrame::Event { payload_json: params_json, .. } => {
            serde_json::from_str(params_json.as_deref().unwrap_or("null")).unwrap()
        }
        other => panic!("no payload on {other:?}"),
    }
}

#[tokio::test]
async fn mac_node_is_probed_and_becomes_eligible() {
    let gw = start_gateway(15_000).await;
    let addr = gw.bridge.listen_info().unwrap().addr;
    let mut ui = gw.hub.subscribe();
    let before = gw.bridge.capabilities.snapshot_version();

    let mut node = TestNode::hello(
        addr,
        mac_identity("N1", "Studio Mac", &["system.run", "system.which"]),
        &gw.token,
    )
    .await;

    // The probe prefers system.which and asks for the darwin-eligible bins.
    let probe = node.recv().await;
    let id = match &probe {
        BridgeFrame::Invoke { id, command, .. } => {
            assert_eq!(command, "system.which");
            id.clone()
        }
        other => panic!("expected probe invoke, got {other:?}"),
    };
    assert_eq!(payload(&probe), json!({ "bins": ["jq", "memo"] }));
    node.send(BridgeFrame::InvokeRes {
        id,
        ok: true,
        payload_json: Some(r#"{"bins":["jq"]}"#.into()),
        error: None,
    })
    .await;

    // Trigger words follow once the node is set up.
    let wake = node.recv().await;
    assert!(matches!(&wake, BridgeFrame::Event { event, .. } if event == "voicewake.changed"));
    assert_eq!(payload(&wake), json!({ "triggers": ["clawd", "claude"] }));

    let caps = gw.bridge.capabilities.clone();
    wait_until(|| {
        caps.remote_skill_eligibility()
            .map(|e| e.has_bin("jq"))
            .unwrap_or(false)
    })
    .await;
    let eligibility = caps.remote_skill_eligibility().unwrap();
    assert_eq!(eligibility.platforms, vec!["darwin"]);
    assert!(!eligibility.has_bin("memo"));
    assert!(eligibility.has_any_bin(&["memo", "jq"]));
    assert_eq!(
        eligibility.note,
        "Remote macOS node available (Studio Mac). Run macOS-only skills via nodes.run on that node."
    );
    // One bump for the new node, one for the probe result.
    assert_eq!(caps.snapshot_version(), before + 2);

    // Probed bins are persisted with the paired node.
    let paired = gw.pairing.list_paired().await.unwrap();
    assert_eq!(paired[0].bins, vec!["jq"]);
    assert_eq!(paired[0].platform.as_deref(), Some("darwin"));

    // The UI saw the presence beacon for the connect.
    let first = ui.recv().await.unwrap();
    assert_eq!(first.event, "presence");
    assert_eq!(first.payload["presence"][0]["reason"], "node-connected");

    drop(node);
    wait_until(|| caps.remote_skill_eligibility().is_none()).await;
    gw.bridge.shutdown().await;
}

#[tokio::test]
async fn probe_timeout_keeps_the_session() {
    let gw = start_gateway(200).await;
    let addr = gw.bridge.listen_info().unwrap().addr;

    let mut node = TestNode::hello(
        addr,
        mac_identity("N1", "Studio Mac", &["system.run"]),
        &gw.token,
    )
    .await;

    // Without system.which the probe falls back to a shell script.
    let probe = node.recv().await;
    match &probe {
        BridgeFrame::Invoke { command, .. } => assert_eq!(command, "system.run"),
        other => panic!("expected probe invoke, got {other:?}"),
    }
    let argv = payload(&probe)["command"].clone();
    assert_eq!(argv[0], "/bin/sh");
    assert_eq!(argv[1], "-lc");
    assert!(argv[2].as_str().unwrap().contains("command -v"));

    // No reply: the probe times out and setup continues.
    let wake = node.recv().await;
    assert!(matches!(&wake, BridgeFrame::Event { event, .. } if event == "voicewake.changed"));

    let eligibility = gw.bridge.capabilities.remote_skill_eligibility().unwrap();
    assert!(eligibility.bins.is_empty());
    assert!(gw.bridge.handle.registry().is_connected("N1"));

    node.send(BridgeFrame::Ping { ts: 3 }).await;
    assert_eq!(node.recv().await, BridgeFrame::Pong { ts: 3 });
    gw.bridge.shutdown().await;
}

#[tokio::test]
async fn non_mac_node_is_not_probed() {
    let gw = start_gateway(15_000).await;
    let addr = gw.bridge.listen_info().unwrap().addr;
    let mut identity = mac_identity("N1", "Linux Box", &["system.run", "system.which"]);
    identity.platform = Some("linux".into());
    identity.device_family = None;

    let mut node = TestNode::hello(addr, identity, &gw.token).await;

    // The first frame is the trigger push, not a probe.
    let first = node.recv().await;
    assert!(matches!(&first, BridgeFrame::Event { event, .. } if event == "voicewake.changed"));
    assert!(gw.bridge.capabilities.remote_skill_eligibility().is_none());
    gw.bridge.shutdown().await;
}

#[tokio::test]
async fn subscribed_nodes_receive_gateway_broadcasts() {
    let gw = start_gateway(15_000).await;
    let addr = gw.bridge.listen_info().unwrap().addr;
    let mut identity = mac_identity("N1", "Box", &[]);
    identity.platform = Some("linux".into());
    identity.device_family = None;
    let mut node = TestNode::hello(addr, identity, &gw.token).await;
    node.recv_until(|f| matches!(f, BridgeFrame::Event { event, .. } if event == "voicewake.changed"))
        .await;

    gw.bridge.subscriptions.subscribe("N1", &["chat".to_string()]);
    gw.bridge
        .broadcast("chat", json!({ "text": "hi" }), BroadcastOptions::default());
    gw.bridge
        .broadcast("other", json!({}), BroadcastOptions::default());

    let frame = node.recv().await;
    assert!(matches!(&frame, BridgeFrame::Event { event, .. } if event == "chat"));
    assert_eq!(payload(&frame), json!({ "text": "hi" }));

    // Trigger updates are pushed to every connected node.
    assert_eq!(gw.bridge.set_voicewake_triggers(vec!["computer".into()]), 1);
    let wake = node.recv().await;
    assert_eq!(payload(&wake), json!({ "triggers": ["computer"] }));

    drop(node);
    let bridge = gw.bridge.clone();
    wait_until(|| bridge.subscriptions.events_for("N1").is_empty()).await;
    gw.bridge.shutdown().await;
}
