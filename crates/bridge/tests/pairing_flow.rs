//! Pairing over the wire: request, operator decision, then a token-based
//! reconnect.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{identity, wait_until, TestNode};
use nb_bridge::{
    BridgeHandle, BridgeHandler, BridgeServer, BridgeServerOptions, FilePairingStore,
    PairRequest, PairingStore,
};
use nb_protocol::{codes, BridgeFrame};
use parking_lot::Mutex;

#[derive(Default)]
struct PairWatcher {
    requests: Mutex<Vec<String>>,
}

#[async_trait]
impl BridgeHandler for PairWatcher {
    async fn on_pair_requested(&self, request: &PairRequest) {
        self.requests.lock().push(request.node.node_id.clone());
    }
}

async fn start(pairing: Arc<FilePairingStore>) -> (BridgeServer, Arc<PairWatcher>) {
    let watcher = Arc::new(PairWatcher::default());
    let server = BridgeServer::start(
        BridgeHandle::new(Duration::from_secs(5)),
        BridgeServerOptions::local("test-gateway"),
        pairing as Arc<dyn PairingStore>,
        watcher.clone(),
        None,
    )
    .await
    .unwrap();
    (server, watcher)
}

async fn pending_request_id(pairing: &FilePairingStore) -> String {
    loop {
        if let Some(req) = pairing.list_pending().await.into_iter().next() {
            return req.request_id;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn approved_pairing_issues_token_and_opens_session() {
    let pairing = Arc::new(FilePairingStore::in_memory());
    let (server, watcher) = start(pairing.clone()).await;

    let mut conn = TestNode::connect(server.local_addr()).await;
    conn.send(BridgeFrame::PairRequest {
        node: identity("n-new"),
        silent: false,
    })
    .await;

    let request_id = tokio::time::timeout(Duration::from_secs(5), pending_request_id(&pairing))
        .await
        .unwrap();
    wait_until(|| *watcher.requests.lock() == vec!["n-new"]).await;
    pairing.approve(&request_id).await.unwrap();

    let token = match conn.recv().await {
        BridgeFrame::PairResult {
            ok: true,
            token: Some(token),
            ..
        } => token,
        other => panic!("expected successful pair-result, got {other:?}"),
    };
    assert!(matches!(conn.recv().await, BridgeFrame::HelloOk { .. }));
    let handle = server.handle().clone();
    wait_until(|| handle.registry().is_connected("n-new")).await;
    drop(conn);
    wait_until(|| !handle.registry().is_connected("n-new")).await;

    // The issued token authenticates later connections.
    let _again = TestNode::hello(server.local_addr(), identity("n-new"), &token).await;
    wait_until(|| handle.registry().is_connected("n-new")).await;
    assert!(pairing.verify("n-new", &token).await);
}

#[tokio::test]
async fn rejected_pairing_is_reported_to_the_node() {
    let pairing = Arc::new(FilePairingStore::in_memory());
    let (server, _watcher) = start(pairing.clone()).await;

    let mut conn = TestNode::connect(server.local_addr()).await;
    conn.send(BridgeFrame::PairRequest {
        node: identity("n-bad"),
        silent: false,
    })
    .await;
    let request_id = tokio::time::timeout(Duration::from_secs(5), pending_request_id(&pairing))
        .await
        .unwrap();
    pairing.reject(&request_id).await.unwrap();

    match conn.recv().await {
        BridgeFrame::PairResult {
            ok: false, error, ..
        } => assert_eq!(error.unwrap().code, codes::PAIRING_REJECTED),
        other => panic!("expected rejected pair-result, got {other:?}"),
    }
    conn.expect_closed().await;
    assert!(!server.handle().registry().is_connected("n-bad"));
}

#[tokio::test]
async fn auto_approve_pairs_without_operator() {
    let pairing = Arc::new(FilePairingStore::in_memory().with_auto_approve(true));
    let (server, _watcher) = start(pairing.clone()).await;

    let mut conn = TestNode::connect(server.local_addr()).await;
    conn.send(BridgeFrame::PairRequest {
        node: identity("n-auto"),
        silent: true,
    })
    .await;
    assert!(matches!(
        conn.recv().await,
        BridgeFrame::PairResult { ok: true, .. }
    ));
    assert!(matches!(conn.recv().await, BridgeFrame::HelloOk { .. }));
    assert_eq!(pairing.list_paired().await.unwrap().len(), 1);
}
