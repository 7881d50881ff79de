//! Raw protocol client used by the bridge integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use nb_protocol::{BridgeFrame, Decoded, FrameCodec, NodeIdentity};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestNode {
    framed: Framed<TcpStream, FrameCodec>,
}

impl TestNode {
    pub async fn connect(addr: SocketAddr) -> Self {
        let tcp = TcpStream::connect(addr).await.expect("connect to bridge");
        Self {
            framed: Framed::new(tcp, FrameCodec::default()),
        }
    }

    /// Connect and complete the `hello` handshake.
    pub async fn hello(addr: SocketAddr, node: NodeIdentity, token: &str) -> Self {
        let mut conn = Self::connect(addr).await;
        conn.send(BridgeFrame::Hello {
            node,
            token: token.to_string(),
        })
        .await;
        match conn.recv().await {
            BridgeFrame::HelloOk { .. } => conn,
            other => panic!("expected hello-ok, got {other:?}"),
        }
    }

    pub async fn send(&mut self, frame: BridgeFrame) {
        self.framed.send(frame).await.expect("send frame");
    }

    pub async fn send_raw(&mut self, line: &str) {
        let stream = self.framed.get_mut();
        stream.write_all(line.as_bytes()).await.expect("write raw");
        stream.flush().await.expect("flush raw");
    }

    /// Next frame from the gateway.  Panics on timeout or close.
    pub async fn recv(&mut self) -> BridgeFrame {
        self.try_recv()
            .await
            .expect("connection closed while waiting for a frame")
    }

    /// Next frame, or `None` once the gateway closed the connection.
    pub async fn try_recv(&mut self) -> Option<BridgeFrame> {
        loop {
            let next = tokio::time::timeout(RECV_TIMEOUT, self.framed.next())
                .await
                .expect("timed out waiting for a frame");
            match next {
                Some(Ok(Decoded::Frame(frame))) => return Some(frame),
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => return None,
            }
        }
    }

    /// Skip frames until `pred` matches.
    pub async fn recv_until(&mut self, pred: impl Fn(&BridgeFrame) -> bool) -> BridgeFrame {
        loop {
            let frame = self.recv().await;
            if pred(&frame) {
                return frame;
            }
        }
    }

    /// Wait for the gateway to close the connection, ignoring frames.
    pub async fn expect_closed(&mut self) {
        while self.try_recv().await.is_some() {}
    }
}

pub fn identity(node_id: &str) -> NodeIdentity {
    NodeIdentity {
        node_id: node_id.to_string(),
        ..Default::default()
    }
}

pub fn mac_identity(node_id: &str, display_name: &str, commands: &[&str]) -> NodeIdentity {
    NodeIdentity {
        node_id: node_id.to_string(),
        display_name: Some(display_name.to_string()),
        platform: Some("darwin".into()),
        device_family: Some("Mac".into()),
        commands: commands.iter().map(|c| c.to_string()).collect(),
        ..Default::default()
    }
}

/// Poll `cond` until it holds or five seconds pass.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
