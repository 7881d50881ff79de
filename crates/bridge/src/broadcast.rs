//! Fan-out of gateway events to UI subscribers.
//!
//! Every subscriber has a bounded queue.  Delivery never blocks the
//! publisher: a full queue either skips the message (`drop_if_slow`) or
//! evicts the subscriber as a slow consumer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Version counters attached to state-bearing events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateVersion {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BroadcastOptions {
    pub drop_if_slow: bool,
    pub state_version: Option<StateVersion>,
}

impl BroadcastOptions {
    pub fn drop_if_slow() -> Self {
        Self {
            drop_if_slow: true,
            state_version: None,
        }
    }

    pub fn with_state_version(mut self, version: StateVersion) -> Self {
        self.state_version = Some(version);
        self
    }
}

/// One message as delivered to subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UiEvent {
    pub event: String,
    pub payload: Value,
    pub seq: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_version: Option<StateVersion>,
}

/// Receiving side of a subscription.  The queue ends when the hub evicts
/// the subscriber.
pub struct Subscription {
    pub id: u64,
    rx: mpsc::Receiver<Arc<UiEvent>>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Arc<UiEvent>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<UiEvent>> {
        self.rx.try_recv().ok()
    }
}

pub struct EventHub {
    subscribers: Mutex<HashMap<u64, mpsc::Sender<Arc<UiEvent>>>>,
    next_id: AtomicU64,
    seq: AtomicU64,
    buffer: usize,
}

impl EventHub {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            seq: AtomicU64::new(0),
            buffer: buffer.max(1),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);
        self.subscribers.lock().insert(id, tx);
        tracing::debug!(subscriber = id, "ui subscriber added");
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: u64) {
        if self.subscribers.lock().remove(&id).is_some() {
            tracing::debug!(subscriber = id, "ui subscriber removed");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Last sequence number handed out.
    pub fn seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    /// Publish to every subscriber.  Returns the sequence number assigned.
    pub fn broadcast(&self, event: &str, payload: Value, opts: BroadcastOptions) -> u64 {
        let mut subscribers = self.subscribers.lock();
        // Assigned under the lock so every subscriber sees seqs in order.
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let msg = Arc::new(UiEvent {
            event: event.to_string(),
            payload,
            seq,
            state_version: opts.state_version,
        });

        let mut evicted = Vec::new();
        for (id, tx) in subscribers.iter() {
            match tx.try_send(msg.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) if opts.drop_if_slow => {
                    tracing::debug!(subscriber = id, event = %event, seq, "slow subscriber skipped");
                }
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(subscriber = id, event = %event, "slow consumer evicted");
                    evicted.push(*id);
                }
                Err(TrySendError::Closed(_)) => evicted.push(*id),
            }
        }
        for id in evicted {
            subscribers.remove(&id);
        }
        seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn subscribers_receive_in_seq_order() {
        let hub = EventHub::new(8);
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();

        hub.broadcast("tick", json!({"n": 1}), BroadcastOptions::default());
        hub.broadcast("tick", json!({"n": 2}), BroadcastOptions::default());

        for sub in [&mut a, &mut b] {
            assert_eq!(sub.try_recv().unwrap().seq, 1);
            assert_eq!(sub.try_recv().unwrap().seq, 2);
            assert!(sub.try_recv().is_none());
        }
    }

    #[test]
    fn drop_if_slow_skips_but_keeps_subscriber() {
        let hub = EventHub::new(1);
        let mut slow = hub.subscribe();

        hub.broadcast("presence", json!(1), BroadcastOptions::drop_if_slow());
        hub.broadcast("presence", json!(2), BroadcastOptions::drop_if_slow());
        assert_eq!(hub.subscriber_count(), 1);

        assert_eq!(slow.try_recv().unwrap().payload, json!(1));
        assert!(slow.try_recv().is_none());

        hub.broadcast("presence", json!(3), BroadcastOptions::drop_if_slow());
        assert_eq!(slow.try_recv().unwrap().seq, 3);
    }

    #[test]
    fn full_queue_without_drop_evicts() {
        let hub = EventHub::new(1);
        let mut slow = hub.subscribe();
        let mut fast = hub.subscribe();

        hub.broadcast("chat", json!(1), BroadcastOptions::default());
        fast.try_recv().unwrap();
        hub.broadcast("chat", json!(2), BroadcastOptions::default());

        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(fast.try_recv().unwrap().seq, 2);
        // The evicted subscriber still drains what it already had.
        assert_eq!(slow.try_recv().unwrap().seq, 1);
        assert!(slow.try_recv().is_none());
    }

    #[test]
    fn closed_subscriber_is_pruned() {
        let hub = EventHub::new(4);
        let sub = hub.subscribe();
        drop(sub);
        hub.broadcast("x", Value::Null, BroadcastOptions::drop_if_slow());
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn state_version_is_serialized_camel_case() {
        let hub = EventHub::new(4);
        let mut sub = hub.subscribe();
        hub.broadcast(
            "presence",
            json!({}),
            BroadcastOptions::drop_if_slow().with_state_version(StateVersion {
                presence: Some(3),
                health: Some(1),
            }),
        );
        let v = serde_json::to_value(&*sub.try_recv().unwrap()).unwrap();
        assert_eq!(v["stateVersion"]["presence"], 3);
        assert_eq!(v["stateVersion"]["health"], 1);
    }
}
