use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::broadcast;

/// Internal wire frame — origin id, topic, opaque payload.
#[derive(Debug, Clone)]
struct Frame {
    origin: Arc<str>,
    topic: Arc<str>,
    payload: Bytes,
}

/// A frame as seen by a subscriber (own-origin frames are filtered out).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusFrame {
    /// Context id of the publisher.
    pub origin: String,
    /// Opaque payload bytes.
    pub payload: Bytes,
}

/// The shared same-origin bus. One per application origin; every context
/// attaches a [`BusHandle`] carrying its own id.
///
/// Cheap to clone — clones share the underlying channel.
#[derive(Debug, Clone)]
pub struct BroadcastBus {
    tx: broadcast::Sender<Frame>,
}

impl BroadcastBus {
    /// Create a bus with the given per-subscriber frame capacity.
    ///
    /// A subscriber that falls more than `capacity` frames behind loses the
    /// oldest frames (at-most-once delivery).
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Attach a context to the bus, producing a handle bound to its id.
    pub fn attach(&self, context_id: impl Into<String>) -> BusHandle {
        BusHandle {
            context_id: Arc::from(context_id.into()),
            tx: self.tx.clone(),
        }
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(64)
    }
}

/// A context's connection to the bus.
///
/// Cheap to clone. `publish` is fire-and-forget; `subscribe` returns a
/// stream of frames from *other* contexts on the given topic.
#[derive(Debug, Clone)]
pub struct BusHandle {
    context_id: Arc<str>,
    tx: broadcast::Sender<Frame>,
}

impl BusHandle {
    /// The id this handle publishes as.
    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    /// Publish a payload on a topic. Non-blocking, never fails.
    ///
    /// A frame published while no other context is subscribed is dropped —
    /// that is the contract, not an error.
    pub fn publish(&self, topic: &str, payload: Bytes) {
        let frame = Frame {
            origin: self.context_id.clone(),
            topic: Arc::from(topic),
            payload,
        };
        // Err means no live subscribers; fire-and-forget swallows it.
        let _ = self.tx.send(frame);
    }

    /// Subscribe to a topic. Delivery stops when the subscription is dropped.
    pub fn subscribe(&self, topic: &str) -> BusSubscription {
        BusSubscription {
            own_id: self.context_id.clone(),
            topic: Arc::from(topic),
            rx: self.tx.subscribe(),
        }
    }
}

/// A live subscription to one topic. Dropping it unsubscribes.
#[derive(Debug)]
pub struct BusSubscription {
    own_id: Arc<str>,
    topic: Arc<str>,
    rx: broadcast::Receiver<Frame>,
}

impl BusSubscription {
    /// Receive the next frame from another context on this topic.
    ///
    /// Returns `None` once the bus itself is gone (all handles dropped).
    /// Lagged frames are skipped with a warning — lost frames are part of
    /// the at-most-once contract.
    pub async fn recv(&mut self) -> Option<BusFrame> {
        loop {
            match self.rx.recv().await {
                Ok(frame) => {
                    if frame.topic != self.topic {
                        continue;
                    }
                    // Self-exclusion: the bus never delivers a context's
                    // own frames back to it.
                    if frame.origin == self.own_id {
                        continue;
                    }
                    return Some(BusFrame {
                        origin: frame.origin.to_string(),
                        payload: frame.payload,
                    });
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, topic = %self.topic, "bus subscription lagged, frames lost");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive — `None` if no frame is currently pending.
    pub fn try_recv(&mut self) -> Option<BusFrame> {
        loop {
            match self.rx.try_recv() {
                Ok(frame) => {
                    if frame.topic != self.topic || frame.origin == self.own_id {
                        continue;
                    }
                    return Some(BusFrame {
                        origin: frame.origin.to_string(),
                        payload: frame.payload,
                    });
                }
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    tracing::warn!(missed, topic = %self.topic, "bus subscription lagged, frames lost");
                    continue;
                }
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[tokio::test]
    async fn delivers_to_other_contexts() {
        let bus = BroadcastBus::new(16);
        let a = bus.attach("tab-a");
        let b = bus.attach("tab-b");

        let mut sub = b.subscribe("sync");
        a.publish("sync", payload("hello"));

        let frame = sub.recv().await.expect("frame");
        assert_eq!(frame.origin, "tab-a");
        assert_eq!(frame.payload, payload("hello"));
    }

    #[tokio::test]
    async fn never_delivers_to_own_subscribers() {
        let bus = BroadcastBus::new(16);
        let a = bus.attach("tab-a");
        let b = bus.attach("tab-b");

        let mut own_sub = a.subscribe("sync");
        a.publish("sync", payload("self"));
        b.publish("sync", payload("other"));

        // The own-origin frame is skipped; the first delivered frame is b's.
        let frame = own_sub.recv().await.expect("frame");
        assert_eq!(frame.origin, "tab-b");
        assert_eq!(frame.payload, payload("other"));
    }

    #[tokio::test]
    async fn filters_by_topic() {
        let bus = BroadcastBus::new(16);
        let a = bus.attach("tab-a");
        let b = bus.attach("tab-b");

        let mut sub = b.subscribe("sync");
        a.publish("metrics", payload("ignored"));
        a.publish("sync", payload("kept"));

        let frame = sub.recv().await.expect("frame");
        assert_eq!(frame.payload, payload("kept"));
    }

    #[tokio::test]
    async fn preserves_per_origin_order() {
        let bus = BroadcastBus::new(64);
        let a = bus.attach("tab-a");
        let b = bus.attach("tab-b");

        let mut sub = b.subscribe("sync");
        for i in 0..10u8 {
            a.publish("sync", Bytes::copy_from_slice(&[i]));
        }

        for i in 0..10u8 {
            let frame = sub.recv().await.expect("frame");
            assert_eq!(frame.payload.as_ref(), &[i]);
        }
    }

    #[tokio::test]
    async fn frames_before_subscribe_are_lost() {
        let bus = BroadcastBus::new(16);
        let a = bus.attach("tab-a");
        let b = bus.attach("tab-b");

        a.publish("sync", payload("lost"));
        let mut sub = b.subscribe("sync");
        a.publish("sync", payload("seen"));

        let frame = sub.recv().await.expect("frame");
        assert_eq!(frame.payload, payload("seen"));
    }

    #[tokio::test]
    async fn try_recv_drains_pending_frames_without_blocking() {
        let bus = BroadcastBus::new(16);
        let a = bus.attach("tab-a");
        let b = bus.attach("tab-b");
        let mut sub = b.subscribe("sync");

        assert!(sub.try_recv().is_none());

        a.publish("sync", payload("one"));
        b.publish("sync", payload("own"));
        a.publish("sync", payload("two"));

        // Own-origin frame is skipped, the rest drain in order.
        assert_eq!(sub.try_recv().expect("first").payload, payload("one"));
        assert_eq!(sub.try_recv().expect("second").payload, payload("two"));
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_is_silent() {
        let bus = BroadcastBus::new(16);
        let a = bus.attach("tab-a");
        // No subscription anywhere; must not panic or block.
        a.publish("sync", payload("void"));
    }

    #[tokio::test]
    async fn recv_returns_none_when_bus_dropped() {
        let bus = BroadcastBus::new(16);
        let a = bus.attach("tab-a");
        let b = bus.attach("tab-b");
        let mut sub = b.subscribe("sync");

        drop(bus);
        drop(a);
        drop(b);

        assert!(sub.recv().await.is_none());
    }
}
