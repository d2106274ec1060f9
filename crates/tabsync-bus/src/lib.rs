//! tabsync broadcast bus.
//!
//! Same-origin, fire-and-forget publish/subscribe channel between the
//! contexts (tabs, windows, workers) of one application instance. This is
//! the transport seam of the sync stack: `tabsync-protocol` builds peer
//! discovery and invalidation propagation on top of it.
//!
//! Delivery semantics:
//! - `publish` is non-blocking and never fails; delivery is asynchronous.
//! - A frame is delivered to every *other* subscribed context only — the
//!   publisher's own subscriptions never see it.
//! - Frames from one origin arrive in publish order; frames from different
//!   origins may interleave arbitrarily.
//! - At-most-once: a frame published while a context is not subscribed
//!   (or while its subscription lags) is lost permanently.
//!
//! # Quick start
//!
//! ```rust
//! use tabsync_bus::BroadcastBus;
//! use bytes::Bytes;
//!
//! # async fn example() {
//! let bus = BroadcastBus::new(64);
//! let tab_1 = bus.attach("tab-1");
//! let tab_2 = bus.attach("tab-2");
//!
//! let mut sub = tab_2.subscribe("cache-sync");
//! tab_1.publish("cache-sync", Bytes::from_static(b"hello"));
//!
//! let frame = sub.recv().await.unwrap();
//! assert_eq!(frame.origin, "tab-1");
//! # }
//! ```

mod bus;

pub use bus::{BroadcastBus, BusFrame, BusHandle, BusSubscription};
