//! End-to-end tests: two coordinators on one bus, shared storage.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use tabsync_bus::BroadcastBus;
use tabsync_protocol::{
    ContextId, DatasetKey, MemoryBackend, PersistenceStore, QueryCache, SyncChannels, SyncConfig,
    SyncCoordinator, SyncEvent, Tier,
};

#[derive(Default)]
struct RecordingCache {
    invalidations: Mutex<Vec<(Vec<String>, Option<Value>)>>,
    clears: Mutex<Vec<Option<String>>>,
}

impl RecordingCache {
    fn invalidation_count(&self) -> usize {
        self.invalidations.lock().unwrap().len()
    }
}

impl QueryCache for RecordingCache {
    fn invalidate(&self, key_selector: &[String], options: Option<&Value>) {
        self.invalidations
            .lock()
            .unwrap()
            .push((key_selector.to_vec(), options.cloned()));
    }

    fn clear(&self, pattern: Option<&str>) {
        self.clears.lock().unwrap().push(pattern.map(String::from));
    }
}

struct TestContext {
    channels: SyncChannels,
    cache: Arc<RecordingCache>,
}

fn fast_config() -> SyncConfig {
    SyncConfig {
        ping_interval: Duration::from_millis(50),
        cleanup_interval: Duration::from_secs(3_600),
        ..SyncConfig::default()
    }
}

fn spawn_context(bus: &BroadcastBus, id: &str, backend: &MemoryBackend) -> TestContext {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let cache = Arc::new(RecordingCache::default());
    let store = PersistenceStore::new(Arc::new(backend.clone()));
    let (_online_tx, online) = watch::channel(true);
    let channels = SyncCoordinator::new(bus.attach(id), cache.clone(), store, online)
        .with_config(fast_config())
        .spawn();
    TestContext { channels, cache }
}

async fn wait_for<F>(events: &mut mpsc::Receiver<SyncEvent>, mut pred: F) -> SyncEvent
where
    F: FnMut(&SyncEvent) -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event stream ended");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn invalidation_reaches_peer_and_skips_origin() {
    let bus = BroadcastBus::new(64);
    let backend = MemoryBackend::new();
    let mut a = spawn_context(&bus, "tab-a", &backend);
    let mut b = spawn_context(&bus, "tab-b", &backend);

    // Once a has seen b's announce, b is subscribed and will not miss
    // anything a publishes.
    wait_for(&mut a.channels.events, |e| {
        matches!(e, SyncEvent::PeerJoined(id) if id.as_str() == "tab-b")
    })
    .await;

    a.channels
        .handle
        .invalidate(vec!["users".into(), "42".into()], Some(json!({"exact": true})))
        .await
        .unwrap();

    let event = wait_for(&mut b.channels.events, |e| {
        matches!(e, SyncEvent::RemoteInvalidate { .. })
    })
    .await;
    assert_eq!(
        event,
        SyncEvent::RemoteInvalidate {
            key_selector: vec!["users".into(), "42".into()],
            options: Some(json!({"exact": true})),
        }
    );

    // Applied on b, applied exactly once on a (locally), never echoed
    // back to a.
    assert_eq!(b.cache.invalidation_count(), 1);
    assert_eq!(a.cache.invalidation_count(), 1);
    assert!(a.channels.handle.last_sync_time().await.unwrap().is_some());
    assert!(b.channels.handle.last_sync_time().await.unwrap().is_some());
}

#[tokio::test]
async fn discovery_converges_through_pings() {
    let bus = BroadcastBus::new(64);
    let backend = MemoryBackend::new();
    let mut a = spawn_context(&bus, "tab-a", &backend);
    let mut b = spawn_context(&bus, "tab-b", &backend);

    // a sees b's announce; b sees a through its periodic ping (a's announce
    // may predate b's subscription).
    wait_for(&mut a.channels.events, |e| {
        matches!(e, SyncEvent::PeerJoined(id) if id.as_str() == "tab-b")
    })
    .await;
    wait_for(&mut b.channels.events, |e| {
        matches!(e, SyncEvent::PeerJoined(id) if id.as_str() == "tab-a")
    })
    .await;

    assert_eq!(
        a.channels.handle.peers().await.unwrap(),
        vec![ContextId::from("tab-b")]
    );
    assert_eq!(
        b.channels.handle.peers().await.unwrap(),
        vec![ContextId::from("tab-a")]
    );
}

#[tokio::test]
async fn shutdown_announces_departure() {
    let bus = BroadcastBus::new(64);
    let backend = MemoryBackend::new();
    let mut a = spawn_context(&bus, "tab-a", &backend);
    let b = spawn_context(&bus, "tab-b", &backend);

    wait_for(&mut a.channels.events, |e| {
        matches!(e, SyncEvent::PeerJoined(id) if id.as_str() == "tab-b")
    })
    .await;

    b.channels.handle.shutdown().await.unwrap();

    wait_for(&mut a.channels.events, |e| {
        matches!(e, SyncEvent::PeerLeft(id) if id.as_str() == "tab-b")
    })
    .await;
    assert!(a.channels.handle.peers().await.unwrap().is_empty());

    // The stopped coordinator rejects further commands.
    assert!(b.channels.handle.peers().await.is_err());
}

#[tokio::test]
async fn clear_with_pattern_propagates() {
    let bus = BroadcastBus::new(64);
    let backend = MemoryBackend::new();
    let mut a = spawn_context(&bus, "tab-a", &backend);
    let mut b = spawn_context(&bus, "tab-b", &backend);

    wait_for(&mut a.channels.events, |e| {
        matches!(e, SyncEvent::PeerJoined(id) if id.as_str() == "tab-b")
    })
    .await;

    a.channels.handle.clear(Some("users".into())).await.unwrap();

    let event = wait_for(&mut b.channels.events, |e| {
        matches!(e, SyncEvent::RemoteClear { .. })
    })
    .await;
    assert_eq!(
        event,
        SyncEvent::RemoteClear {
            pattern: Some("users".into()),
        }
    );
    assert_eq!(
        b.cache.clears.lock().unwrap().as_slice(),
        &[Some("users".to_string())]
    );
    assert_eq!(
        a.cache.clears.lock().unwrap().as_slice(),
        &[Some("users".to_string())]
    );
}

#[tokio::test]
async fn manual_cleanup_sweeps_both_tiers() {
    let bus = BroadcastBus::new(64);
    let backend = MemoryBackend::new();
    let store = PersistenceStore::new(Arc::new(backend.clone()));

    // One expired record per tier, one live record.
    store
        .save_with_ttl_at(
            &DatasetKey::new(Tier::Ephemeral, "sessionState", 1),
            json!("stale"),
            Some(10),
            0,
        )
        .await
        .unwrap();
    store
        .save_with_ttl_at(
            &DatasetKey::new(Tier::Durable, "queryHistory", 1),
            json!("stale"),
            Some(10),
            0,
        )
        .await
        .unwrap();
    store
        .save(
            &DatasetKey::new(Tier::Durable, "userPreferences", 1),
            json!("fresh"),
        )
        .await
        .unwrap();

    let a = spawn_context(&bus, "tab-a", &backend);
    let removed = a.channels.handle.cleanup_expired().await.unwrap();
    assert_eq!(removed, 2);

    let stats = a.channels.handle.storage_stats().await.unwrap();
    let durable = stats
        .iter()
        .find(|(tier, _)| *tier == Tier::Durable)
        .map(|(_, s)| s.clone())
        .unwrap();
    assert_eq!(durable.entry_count, 1);
}

#[tokio::test]
async fn peer_caches_converge_when_invalidating_concurrently() {
    let bus = BroadcastBus::new(64);
    let backend = MemoryBackend::new();
    let mut a = spawn_context(&bus, "tab-a", &backend);
    let mut b = spawn_context(&bus, "tab-b", &backend);

    wait_for(&mut a.channels.events, |e| {
        matches!(e, SyncEvent::PeerJoined(id) if id.as_str() == "tab-b")
    })
    .await;
    wait_for(&mut b.channels.events, |e| {
        matches!(e, SyncEvent::PeerJoined(id) if id.as_str() == "tab-a")
    })
    .await;

    // Both sides invalidate different keys at the same time.
    let (ra, rb) = tokio::join!(
        a.channels.handle.invalidate(vec!["users".into()], None),
        b.channels.handle.invalidate(vec!["orders".into()], None),
    );
    ra.unwrap();
    rb.unwrap();

    wait_for(&mut a.channels.events, |e| {
        matches!(e, SyncEvent::RemoteInvalidate { key_selector, .. } if key_selector == &["orders".to_string()])
    })
    .await;
    wait_for(&mut b.channels.events, |e| {
        matches!(e, SyncEvent::RemoteInvalidate { key_selector, .. } if key_selector == &["users".to_string()])
    })
    .await;

    // Each cache saw both invalidations, in some order.
    let keys = |cache: &RecordingCache| {
        let mut ks: Vec<Vec<String>> = cache
            .invalidations
            .lock()
            .unwrap()
            .iter()
            .map(|(k, _)| k.clone())
            .collect();
        ks.sort();
        ks
    };
    let expected = vec![vec!["orders".to_string()], vec!["users".to_string()]];
    assert_eq!(keys(&a.cache), expected);
    assert_eq!(keys(&b.cache), expected);
}
