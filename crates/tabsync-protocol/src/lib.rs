//! Cache synchronization between same-origin contexts (tabs, windows,
//! workers) over [`tabsync-bus`].
//!
//! Each context runs one [`SyncCoordinator`]: it announces itself, keeps an
//! advisory roster of peers, propagates cache invalidations (applied
//! locally first, then broadcast, so a context never waits on its peers),
//! persists datasets in a tiered versioned store with read-time migrations,
//! sweeps expired records hourly, and can export or import the whole
//! synchronized state as a versioned JSON envelope.
//!
//! Delivery is at most once with no cross-context ordering, so everything
//! propagated is idempotent and commutative; convergence comes from the
//! payloads, not the transport.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tabsync_bus::BroadcastBus;
//! use tabsync_protocol::{
//!     ContextId, MemoryBackend, PersistenceStore, QueryCache, SyncCoordinator,
//! };
//!
//! struct NoopCache;
//! impl QueryCache for NoopCache {
//!     fn invalidate(&self, _: &[String], _: Option<&serde_json::Value>) {}
//!     fn clear(&self, _: Option<&str>) {}
//! }
//!
//! # async fn demo() -> Result<(), tabsync_protocol::SyncError> {
//! let bus = BroadcastBus::default();
//! let store = PersistenceStore::new(Arc::new(MemoryBackend::new()));
//! let (_online_tx, online) = tokio::sync::watch::channel(true);
//!
//! let mut channels = SyncCoordinator::new(
//!     bus.attach(ContextId::generate().to_string()),
//!     Arc::new(NoopCache),
//!     store,
//!     online,
//! )
//! .spawn();
//!
//! channels.handle.invalidate(vec!["users".into()], None).await?;
//! while let Some(event) = channels.events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! [`tabsync-bus`]: tabsync_bus

pub mod cache;
pub mod discovery;
pub mod error;
pub mod message;
pub mod runtime;
pub mod snapshot;
pub mod store;
pub mod types;

pub use cache::QueryCache;
pub use discovery::{PeerRegistry, RegistryEvent};
pub use error::SyncError;
pub use message::BroadcastMessage;
pub use runtime::{
    SyncChannels, SyncConfig, SyncCoordinator, SyncEvent, SyncHandle,
};
pub use snapshot::{
    default_datasets, export_snapshot, import_snapshot, DatasetRecord, Snapshot,
    SNAPSHOT_FORMAT_VERSION,
};
pub use store::{
    DatasetKey, MemoryBackend, PersistedRecord, PersistenceStore, SqliteBackend, StorageBackend,
    StorageStats, Tier,
};
pub use types::{ContextId, SyncStatus, SYNC_TOPIC};
