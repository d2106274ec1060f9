//! The coordinator runtime: one task per context that owns the protocol
//! state and performs all I/O.
//!
//! Split the way the rest of the crate is: [`state::SyncState`] decides,
//! the event loop executes. Applications talk to the task through a
//! [`SyncHandle`] and listen on the event stream from [`SyncChannels`].

pub mod effect;
pub mod state;

mod r#loop;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};

use tabsync_bus::BusHandle;

use crate::cache::QueryCache;
use crate::error::SyncError;
use crate::message::BroadcastMessage;
use crate::snapshot::default_datasets;
use crate::store::{DatasetKey, PersistenceStore, StorageStats, Tier};
use crate::types::{
    ContextId, SyncStatus, CLEANUP_INTERVAL_MS, PING_INTERVAL_MS,
};

/// Tunables for one coordinator. Defaults match production: 30 second
/// pings, hourly expiry sweeps, the standard datasets.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub ping_interval: Duration,
    pub cleanup_interval: Duration,
    /// Datasets covered by export/import.
    pub datasets: Vec<DatasetKey>,
    /// Event stream buffer. Events beyond it are dropped with a warning.
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_millis(PING_INTERVAL_MS),
            cleanup_interval: Duration::from_millis(CLEANUP_INTERVAL_MS),
            datasets: default_datasets(),
            event_capacity: 64,
        }
    }
}

/// Things the coordinator tells the application.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    PeerJoined(ContextId),
    PeerLeft(ContextId),
    /// A peer invalidated cache entries; it has already been applied here.
    RemoteInvalidate {
        key_selector: Vec<String>,
        options: Option<serde_json::Value>,
    },
    /// A peer cleared the cache; it has already been applied here.
    RemoteClear { pattern: Option<String> },
    /// A peer imported a snapshot over the shared persisted state.
    RemoteStateImported { timestamp: u64 },
    /// Persisted state changed underneath this context; it should reload.
    ReloadRequired { timestamp: u64 },
    Error { description: String },
}

pub(crate) enum SyncCommand {
    Broadcast {
        message: BroadcastMessage,
        reply: oneshot::Sender<()>,
    },
    Invalidate {
        key_selector: Vec<String>,
        options: Option<serde_json::Value>,
        reply: oneshot::Sender<()>,
    },
    Clear {
        pattern: Option<String>,
        reply: oneshot::Sender<()>,
    },
    GetPeers {
        reply: oneshot::Sender<Vec<ContextId>>,
    },
    GetStatus {
        reply: oneshot::Sender<SyncStatus>,
    },
    GetLastSyncTime {
        reply: oneshot::Sender<Option<u64>>,
    },
    GetStorageStats {
        reply: oneshot::Sender<Result<Vec<(Tier, StorageStats)>, SyncError>>,
    },
    CleanupExpired {
        reply: oneshot::Sender<Result<usize, SyncError>>,
    },
    ExportState {
        reply: oneshot::Sender<Result<String, SyncError>>,
    },
    ImportState {
        raw: String,
        reply: oneshot::Sender<Result<usize, SyncError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a running coordinator.
#[derive(Debug, Clone)]
pub struct SyncHandle {
    local_id: ContextId,
    cmd_tx: mpsc::Sender<SyncCommand>,
    online: watch::Receiver<bool>,
}

impl SyncHandle {
    /// This context's identity.
    pub fn id(&self) -> &ContextId {
        &self.local_id
    }

    /// Current value of the injected connectivity signal.
    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Broadcast a raw protocol message without touching local state. The
    /// higher-level operations below are almost always what you want; this
    /// exists for embedders extending the protocol.
    pub async fn broadcast(&self, message: BroadcastMessage) -> Result<(), SyncError> {
        self.request(|reply| SyncCommand::Broadcast { message, reply })
            .await
    }

    /// Invalidate matching entries locally and broadcast the invalidation.
    /// Returns once the local cache has been updated; remote delivery is
    /// fire-and-forget.
    pub async fn invalidate(
        &self,
        key_selector: Vec<String>,
        options: Option<serde_json::Value>,
    ) -> Result<(), SyncError> {
        self.request(|reply| SyncCommand::Invalidate {
            key_selector,
            options,
            reply,
        })
        .await
    }

    /// Clear the cache locally (optionally by pattern) and broadcast it.
    pub async fn clear(&self, pattern: Option<String>) -> Result<(), SyncError> {
        self.request(|reply| SyncCommand::Clear { pattern, reply }).await
    }

    /// Peers currently believed alive. Advisory; see [`PeerRegistry`].
    ///
    /// [`PeerRegistry`]: crate::discovery::PeerRegistry
    pub async fn peers(&self) -> Result<Vec<ContextId>, SyncError> {
        self.request(|reply| SyncCommand::GetPeers { reply }).await
    }

    pub async fn status(&self) -> Result<SyncStatus, SyncError> {
        self.request(|reply| SyncCommand::GetStatus { reply }).await
    }

    /// When a sync-affecting operation last ran on this context.
    pub async fn last_sync_time(&self) -> Result<Option<u64>, SyncError> {
        self.request(|reply| SyncCommand::GetLastSyncTime { reply })
            .await
    }

    pub async fn storage_stats(&self) -> Result<Vec<(Tier, StorageStats)>, SyncError> {
        self.request(|reply| SyncCommand::GetStorageStats { reply })
            .await?
    }

    /// Sweep both tiers for expired records now, outside the hourly timer.
    /// Returns how many records were removed.
    pub async fn cleanup_expired(&self) -> Result<usize, SyncError> {
        self.request(|reply| SyncCommand::CleanupExpired { reply })
            .await?
    }

    /// Export the configured datasets as a JSON envelope.
    pub async fn export_state(&self) -> Result<String, SyncError> {
        self.request(|reply| SyncCommand::ExportState { reply }).await?
    }

    /// Import a JSON envelope, replacing the covered datasets, and notify
    /// the other contexts. Returns the number of datasets restored.
    pub async fn import_state(&self, raw: String) -> Result<usize, SyncError> {
        self.request(|reply| SyncCommand::ImportState { raw, reply })
            .await?
    }

    /// Broadcast a goodbye and stop the coordinator task.
    pub async fn shutdown(&self) -> Result<(), SyncError> {
        self.request(|reply| SyncCommand::Shutdown { reply }).await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SyncCommand,
    ) -> Result<T, SyncError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(make(reply_tx))
            .await
            .map_err(|_| SyncError::RuntimeClosed)?;
        reply_rx.await.map_err(|_| SyncError::RuntimeClosed)
    }
}

/// What [`SyncCoordinator::spawn`] hands back: the control handle and the
/// event stream.
pub struct SyncChannels {
    pub handle: SyncHandle,
    pub events: mpsc::Receiver<SyncEvent>,
}

/// Composition root. Everything the protocol touches is injected: the bus
/// attachment (which fixes the context id), the query cache, the store,
/// and the connectivity signal.
pub struct SyncCoordinator {
    bus: BusHandle,
    cache: Arc<dyn QueryCache>,
    store: PersistenceStore,
    online: watch::Receiver<bool>,
    config: SyncConfig,
}

impl SyncCoordinator {
    pub fn new(
        bus: BusHandle,
        cache: Arc<dyn QueryCache>,
        store: PersistenceStore,
        online: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bus,
            cache,
            store,
            online,
            config: SyncConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Start the coordinator task. It announces itself immediately and
    /// runs until [`SyncHandle::shutdown`] or the last handle is dropped.
    pub fn spawn(self) -> SyncChannels {
        let local_id = ContextId::from(self.bus.context_id());
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (event_tx, event_rx) = mpsc::channel(self.config.event_capacity);

        let handle = SyncHandle {
            local_id: local_id.clone(),
            cmd_tx,
            online: self.online.clone(),
        };

        tokio::spawn(r#loop::run(
            self.bus,
            self.cache,
            self.store,
            self.config,
            state::SyncState::new(local_id),
            cmd_rx,
            event_tx,
        ));

        SyncChannels {
            handle,
            events: event_rx,
        }
    }
}
