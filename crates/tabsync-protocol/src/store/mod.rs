//! Tiered, versioned persistence.
//!
//! Records carry the schema version they were written under; migrations are
//! applied lazily at read time and the migrated form is persisted back, so
//! each record is migrated at most once per schema change. Two tiers with
//! different retention: durable (seven days) and ephemeral (one day).

mod backend;
mod migration;

pub use backend::{MemoryBackend, SqliteBackend, StorageBackend};
pub use migration::{MigrationFn, MigrationRegistry};

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::types::now_ms;

/// Retention tier of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    /// Survives roughly a week. Preferences, query history.
    Durable,
    /// Survives roughly a day. Session-scoped state.
    Ephemeral,
}

/// Per-tier retention policy.
#[derive(Debug, Clone, Copy)]
pub struct TierConfig {
    /// TTL stamped on writes that do not specify one.
    pub default_ttl_ms: u64,
}

pub const DURABLE_TTL_MS: u64 = 7 * 24 * 60 * 60 * 1000;
pub const EPHEMERAL_TTL_MS: u64 = 24 * 60 * 60 * 1000;

impl TierConfig {
    fn for_tier(tier: Tier) -> Self {
        match tier {
            Tier::Durable => Self {
                default_ttl_ms: DURABLE_TTL_MS,
            },
            Tier::Ephemeral => Self {
                default_ttl_ms: EPHEMERAL_TTL_MS,
            },
        }
    }
}

/// Identity of one dataset: where it lives and what schema version the
/// running code writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetKey {
    pub tier: Tier,
    pub key: String,
    /// Schema version this build reads and writes.
    pub current_version: u32,
}

impl DatasetKey {
    pub fn new(tier: Tier, key: impl Into<String>, current_version: u32) -> Self {
        Self {
            tier,
            key: key.into(),
            current_version,
        }
    }
}

/// A stored record, exactly as the backend holds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecord {
    /// Schema version the payload was written under.
    pub version: u32,
    pub payload: Value,
    /// Unix milliseconds at write time.
    pub written_at: u64,
    /// Time-to-live from `written_at`; `None` means no expiry.
    pub ttl_ms: Option<u64>,
}

impl PersistedRecord {
    pub fn is_expired(&self, now: u64) -> bool {
        match self.ttl_ms {
            Some(ttl) => now.saturating_sub(self.written_at) > ttl,
            None => false,
        }
    }
}

/// Aggregate view of one tier's contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageStats {
    pub entry_count: usize,
    /// JSON-serialized payload bytes, summed. An estimate, not an exact
    /// on-disk figure.
    pub approximate_bytes: usize,
    /// Age of the oldest entry, if any entry exists.
    pub oldest_entry_age_ms: Option<u64>,
}

/// Versioned store over a [`StorageBackend`].
///
/// Cheap to clone; clones share the backend and the migration registry
/// snapshot taken at clone time, so register all migrations before handing
/// the store to the coordinator.
#[derive(Debug, Clone)]
pub struct PersistenceStore {
    backend: Arc<dyn StorageBackend>,
    migrations: HashMap<String, MigrationRegistry>,
}

impl std::fmt::Debug for dyn StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StorageBackend")
    }
}

impl PersistenceStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            migrations: HashMap::new(),
        }
    }

    /// Register the migration lifting `key` payloads from `from_version` to
    /// `from_version + 1`. Registering the same step twice keeps the later
    /// registration.
    pub fn register_migration<F>(&mut self, key: &str, from_version: u32, step: F)
    where
        F: Fn(Value) -> Result<Value, SyncError> + Send + Sync + 'static,
    {
        self.migrations
            .entry(key.to_string())
            .or_default()
            .register(from_version, step);
    }

    /// Write `payload` under the dataset's current version with the tier's
    /// default TTL.
    pub async fn save(&self, dataset: &DatasetKey, payload: Value) -> Result<(), SyncError> {
        self.save_with_ttl(
            dataset,
            payload,
            Some(TierConfig::for_tier(dataset.tier).default_ttl_ms),
        )
        .await
    }

    /// Write with an explicit TTL (`None` disables expiry for this record).
    pub async fn save_with_ttl(
        &self,
        dataset: &DatasetKey,
        payload: Value,
        ttl_ms: Option<u64>,
    ) -> Result<(), SyncError> {
        self.save_with_ttl_at(dataset, payload, ttl_ms, now_ms()).await
    }

    pub async fn save_with_ttl_at(
        &self,
        dataset: &DatasetKey,
        payload: Value,
        ttl_ms: Option<u64>,
        now: u64,
    ) -> Result<(), SyncError> {
        // Versions only move forward. A newer build may have written this
        // key; refuse to clobber its record with an older schema.
        if let Some(existing) = self.backend.get(dataset.tier, &dataset.key).await? {
            if existing.version > dataset.current_version {
                return Err(SyncError::VersionRegression {
                    key: dataset.key.clone(),
                    stored: existing.version,
                    attempted: dataset.current_version,
                });
            }
        }
        self.backend
            .put(
                dataset.tier,
                &dataset.key,
                PersistedRecord {
                    version: dataset.current_version,
                    payload,
                    written_at: now,
                    ttl_ms,
                },
            )
            .await
    }

    /// Read a dataset, migrating the payload up to the current version if it
    /// was written by an older build.
    ///
    /// Migration fails closed: a gap in the registered steps yields
    /// [`SyncError::MigrationMissing`], a failing step surfaces its error,
    /// and either way the stored record is left untouched. On success the
    /// migrated form is persisted back (keeping
    /// the original `written_at`, so the retention clock is unaffected) and
    /// later loads return it without re-running the chain.
    pub async fn load(&self, dataset: &DatasetKey) -> Result<Option<Value>, SyncError> {
        self.load_at(dataset, now_ms()).await
    }

    pub async fn load_at(&self, dataset: &DatasetKey, now: u64) -> Result<Option<Value>, SyncError> {
        Ok(self
            .load_versioned_at(dataset, now)
            .await?
            .map(|(_, payload)| payload))
    }

    /// Like [`load_at`], but also returns the version the payload now
    /// conforms to: `current_version` after a migration, the stored
    /// version when the record was written by a newer build.
    ///
    /// [`load_at`]: PersistenceStore::load_at
    pub(crate) async fn load_versioned_at(
        &self,
        dataset: &DatasetKey,
        now: u64,
    ) -> Result<Option<(u32, Value)>, SyncError> {
        let Some(record) = self.backend.get(dataset.tier, &dataset.key).await? else {
            return Ok(None);
        };
        if record.is_expired(now) {
            return Ok(None);
        }
        // Written by this build or a newer one: return as stored. Newer
        // records are never migrated downward.
        if record.version >= dataset.current_version {
            return Ok(Some((record.version, record.payload)));
        }

        let chain = self
            .migrations
            .get(&dataset.key)
            .cloned()
            .unwrap_or_default()
            .plan(record.version, dataset.current_version)?;

        debug!(
            key = %dataset.key,
            from = record.version,
            to = dataset.current_version,
            steps = chain.len(),
            "migrating record at read time"
        );

        let mut payload = record.payload;
        for step in &chain {
            payload = step(payload)?;
        }

        self.backend
            .put(
                dataset.tier,
                &dataset.key,
                PersistedRecord {
                    version: dataset.current_version,
                    payload: payload.clone(),
                    written_at: record.written_at,
                    ttl_ms: record.ttl_ms,
                },
            )
            .await?;

        Ok(Some((dataset.current_version, payload)))
    }

    pub async fn remove(&self, dataset: &DatasetKey) -> Result<(), SyncError> {
        self.backend.remove(dataset.tier, &dataset.key).await
    }

    /// Write a record carrying its own version, skipping the regression
    /// guard. Used when restoring a snapshot, where the carried version is
    /// authoritative and migration happens on the next read.
    pub(crate) async fn restore(
        &self,
        tier: Tier,
        key: &str,
        version: u32,
        payload: Value,
        now: u64,
    ) -> Result<(), SyncError> {
        self.backend
            .put(
                tier,
                key,
                PersistedRecord {
                    version,
                    payload,
                    written_at: now,
                    ttl_ms: Some(TierConfig::for_tier(tier).default_ttl_ms),
                },
            )
            .await
    }

    /// Remove every expired record in a tier. Returns how many were
    /// removed. A record that cannot be read or removed is logged and
    /// skipped; one bad entry never aborts the sweep.
    pub async fn cleanup_expired(&self, tier: Tier) -> Result<usize, SyncError> {
        self.cleanup_expired_at(tier, now_ms()).await
    }

    pub async fn cleanup_expired_at(&self, tier: Tier, now: u64) -> Result<usize, SyncError> {
        let keys = self.backend.keys(tier).await?;
        let mut removed = 0usize;
        for key in keys {
            let record = match self.backend.get(tier, &key).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    warn!(%key, error = %e, "skipping unreadable record during expiry sweep");
                    continue;
                }
            };
            if !record.is_expired(now) {
                continue;
            }
            match self.backend.remove(tier, &key).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    warn!(%key, error = %e, "failed to remove expired record");
                }
            }
        }
        Ok(removed)
    }

    pub async fn storage_stats(&self, tier: Tier) -> Result<StorageStats, SyncError> {
        self.storage_stats_at(tier, now_ms()).await
    }

    pub async fn storage_stats_at(&self, tier: Tier, now: u64) -> Result<StorageStats, SyncError> {
        let keys = self.backend.keys(tier).await?;
        let mut stats = StorageStats::default();
        for key in keys {
            let Some(record) = self.backend.get(tier, &key).await? else {
                continue;
            };
            stats.entry_count += 1;
            stats.approximate_bytes += serde_json::to_string(&record.payload)?.len();
            let age = now.saturating_sub(record.written_at);
            stats.oldest_entry_age_ms = Some(stats.oldest_entry_age_ms.map_or(age, |a| a.max(age)));
        }
        Ok(stats)
    }
}
