use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use crate::error::SyncError;
use crate::store::{PersistedRecord, Tier};

/// Raw keyed record storage underneath [`PersistenceStore`].
///
/// Backends know nothing about versions, migrations or TTLs; they store and
/// return records verbatim. All policy lives in the store.
///
/// [`PersistenceStore`]: crate::store::PersistenceStore
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn get(&self, tier: Tier, key: &str) -> Result<Option<PersistedRecord>, SyncError>;

    async fn put(&self, tier: Tier, key: &str, record: PersistedRecord) -> Result<(), SyncError>;

    async fn remove(&self, tier: Tier, key: &str) -> Result<(), SyncError>;

    /// All keys currently present in a tier, in unspecified order.
    async fn keys(&self, tier: Tier) -> Result<Vec<String>, SyncError>;
}

// ── In-memory backend ───────────────────────────────────────────────────────

/// HashMap-backed storage for tests and ephemeral deployments.
///
/// Clones share the same map, so two store instances built over clones of
/// one `MemoryBackend` see each other's writes.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<std::sync::Mutex<MemoryInner>>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    records: HashMap<(Tier, String), PersistedRecord>,
    quota_bytes: Option<usize>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap the approximate payload bytes held across both tiers. Writes
    /// that would exceed the cap fail with [`SyncError::StorageQuota`].
    pub fn with_quota(quota_bytes: usize) -> Self {
        let backend = Self::new();
        backend.inner.lock().unwrap().quota_bytes = Some(quota_bytes);
        backend
    }

    fn payload_size(record: &PersistedRecord) -> usize {
        serde_json::to_string(&record.payload)
            .map(|s| s.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, tier: Tier, key: &str) -> Result<Option<PersistedRecord>, SyncError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.records.get(&(tier, key.to_string())).cloned())
    }

    async fn put(&self, tier: Tier, key: &str, record: PersistedRecord) -> Result<(), SyncError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(quota) = inner.quota_bytes {
            let incoming = Self::payload_size(&record);
            let existing: usize = inner
                .records
                .iter()
                .filter(|((_, k), _)| k != key)
                .map(|(_, r)| Self::payload_size(r))
                .sum();
            if existing + incoming > quota {
                return Err(SyncError::StorageQuota);
            }
        }
        inner.records.insert((tier, key.to_string()), record);
        Ok(())
    }

    async fn remove(&self, tier: Tier, key: &str) -> Result<(), SyncError> {
        let mut inner = self.inner.lock().unwrap();
        inner.records.remove(&(tier, key.to_string()));
        Ok(())
    }

    async fn keys(&self, tier: Tier) -> Result<Vec<String>, SyncError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .records
            .keys()
            .filter(|(t, _)| *t == tier)
            .map(|(_, k)| k.clone())
            .collect())
    }
}

// ── SQLite backend ──────────────────────────────────────────────────────────

/// SQLite-backed storage. Both tiers share one `sync_records` table keyed
/// by `(tier, key)`; payloads are stored as JSON text.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, SyncError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, SyncError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sync_records (
                tier       TEXT NOT NULL,
                key        TEXT NOT NULL,
                version    INTEGER NOT NULL,
                payload    TEXT NOT NULL,
                written_at INTEGER NOT NULL,
                ttl_ms     INTEGER,
                PRIMARY KEY (tier, key)
            )",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn tier_tag(tier: Tier) -> &'static str {
        match tier {
            Tier::Durable => "durable",
            Tier::Ephemeral => "ephemeral",
        }
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    async fn get(&self, tier: Tier, key: &str) -> Result<Option<PersistedRecord>, SyncError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT version, payload, written_at, ttl_ms
                 FROM sync_records WHERE tier = ?1 AND key = ?2",
                params![Self::tier_tag(tier), key],
                |row| {
                    Ok((
                        row.get::<_, u32>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, u64>(2)?,
                        row.get::<_, Option<u64>>(3)?,
                    ))
                },
            )
            .optional()?;

        match row {
            None => Ok(None),
            Some((version, payload, written_at, ttl_ms)) => {
                // A row whose payload no longer parses surfaces as a
                // deserialization error so callers can isolate it.
                let payload = serde_json::from_str(&payload)
                    .map_err(|e| SyncError::Deserialization(e.to_string()))?;
                Ok(Some(PersistedRecord {
                    version,
                    payload,
                    written_at,
                    ttl_ms,
                }))
            }
        }
    }

    async fn put(&self, tier: Tier, key: &str, record: PersistedRecord) -> Result<(), SyncError> {
        let payload = serde_json::to_string(&record.payload)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO sync_records (tier, key, version, payload, written_at, ttl_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (tier, key) DO UPDATE SET
                 version = excluded.version,
                 payload = excluded.payload,
                 written_at = excluded.written_at,
                 ttl_ms = excluded.ttl_ms",
            params![
                Self::tier_tag(tier),
                key,
                record.version,
                payload,
                record.written_at,
                record.ttl_ms
            ],
        )?;
        Ok(())
    }

    async fn remove(&self, tier: Tier, key: &str) -> Result<(), SyncError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM sync_records WHERE tier = ?1 AND key = ?2",
            params![Self::tier_tag(tier), key],
        )?;
        Ok(())
    }

    async fn keys(&self, tier: Tier) -> Result<Vec<String>, SyncError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT key FROM sync_records WHERE tier = ?1")?;
        let keys = stmt
            .query_map(params![Self::tier_tag(tier)], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(keys)
    }
}
