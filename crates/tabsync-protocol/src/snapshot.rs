//! Export/import of synchronized state as a versioned JSON envelope.
//!
//! The envelope carries a format version, an export timestamp, and each
//! dataset with the schema version it was exported under. Output is
//! deterministic for a given store state and timestamp, so exports diff
//! cleanly. Import validates the whole envelope before touching storage
//! and fails closed on an unknown format version.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::SyncError;
use crate::store::{DatasetKey, PersistenceStore, Tier};
use crate::types::now_ms;

/// Envelope format this build reads and writes.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// The datasets covered by export/import: query history and user
/// preferences in the durable tier, session state in the ephemeral tier.
pub fn default_datasets() -> Vec<DatasetKey> {
    vec![
        DatasetKey::new(Tier::Durable, "queryHistory", 1),
        DatasetKey::new(Tier::Durable, "userPreferences", 1),
        DatasetKey::new(Tier::Ephemeral, "sessionState", 1),
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub format_version: u32,
    /// Unix milliseconds at export time.
    pub exported_at: u64,
    /// Dataset name to exported record. BTreeMap keeps the serialized
    /// order stable.
    pub data: BTreeMap<String, DatasetRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetRecord {
    /// Schema version the payload conforms to.
    pub version: u32,
    pub payload: Value,
}

/// Export the given datasets as a JSON envelope string.
///
/// Datasets are read through the store, so payloads written by older
/// builds are migrated before export. A record written by a newer build
/// keeps its stored version in the envelope, so re-importing it cannot
/// rewrite the record to a lower version. Absent datasets are omitted.
pub async fn export_snapshot(
    store: &PersistenceStore,
    datasets: &[DatasetKey],
) -> Result<String, SyncError> {
    export_snapshot_at(store, datasets, now_ms()).await
}

pub async fn export_snapshot_at(
    store: &PersistenceStore,
    datasets: &[DatasetKey],
    now: u64,
) -> Result<String, SyncError> {
    let mut data = BTreeMap::new();
    for dataset in datasets {
        if let Some((version, payload)) = store.load_versioned_at(dataset, now).await? {
            data.insert(dataset.key.clone(), DatasetRecord { version, payload });
        }
    }
    let snapshot = Snapshot {
        format_version: SNAPSHOT_FORMAT_VERSION,
        exported_at: now,
        data,
    };
    Ok(serde_json::to_string(&snapshot)?)
}

/// Import an envelope produced by [`export_snapshot`], replacing the
/// covered datasets.
///
/// The envelope is parsed and its format version checked before any write;
/// a malformed or unsupported envelope leaves stored state untouched.
/// Records keep the version they carry and are migrated on the next read.
/// Returns the number of datasets restored.
pub async fn import_snapshot(
    store: &PersistenceStore,
    datasets: &[DatasetKey],
    raw: &str,
) -> Result<usize, SyncError> {
    import_snapshot_at(store, datasets, raw, now_ms()).await
}

pub async fn import_snapshot_at(
    store: &PersistenceStore,
    datasets: &[DatasetKey],
    raw: &str,
    now: u64,
) -> Result<usize, SyncError> {
    let snapshot: Snapshot =
        serde_json::from_str(raw).map_err(|e| SyncError::Deserialization(e.to_string()))?;
    if snapshot.format_version != SNAPSHOT_FORMAT_VERSION {
        return Err(SyncError::VersionMismatch {
            found: snapshot.format_version,
            supported: SNAPSHOT_FORMAT_VERSION,
        });
    }

    let mut restored = 0usize;
    for (name, record) in &snapshot.data {
        let Some(dataset) = datasets.iter().find(|d| &d.key == name) else {
            warn!(dataset = %name, "snapshot contains unknown dataset, skipping");
            continue;
        };
        store
            .restore(dataset.tier, &dataset.key, record.version, record.payload.clone(), now)
            .await?;
        restored += 1;
    }
    Ok(restored)
}
