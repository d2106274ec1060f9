/// Protocol-level errors for tabsync.
///
/// Persistence and serializer errors propagate to the direct caller; the
/// bus and discovery are fire-and-forget and never surface delivery
/// failures (a lost message produces no error, by contract).
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("missing migration step from version {from_version} (current {current_version})")]
    MigrationMissing { from_version: u32, current_version: u32 },

    #[error("unsupported snapshot format version {found} (supported {supported})")]
    VersionMismatch { found: u32, supported: u32 },

    #[error("storage quota exceeded")]
    StorageQuota,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("version regression for key {key}: stored {stored}, attempted {attempted}")]
    VersionRegression {
        key: String,
        stored: u32,
        attempted: u32,
    },

    #[error("sync runtime shut down")]
    RuntimeClosed,
}

impl From<rmp_serde::encode::Error> for SyncError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for SyncError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        SyncError::Deserialization(e.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DiskFull) => SyncError::StorageQuota,
            _ => SyncError::Storage(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_migration_missing() {
        let err = SyncError::MigrationMissing {
            from_version: 2,
            current_version: 4,
        };
        assert_eq!(
            err.to_string(),
            "missing migration step from version 2 (current 4)"
        );
    }

    #[test]
    fn display_version_mismatch() {
        let err = SyncError::VersionMismatch {
            found: 9,
            supported: 1,
        };
        assert_eq!(
            err.to_string(),
            "unsupported snapshot format version 9 (supported 1)"
        );
    }

    #[test]
    fn display_version_regression() {
        let err = SyncError::VersionRegression {
            key: "queryHistory".into(),
            stored: 3,
            attempted: 1,
        };
        assert_eq!(
            err.to_string(),
            "version regression for key queryHistory: stored 3, attempted 1"
        );
    }

    #[test]
    fn json_error_maps_to_serialization() {
        let bad: Result<serde_json::Value, _> = serde_json::from_str("{nope");
        let err: SyncError = bad.unwrap_err().into();
        assert!(matches!(err, SyncError::Serialization(_)));
    }
}
