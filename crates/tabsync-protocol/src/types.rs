use std::fmt;

use serde::{Deserialize, Serialize};

/// Bus topic all sync traffic travels on. Fixed — every context of one
/// application origin must agree on it.
pub const SYNC_TOPIC: &str = "tabsync-v1";

/// Discovery ping interval (30 seconds).
pub const PING_INTERVAL_MS: u64 = 30_000;

/// Expiry sweep interval (hourly).
pub const CLEANUP_INTERVAL_MS: u64 = 60 * 60 * 1000;

/// Maximum allowed clock drift for announce/ping timestamps (5 minutes).
pub const MAX_FUTURE_DRIFT_MS: u64 = 5 * 60 * 1000;

/// Identity of one context (tab, window, worker) — opaque, unique for the
/// context's lifetime, generated once at startup and never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextId(String);

impl ContextId {
    /// Generate a fresh id (UUID v4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ContextId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ContextId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Coarse synchronization status exposed to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    /// No sync operation in flight.
    Idle,
    /// A sync-affecting operation is being applied. Invalidations are
    /// applied synchronously on the coordinator task, so status queries
    /// (which run on the same task) can never observe this value; it
    /// exists for embedders that surface their own in-flight transitions.
    Syncing,
    /// The last sync-affecting operation failed.
    Error,
}

/// Whether a received timestamp is plausible: not too far in the future,
/// not absurdly old (1 hour).
pub fn timestamp_within_drift(timestamp: u64, now: u64) -> bool {
    if timestamp > now + MAX_FUTURE_DRIFT_MS {
        return false;
    }
    if now > timestamp && now - timestamp > 60 * 60 * 1000 {
        return false;
    }
    true
}

/// Current time as Unix milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
