use serde_json::Value;

/// The application-side query cache the coordinator drives.
///
/// Implementations must make both operations idempotent and commutative:
/// the same invalidation applied twice, or two invalidations applied in
/// either order, must leave the cache in the same state. The protocol
/// delivers at most once but gives no cross-context ordering, so these
/// properties are what make convergence possible.
///
/// Both calls must be cheap and non-blocking; they run on the coordinator's
/// event loop.
pub trait QueryCache: Send + Sync {
    /// Drop cached entries matching `key_selector` (a structured key prefix
    /// unless `options` narrows it, e.g. `{"exact": true}`).
    fn invalidate(&self, key_selector: &[String], options: Option<&Value>);

    /// Drop everything, or only entries whose composite key contains
    /// `pattern` when one is given.
    fn clear(&self, pattern: Option<&str>);
}
