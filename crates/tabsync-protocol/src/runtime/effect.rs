use crate::message::BroadcastMessage;
use crate::runtime::SyncEvent;

/// An action the state machine wants performed.
///
/// [`SyncState`] owns the decisions and returns these; the event loop owns
/// the I/O and executes them in order. Keeping the split strict makes every
/// protocol decision testable without a runtime.
///
/// [`SyncState`]: crate::runtime::state::SyncState
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEffect {
    /// Broadcast a message to the other contexts.
    Publish(BroadcastMessage),
    /// Apply an invalidation to the local query cache.
    ApplyInvalidate {
        key_selector: Vec<String>,
        options: Option<serde_json::Value>,
    },
    /// Apply a clear to the local query cache.
    ApplyClear { pattern: Option<String> },
    /// Surface an event to the application.
    Emit(SyncEvent),
}
