use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::types::ContextId;

/// The wire contract between contexts — every message kind the sync
/// protocol can broadcast, as one exhaustive sum type.
///
/// Serialized as MessagePack for the bus. The publishing context's id is
/// carried by the bus frame; discovery messages additionally carry it in
/// the payload so the registry can be maintained from the message alone.
///
/// Adding a kind here forces every dispatch point to handle it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BroadcastMessage {
    /// A context has started up and is introducing itself.
    Announce { id: ContextId, timestamp: u64 },
    /// A context is going away (best-effort; crashed contexts never send it).
    Closing { id: ContextId },
    /// Periodic liveness probe.
    Ping { id: ContextId, timestamp: u64 },
    /// Reply to a ping.
    Pong {
        id: ContextId,
        responding_to: ContextId,
    },
    /// Invalidate the cache entries matching a key selector.
    Invalidate {
        key_selector: Vec<String>,
        options: Option<serde_json::Value>,
    },
    /// Clear the cache — everything, or entries whose composite key
    /// contains `pattern`.
    Clear { pattern: Option<String> },
    /// A snapshot was imported on the sending context.
    StateImported { timestamp: u64 },
}

impl BroadcastMessage {
    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SyncError> {
        rmp_serde::to_vec(self).map_err(Into::into)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, SyncError> {
        rmp_serde::from_slice(data).map_err(Into::into)
    }

    /// Short name of the message kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            BroadcastMessage::Announce { .. } => "announce",
            BroadcastMessage::Closing { .. } => "closing",
            BroadcastMessage::Ping { .. } => "ping",
            BroadcastMessage::Pong { .. } => "pong",
            BroadcastMessage::Invalidate { .. } => "invalidate",
            BroadcastMessage::Clear { .. } => "clear",
            BroadcastMessage::StateImported { .. } => "state_imported",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_variants() -> Vec<BroadcastMessage> {
        vec![
            BroadcastMessage::Announce {
                id: ContextId::from("tab-1"),
                timestamp: 1_700_000_000_000,
            },
            BroadcastMessage::Closing {
                id: ContextId::from("tab-1"),
            },
            BroadcastMessage::Ping {
                id: ContextId::from("tab-1"),
                timestamp: 1_700_000_000_000,
            },
            BroadcastMessage::Pong {
                id: ContextId::from("tab-2"),
                responding_to: ContextId::from("tab-1"),
            },
            BroadcastMessage::Invalidate {
                key_selector: vec!["users".into(), "42".into()],
                options: Some(serde_json::json!({"exact": true})),
            },
            BroadcastMessage::Invalidate {
                key_selector: vec![],
                options: None,
            },
            BroadcastMessage::Clear {
                pattern: Some("users".into()),
            },
            BroadcastMessage::Clear { pattern: None },
            BroadcastMessage::StateImported {
                timestamp: 1_700_000_000_000,
            },
        ]
    }

    #[test]
    fn roundtrip_msgpack() {
        for msg in all_variants() {
            let bytes = msg.to_bytes().expect("serialize");
            let decoded = BroadcastMessage::from_bytes(&bytes).expect("deserialize");
            assert_eq!(msg, decoded, "roundtrip failed for {}", msg.kind());
        }
    }

    #[test]
    fn kind_names() {
        let kinds: Vec<&str> = all_variants().iter().map(|m| m.kind()).collect();
        assert!(kinds.contains(&"announce"));
        assert!(kinds.contains(&"closing"));
        assert!(kinds.contains(&"ping"));
        assert!(kinds.contains(&"pong"));
        assert!(kinds.contains(&"invalidate"));
        assert!(kinds.contains(&"clear"));
        assert!(kinds.contains(&"state_imported"));
    }

    #[test]
    fn garbage_fails_to_decode() {
        assert!(matches!(
            BroadcastMessage::from_bytes(&[0xFF, 0x00, 0x12]),
            Err(SyncError::Deserialization(_))
        ));
    }
}
