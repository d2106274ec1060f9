use std::collections::HashMap;

use crate::types::ContextId;

/// Something the registry learned from an observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    PeerJoined(ContextId),
    PeerLeft(ContextId),
}

/// Advisory roster of peer contexts believed alive, keyed by context id
/// with the last time each was heard from.
///
/// Entries are added on announce/ping/pong and removed only on an explicit
/// closing message. A crashed peer never sends closing, so the registry can
/// hold stale entries indefinitely; callers must treat membership as a hint,
/// not a guarantee. Correctness of invalidation does not depend on it.
#[derive(Debug, Default, Clone)]
pub struct PeerRegistry {
    peers: HashMap<ContextId, u64>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `id` was heard from at `now`. Returns a join event the
    /// first time a peer is seen; refreshing a known peer returns nothing.
    pub fn observe(&mut self, id: ContextId, now: u64) -> Option<RegistryEvent> {
        match self.peers.insert(id.clone(), now) {
            None => Some(RegistryEvent::PeerJoined(id)),
            Some(_) => None,
        }
    }

    /// Drop a peer that announced it is closing. Removing an unknown peer
    /// is a no-op (its announce may have been lost).
    pub fn remove(&mut self, id: &ContextId) -> Option<RegistryEvent> {
        self.peers
            .remove(id)
            .map(|_| RegistryEvent::PeerLeft(id.clone()))
    }

    /// Known peers, sorted by id for stable iteration.
    pub fn peers(&self) -> Vec<ContextId> {
        let mut ids: Vec<ContextId> = self.peers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// When `id` was last heard from, if it is known.
    pub fn last_seen(&self, id: &ContextId) -> Option<u64> {
        self.peers.get(id).copied()
    }

    pub fn contains(&self, id: &ContextId) -> bool {
        self.peers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
