use tracing::{debug, warn};

use crate::discovery::{PeerRegistry, RegistryEvent};
use crate::message::BroadcastMessage;
use crate::runtime::effect::SyncEffect;
use crate::runtime::SyncEvent;
use crate::types::{timestamp_within_drift, ContextId, SyncStatus};

/// The coordinator's protocol brain. Pure: every input is explicit
/// (including the clock), every output is a list of [`SyncEffect`]s, and
/// no method performs I/O.
#[derive(Debug)]
pub struct SyncState {
    local_id: ContextId,
    registry: PeerRegistry,
    status: SyncStatus,
    last_sync_time: Option<u64>,
}

impl SyncState {
    pub fn new(local_id: ContextId) -> Self {
        Self {
            local_id,
            registry: PeerRegistry::new(),
            status: SyncStatus::Idle,
            last_sync_time: None,
        }
    }

    pub fn local_id(&self) -> &ContextId {
        &self.local_id
    }

    pub fn status(&self) -> SyncStatus {
        self.status
    }

    pub fn last_sync_time(&self) -> Option<u64> {
        self.last_sync_time
    }

    pub fn peers(&self) -> Vec<ContextId> {
        self.registry.peers()
    }

    /// Announce ourselves on startup.
    pub fn startup_effects(&self, now: u64) -> Vec<SyncEffect> {
        vec![SyncEffect::Publish(BroadcastMessage::Announce {
            id: self.local_id.clone(),
            timestamp: now,
        })]
    }

    /// Periodic liveness ping.
    pub fn tick_ping(&self, now: u64) -> Vec<SyncEffect> {
        vec![SyncEffect::Publish(BroadcastMessage::Ping {
            id: self.local_id.clone(),
            timestamp: now,
        })]
    }

    /// A frame arrived from the bus. Undecodable payloads and unknown
    /// shapes are dropped with a warning; a malformed peer must never take
    /// this context down.
    pub fn handle_frame(&mut self, origin: &str, payload: &[u8], now: u64) -> Vec<SyncEffect> {
        // The bus already excludes own frames; guard anyway.
        if origin == self.local_id.as_str() {
            return Vec::new();
        }
        let message = match BroadcastMessage::from_bytes(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(%origin, error = %e, "dropping undecodable frame");
                return Vec::new();
            }
        };
        debug!(%origin, kind = message.kind(), "received");

        match message {
            BroadcastMessage::Announce { id, timestamp } => {
                if !timestamp_within_drift(timestamp, now) {
                    warn!(%id, timestamp, now, "announce outside drift bounds, ignoring");
                    return Vec::new();
                }
                self.observe_effects(id, now)
            }
            BroadcastMessage::Ping { id, timestamp } => {
                if !timestamp_within_drift(timestamp, now) {
                    warn!(%id, timestamp, now, "ping outside drift bounds, ignoring");
                    return Vec::new();
                }
                let mut effects = self.observe_effects(id.clone(), now);
                effects.push(SyncEffect::Publish(BroadcastMessage::Pong {
                    id: self.local_id.clone(),
                    responding_to: id,
                }));
                effects
            }
            BroadcastMessage::Pong { id, .. } => self.observe_effects(id, now),
            BroadcastMessage::Closing { id } => match self.registry.remove(&id) {
                Some(RegistryEvent::PeerLeft(id)) => {
                    vec![SyncEffect::Emit(SyncEvent::PeerLeft(id))]
                }
                _ => Vec::new(),
            },
            BroadcastMessage::Invalidate {
                key_selector,
                options,
            } => {
                self.last_sync_time = Some(now);
                vec![
                    SyncEffect::ApplyInvalidate {
                        key_selector: key_selector.clone(),
                        options: options.clone(),
                    },
                    SyncEffect::Emit(SyncEvent::RemoteInvalidate {
                        key_selector,
                        options,
                    }),
                ]
            }
            BroadcastMessage::Clear { pattern } => {
                self.last_sync_time = Some(now);
                vec![
                    SyncEffect::ApplyClear {
                        pattern: pattern.clone(),
                    },
                    SyncEffect::Emit(SyncEvent::RemoteClear { pattern }),
                ]
            }
            BroadcastMessage::StateImported { timestamp } => {
                // Another context replaced the shared persisted state; this
                // one must reload to pick it up.
                vec![
                    SyncEffect::Emit(SyncEvent::RemoteStateImported { timestamp }),
                    SyncEffect::Emit(SyncEvent::ReloadRequired { timestamp }),
                ]
            }
        }
    }

    /// A local invalidation request. Applied locally first, then broadcast;
    /// the local cache never waits on delivery.
    pub fn handle_invalidate(
        &mut self,
        key_selector: Vec<String>,
        options: Option<serde_json::Value>,
        now: u64,
    ) -> Vec<SyncEffect> {
        self.last_sync_time = Some(now);
        self.status = SyncStatus::Idle;
        vec![
            SyncEffect::ApplyInvalidate {
                key_selector: key_selector.clone(),
                options: options.clone(),
            },
            SyncEffect::Publish(BroadcastMessage::Invalidate {
                key_selector,
                options,
            }),
        ]
    }

    /// A local clear request. Same local-first discipline as invalidate.
    pub fn handle_clear(&mut self, pattern: Option<String>, now: u64) -> Vec<SyncEffect> {
        self.last_sync_time = Some(now);
        self.status = SyncStatus::Idle;
        vec![
            SyncEffect::ApplyClear {
                pattern: pattern.clone(),
            },
            SyncEffect::Publish(BroadcastMessage::Clear { pattern }),
        ]
    }

    /// Best-effort goodbye on shutdown.
    pub fn handle_shutdown(&self) -> Vec<SyncEffect> {
        vec![SyncEffect::Publish(BroadcastMessage::Closing {
            id: self.local_id.clone(),
        })]
    }

    /// Note a completed sync-affecting operation.
    pub fn mark_synced(&mut self, now: u64) {
        self.status = SyncStatus::Idle;
        self.last_sync_time = Some(now);
    }

    /// Note a failed operation.
    pub fn record_error(&mut self, description: impl Into<String>) -> Vec<SyncEffect> {
        self.status = SyncStatus::Error;
        vec![SyncEffect::Emit(SyncEvent::Error {
            description: description.into(),
        })]
    }

    fn observe_effects(&mut self, id: ContextId, now: u64) -> Vec<SyncEffect> {
        match self.registry.observe(id, now) {
            Some(RegistryEvent::PeerJoined(id)) => {
                vec![SyncEffect::Emit(SyncEvent::PeerJoined(id))]
            }
            _ => Vec::new(),
        }
    }
}
