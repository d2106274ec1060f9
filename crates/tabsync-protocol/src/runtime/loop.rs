use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tabsync_bus::BusHandle;

use crate::cache::QueryCache;
use crate::runtime::effect::SyncEffect;
use crate::runtime::state::SyncState;
use crate::runtime::{SyncCommand, SyncConfig, SyncEvent};
use crate::snapshot::{export_snapshot, import_snapshot};
use crate::store::{PersistenceStore, Tier};
use crate::types::{now_ms, SYNC_TOPIC};

pub(crate) async fn run(
    bus: BusHandle,
    cache: Arc<dyn QueryCache>,
    store: PersistenceStore,
    config: SyncConfig,
    mut state: SyncState,
    mut cmd_rx: mpsc::Receiver<SyncCommand>,
    event_tx: mpsc::Sender<SyncEvent>,
) {
    let ctx = IoContext {
        bus,
        cache,
        event_tx,
    };

    // Subscribe before announcing so replies to the announce are not lost.
    let mut sub = ctx.bus.subscribe(SYNC_TOPIC);
    info!(id = %ctx.bus.context_id(), "sync coordinator starting");
    ctx.execute(state.startup_effects(now_ms()));

    let mut ping = tokio::time::interval(config.ping_interval);
    let mut cleanup = tokio::time::interval(config.cleanup_interval);
    // Both intervals fire immediately on creation; the announce already
    // covers the first ping and startup needs no sweep.
    ping.tick().await;
    cleanup.tick().await;

    loop {
        tokio::select! {
            frame = sub.recv() => match frame {
                Some(frame) => {
                    let effects = state.handle_frame(&frame.origin, &frame.payload, now_ms());
                    ctx.execute(effects);
                }
                None => {
                    warn!("bus closed, stopping coordinator");
                    break;
                }
            },
            cmd = cmd_rx.recv() => match cmd {
                Some(cmd) => {
                    if handle_command(cmd, &ctx, &store, &config, &mut state).await {
                        break;
                    }
                }
                None => {
                    // Every handle is gone; say goodbye and stop.
                    ctx.execute(state.handle_shutdown());
                    break;
                }
            },
            _ = ping.tick() => {
                ctx.execute(state.tick_ping(now_ms()));
            }
            _ = cleanup.tick() => {
                run_sweep(&ctx, &store, &mut state).await;
            }
        }
    }
    debug!(id = %ctx.bus.context_id(), "sync coordinator stopped");
}

/// Handles one command; returns true when the loop should stop.
async fn handle_command(
    cmd: SyncCommand,
    ctx: &IoContext,
    store: &PersistenceStore,
    config: &SyncConfig,
    state: &mut SyncState,
) -> bool {
    match cmd {
        SyncCommand::Broadcast { message, reply } => {
            ctx.execute(vec![SyncEffect::Publish(message)]);
            let _ = reply.send(());
        }
        SyncCommand::Invalidate {
            key_selector,
            options,
            reply,
        } => {
            let effects = state.handle_invalidate(key_selector, options, now_ms());
            ctx.execute(effects);
            let _ = reply.send(());
        }
        SyncCommand::Clear { pattern, reply } => {
            let effects = state.handle_clear(pattern, now_ms());
            ctx.execute(effects);
            let _ = reply.send(());
        }
        SyncCommand::GetPeers { reply } => {
            let _ = reply.send(state.peers());
        }
        SyncCommand::GetStatus { reply } => {
            let _ = reply.send(state.status());
        }
        SyncCommand::GetLastSyncTime { reply } => {
            let _ = reply.send(state.last_sync_time());
        }
        SyncCommand::GetStorageStats { reply } => {
            let mut stats = Vec::with_capacity(2);
            let mut result = Ok(());
            for tier in [Tier::Durable, Tier::Ephemeral] {
                match store.storage_stats(tier).await {
                    Ok(s) => stats.push((tier, s)),
                    Err(e) => {
                        result = Err(e);
                        break;
                    }
                }
            }
            let _ = reply.send(result.map(|()| stats));
        }
        SyncCommand::CleanupExpired { reply } => {
            let mut removed = 0usize;
            let mut result = Ok(());
            for tier in [Tier::Durable, Tier::Ephemeral] {
                match store.cleanup_expired(tier).await {
                    Ok(n) => removed += n,
                    Err(e) => {
                        result = Err(e);
                        break;
                    }
                }
            }
            match result {
                Ok(()) => {
                    let _ = reply.send(Ok(removed));
                }
                Err(e) => {
                    ctx.execute(state.record_error(e.to_string()));
                    let _ = reply.send(Err(e));
                }
            }
        }
        SyncCommand::ExportState { reply } => {
            let result = export_snapshot(store, &config.datasets).await;
            if let Err(e) = &result {
                ctx.execute(state.record_error(e.to_string()));
            }
            let _ = reply.send(result);
        }
        SyncCommand::ImportState { raw, reply } => {
            match import_snapshot(store, &config.datasets, &raw).await {
                Ok(restored) => {
                    let now = now_ms();
                    state.mark_synced(now);
                    ctx.execute(vec![
                        SyncEffect::Publish(crate::message::BroadcastMessage::StateImported {
                            timestamp: now,
                        }),
                        SyncEffect::Emit(SyncEvent::ReloadRequired { timestamp: now }),
                    ]);
                    let _ = reply.send(Ok(restored));
                }
                Err(e) => {
                    ctx.execute(state.record_error(e.to_string()));
                    let _ = reply.send(Err(e));
                }
            }
        }
        SyncCommand::Shutdown { reply } => {
            ctx.execute(state.handle_shutdown());
            let _ = reply.send(());
            return true;
        }
    }
    false
}

async fn run_sweep(ctx: &IoContext, store: &PersistenceStore, state: &mut SyncState) {
    for tier in [Tier::Durable, Tier::Ephemeral] {
        match store.cleanup_expired(tier).await {
            Ok(0) => {}
            Ok(removed) => info!(?tier, removed, "expiry sweep removed records"),
            Err(e) => {
                warn!(?tier, error = %e, "expiry sweep failed");
                ctx.execute(state.record_error(e.to_string()));
            }
        }
    }
}

struct IoContext {
    bus: BusHandle,
    cache: Arc<dyn QueryCache>,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl IoContext {
    /// Executes effects in order. Publishing is fire-and-forget and event
    /// delivery never blocks the loop; a full event buffer drops the event.
    fn execute(&self, effects: Vec<SyncEffect>) {
        for effect in effects {
            match effect {
                SyncEffect::Publish(message) => match message.to_bytes() {
                    Ok(bytes) => self.bus.publish(SYNC_TOPIC, Bytes::from(bytes)),
                    Err(e) => warn!(kind = message.kind(), error = %e, "failed to encode message"),
                },
                SyncEffect::ApplyInvalidate {
                    key_selector,
                    options,
                } => self.cache.invalidate(&key_selector, options.as_ref()),
                SyncEffect::ApplyClear { pattern } => self.cache.clear(pattern.as_deref()),
                SyncEffect::Emit(event) => {
                    if let Err(mpsc::error::TrySendError::Full(event)) =
                        self.event_tx.try_send(event)
                    {
                        warn!(?event, "event buffer full, dropping event");
                    }
                }
            }
        }
    }
}
