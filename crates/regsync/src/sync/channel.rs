use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::tracker::{ChannelState, ConnectionTracker};
use crate::config::SyncConfig;
use crate::model::{Entity, Table};
use crate::notify::Notifier;
use crate::protocol::Change;
use crate::store::collection::{Applied, CollectionHandle};
use crate::transport::{ChannelHandle, ChannelStatus, Transport};

/// Everything one subscription channel task needs.
pub(crate) struct ChannelContext<T: Transport, E: Entity> {
    pub(crate) transport: Arc<T>,
    pub(crate) collection: CollectionHandle<E>,
    pub(crate) tracker: Arc<ConnectionTracker>,
    pub(crate) notifier: Notifier,
    pub(crate) changes: broadcast::Sender<(Table, Change)>,
    pub(crate) open_channels: Arc<Mutex<HashMap<u64, ChannelHandle>>>,
    pub(crate) config: SyncConfig,
}

/// Drive the subscription channel for one collection.
///
/// Connects with bounded retries, then applies change events until the
/// channel goes away. There is no resubscription after a post-subscribe
/// close; recovery is a manual refresh or a remount.
pub(crate) async fn run_channel<T: Transport, E: Entity>(ctx: ChannelContext<T, E>) {
    let table = E::TABLE;

    loop {
        ctx.tracker.set_state(table, ChannelState::Connecting);
        let (event_tx, mut events) = mpsc::unbounded_channel();
        let (status_tx, mut status) = mpsc::unbounded_channel();
        let handle = ctx.transport.open_channel(table, event_tx, status_tx);
        ctx.open_channels.lock().unwrap().insert(handle.id(), handle);

        // Connecting: wait for the subscription acknowledgment.
        match status.recv().await {
            Some(ChannelStatus::Subscribed) => {
                debug!("channel for {} subscribed", table);
                ctx.tracker.mark_subscribed(table);
            }
            outcome => {
                let state = match outcome {
                    Some(ChannelStatus::TimedOut) => ChannelState::TimedOut,
                    _ => ChannelState::ChannelError,
                };
                close(&ctx, handle);
                ctx.tracker.set_state(table, state);

                let attempts = ctx.tracker.record_retry(table);
                if attempts >= ctx.config.max_retries {
                    warn!(
                        "channel for {} gave up after {} failed attempts",
                        table, attempts
                    );
                    ctx.notifier.error(format!(
                        "live updates for {} are unavailable; reload the page to reconnect",
                        table
                    ));
                    return;
                }
                debug!(
                    "channel for {} failed to connect (attempt {}), retrying",
                    table, attempts
                );
                sleep(ctx.config.retry_delay).await;
                continue;
            }
        }

        // Subscribed: apply change events until the channel drops.
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(change) => apply_change(&ctx, &change),
                    None => {
                        warn!("event stream for {} ended", table);
                        close(&ctx, handle);
                        ctx.tracker.mark_unsubscribed(table, ChannelState::Closed);
                        return;
                    }
                },
                update = status.recv() => {
                    let state = match update {
                        Some(ChannelStatus::ChannelError) => ChannelState::ChannelError,
                        Some(ChannelStatus::TimedOut) => ChannelState::TimedOut,
                        _ => ChannelState::Closed,
                    };
                    info!("channel for {} dropped ({:?})", table, state);
                    close(&ctx, handle);
                    // No automatic resubscription for a live channel that
                    // drops; the quorum flag falls and stays down.
                    ctx.tracker.mark_unsubscribed(table, state);
                    return;
                }
            }
        }
    }
}

fn apply_change<T: Transport, E: Entity>(ctx: &ChannelContext<T, E>, change: &Change) {
    let table = E::TABLE;

    match ctx.collection.apply(change) {
        Applied::Inserted => {
            ctx.notifier
                .success(format!("new {} received", table.singular()));
        }
        Applied::Updated => {
            ctx.notifier.info(format!("{} updated", table.singular()));
        }
        Applied::Removed => {
            ctx.notifier.info(format!("{} removed", table.singular()));
        }
        Applied::UnknownUpdate => {
            // Dropped rather than upserted; see the provider docs.
            debug!("dropping update for unknown {} row", table);
            return;
        }
        Applied::UnknownDelete => {
            debug!("delete for unknown {} row", table);
            return;
        }
        Applied::Undecodable => {
            warn!("undecodable change payload for {}", table);
            return;
        }
    }

    if ctx.changes.send((table, change.clone())).is_err() {
        debug!("no subscribers for applied changes");
    }
}

fn close<T: Transport, E: Entity>(ctx: &ChannelContext<T, E>, handle: ChannelHandle) {
    ctx.open_channels.lock().unwrap().remove(&handle.id());
    ctx.transport.close_channel(handle);
}
