use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

use super::{ChannelHandle, ChannelStatus, Transport};
use crate::error::RemoteError;
use crate::model::{record_key, RecordKey, Table};
use crate::protocol::Change;

/// Polling fallback transport
///
/// Wraps a fetch-capable transport and synthesizes insert/update/delete
/// events by diffing successive snapshots on primary keys, for backing
/// services that expose queries but no push API.
pub struct PollingTransport<T: Transport> {
    inner: Arc<T>,
    period: Duration,
    pollers: DashMap<u64, AbortHandle>,
    next_id: AtomicU64,
}

impl<T: Transport> PollingTransport<T> {
    pub fn new(inner: T, period: Duration) -> Self {
        Self::from_arc(Arc::new(inner), period)
    }

    pub fn from_arc(inner: Arc<T>, period: Duration) -> Self {
        Self {
            inner,
            period,
            pollers: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<T: Transport> Transport for PollingTransport<T> {
    async fn fetch_table(&self, table: Table) -> Result<Vec<JsonValue>, RemoteError> {
        self.inner.fetch_table(table).await
    }

    fn open_channel(
        &self,
        table: Table,
        events: mpsc::UnboundedSender<Change>,
        status: mpsc::UnboundedSender<ChannelStatus>,
    ) -> ChannelHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let poller = tokio::spawn(poll_loop(
            self.inner.clone(),
            table,
            self.period,
            events,
            status,
        ));
        self.pollers.insert(id, poller.abort_handle());
        ChannelHandle::new(table, id)
    }

    fn close_channel(&self, handle: ChannelHandle) {
        if let Some((_, poller)) = self.pollers.remove(&handle.id()) {
            poller.abort();
        }
    }
}

async fn poll_loop<T: Transport>(
    inner: Arc<T>,
    table: Table,
    period: Duration,
    events: mpsc::UnboundedSender<Change>,
    status: mpsc::UnboundedSender<ChannelStatus>,
) {
    // The first snapshot doubles as the subscription handshake.
    let mut known = match inner.fetch_table(table).await {
        Ok(rows) => {
            let _ = status.send(ChannelStatus::Subscribed);
            index(table, rows)
        }
        Err(e) => {
            warn!("initial poll of {} failed: {}", table, e);
            let _ = status.send(ChannelStatus::ChannelError);
            return;
        }
    };

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let rows = match inner.fetch_table(table).await {
            Ok(rows) => rows,
            Err(e) => {
                // Transient; keep the channel up and try again next tick.
                debug!("poll of {} failed: {}", table, e);
                continue;
            }
        };
        let fresh = index(table, rows);

        for (key, old) in &known {
            if !fresh.contains_key(key) {
                if events
                    .send(Change::Delete {
                        record: old.clone(),
                    })
                    .is_err()
                {
                    return;
                }
            }
        }

        for (key, row) in &fresh {
            let change = match known.get(key) {
                None => Change::Insert {
                    record: row.clone(),
                },
                Some(old) if old != row => Change::Update {
                    record: row.clone(),
                },
                Some(_) => continue,
            };
            if events.send(change).is_err() {
                return;
            }
        }

        known = fresh;
    }
}

fn index(table: Table, rows: Vec<JsonValue>) -> HashMap<RecordKey, JsonValue> {
    rows.into_iter()
        .filter_map(|row| record_key(table, &row).map(|key| (key, row)))
        .collect()
}
