use dashmap::DashMap;
use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use super::{ChannelHandle, ChannelStatus, Transport};
use crate::error::RemoteError;
use crate::model::{record_key, Entity, Table};
use crate::protocol::Change;
use crate::SyncResult;

struct Subscriber {
    handle_id: u64,
    events: mpsc::UnboundedSender<Change>,
    status: mpsc::UnboundedSender<ChannelStatus>,
}

struct MemoryInner {
    tables: DashMap<Table, Vec<JsonValue>>,
    subscribers: DashMap<Table, Vec<Subscriber>>,
    next_id: AtomicU64,
    subscribe_attempts: DashMap<Table, u64>,
    // Fault injection used by tests and demos
    fetch_failures: DashMap<Table, u32>,
    subscribe_failures: DashMap<Table, u32>,
    hold_subscriptions: AtomicBool,
}

/// In-process transport backed by plain tables
///
/// Serves two purposes: a standalone backend for demos and single-node
/// deployments, and a controllable double for exercising the failure paths
/// of the sync layer (poisoned fetches, refused or withheld subscription
/// acknowledgments, remote channel closes).
///
/// Cloning yields another handle to the same tables.
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<MemoryInner>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                tables: DashMap::new(),
                subscribers: DashMap::new(),
                next_id: AtomicU64::new(1),
                subscribe_attempts: DashMap::new(),
                fetch_failures: DashMap::new(),
                subscribe_failures: DashMap::new(),
                hold_subscriptions: AtomicBool::new(false),
            }),
        }
    }

    /// Replace the contents of `table` without emitting change events.
    pub fn seed(&self, table: Table, rows: Vec<JsonValue>) {
        self.inner.tables.insert(table, rows);
    }

    /// Insert a raw row and notify subscribers.
    pub fn insert_row(&self, table: Table, row: JsonValue) {
        self.inner
            .tables
            .entry(table)
            .or_default()
            .push(row.clone());
        self.broadcast(table, Change::Insert { record: row });
    }

    /// Rewrite the row with a matching primary key and notify subscribers.
    ///
    /// The event is emitted even when the row is unknown locally, matching a
    /// remote store that can deliver updates for rows a mirror never saw.
    pub fn update_row(&self, table: Table, row: JsonValue) {
        if let Some(key) = record_key(table, &row) {
            if let Some(mut rows) = self.inner.tables.get_mut(&table) {
                if let Some(slot) = rows
                    .iter_mut()
                    .find(|r| record_key(table, r).as_ref() == Some(&key))
                {
                    *slot = row.clone();
                }
            }
        }
        self.broadcast(table, Change::Update { record: row });
    }

    /// Remove the row with a matching primary key and notify subscribers.
    pub fn delete_row(&self, table: Table, row: JsonValue) {
        if let Some(key) = record_key(table, &row) {
            if let Some(mut rows) = self.inner.tables.get_mut(&table) {
                rows.retain(|r| record_key(table, r).as_ref() != Some(&key));
            }
        }
        self.broadcast(table, Change::Delete { record: row });
    }

    /// Typed convenience over [`insert_row`](Self::insert_row).
    pub fn insert_record<E: Entity>(&self, record: &E) -> SyncResult<()> {
        self.insert_row(E::TABLE, serde_json::to_value(record)?);
        Ok(())
    }

    /// Typed convenience over [`update_row`](Self::update_row).
    pub fn update_record<E: Entity>(&self, record: &E) -> SyncResult<()> {
        self.update_row(E::TABLE, serde_json::to_value(record)?);
        Ok(())
    }

    /// Typed convenience over [`delete_row`](Self::delete_row).
    pub fn delete_record<E: Entity>(&self, record: &E) -> SyncResult<()> {
        self.delete_row(E::TABLE, serde_json::to_value(record)?);
        Ok(())
    }

    /// Fail the next `count` fetches of `table`.
    pub fn fail_next_fetches(&self, table: Table, count: u32) {
        self.inner.fetch_failures.insert(table, count);
    }

    /// Answer the next `count` subscriptions on `table` with a channel error.
    pub fn refuse_next_subscribes(&self, table: Table, count: u32) {
        self.inner.subscribe_failures.insert(table, count);
    }

    /// While set, new subscriptions are registered but never acknowledged.
    pub fn hold_subscriptions(&self, hold: bool) {
        self.inner.hold_subscriptions.store(hold, Ordering::Release);
    }

    /// Close every open channel on `table` from the remote side.
    pub fn close_channels(&self, table: Table) {
        if let Some((_, subscribers)) = self.inner.subscribers.remove(&table) {
            for sub in subscribers {
                let _ = sub.status.send(ChannelStatus::Closed);
            }
        }
    }

    /// How many times a channel was opened on `table` over this transport's
    /// lifetime, successful or not.
    pub fn subscribe_attempts(&self, table: Table) -> u64 {
        self.inner
            .subscribe_attempts
            .get(&table)
            .map(|n| *n)
            .unwrap_or(0)
    }

    /// Number of live subscribers on `table`.
    pub fn subscriber_count(&self, table: Table) -> usize {
        self.inner
            .subscribers
            .get(&table)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    fn broadcast(&self, table: Table, change: Change) {
        if let Some(subscribers) = self.inner.subscribers.get(&table) {
            for sub in subscribers.iter() {
                if sub.events.send(change.clone()).is_err() {
                    debug!("subscriber {} for {} went away", sub.handle_id, table);
                }
            }
        }
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MemoryTransport {
    async fn fetch_table(&self, table: Table) -> Result<Vec<JsonValue>, RemoteError> {
        if let Some(mut remaining) = self.inner.fetch_failures.get_mut(&table) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(RemoteError::Query {
                    table,
                    message: "injected fetch failure".to_string(),
                });
            }
        }

        let mut rows = self
            .inner
            .tables
            .get(&table)
            .map(|rows| rows.clone())
            .unwrap_or_default();

        // order by <primary key> desc, as the remote query would
        rows.sort_by(|a, b| record_key(table, b).cmp(&record_key(table, a)));
        Ok(rows)
    }

    fn open_channel(
        &self,
        table: Table,
        events: mpsc::UnboundedSender<Change>,
        status: mpsc::UnboundedSender<ChannelStatus>,
    ) -> ChannelHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        *self.inner.subscribe_attempts.entry(table).or_insert(0) += 1;

        let refused = match self.inner.subscribe_failures.get_mut(&table) {
            Some(mut remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        };

        if refused {
            let _ = status.send(ChannelStatus::ChannelError);
            return ChannelHandle::new(table, id);
        }

        self.inner.subscribers.entry(table).or_default().push(Subscriber {
            handle_id: id,
            events,
            status: status.clone(),
        });

        if !self.inner.hold_subscriptions.load(Ordering::Acquire) {
            let _ = status.send(ChannelStatus::Subscribed);
        }

        ChannelHandle::new(table, id)
    }

    fn close_channel(&self, handle: ChannelHandle) {
        if let Some(mut subscribers) = self.inner.subscribers.get_mut(&handle.table()) {
            subscribers.retain(|sub| sub.handle_id != handle.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn subscribe(
        transport: &MemoryTransport,
        table: Table,
    ) -> (
        ChannelHandle,
        mpsc::UnboundedReceiver<Change>,
        mpsc::UnboundedReceiver<ChannelStatus>,
    ) {
        let (event_tx, events) = mpsc::unbounded_channel();
        let (status_tx, status) = mpsc::unbounded_channel();
        let handle = transport.open_channel(table, event_tx, status_tx);
        (handle, events, status)
    }

    #[tokio::test]
    async fn fetch_returns_rows_newest_first() {
        let transport = MemoryTransport::new();
        transport.seed(
            Table::Guests,
            vec![
                json!({"guest_id": 1}),
                json!({"guest_id": 3}),
                json!({"guest_id": 2}),
            ],
        );

        let rows = transport.fetch_table(Table::Guests).await.unwrap();
        let ids: Vec<i64> = rows.iter().map(|r| r["guest_id"].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn fetch_failure_injection_is_consumed() {
        let transport = MemoryTransport::new();
        transport.fail_next_fetches(Table::Students, 1);

        assert!(transport.fetch_table(Table::Students).await.is_err());
        assert!(transport.fetch_table(Table::Students).await.is_ok());
    }

    #[tokio::test]
    async fn mutations_fan_out_to_subscribers() {
        let transport = MemoryTransport::new();
        let (_handle, mut events, mut status) = subscribe(&transport, Table::Guests);

        assert_eq!(status.recv().await, Some(ChannelStatus::Subscribed));

        transport.insert_row(Table::Guests, json!({"guest_id": 7}));
        match events.recv().await.unwrap() {
            Change::Insert { record } => assert_eq!(record["guest_id"], 7),
            other => panic!("expected insert, got {:?}", other),
        }

        transport.delete_row(Table::Guests, json!({"guest_id": 7}));
        assert!(matches!(
            events.recv().await.unwrap(),
            Change::Delete { .. }
        ));
        assert!(transport.fetch_table(Table::Guests).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn refused_subscribes_report_channel_error() {
        let transport = MemoryTransport::new();
        transport.refuse_next_subscribes(Table::Guests, 1);

        let (_h1, _e1, mut status) = subscribe(&transport, Table::Guests);
        assert_eq!(status.recv().await, Some(ChannelStatus::ChannelError));
        assert_eq!(transport.subscriber_count(Table::Guests), 0);

        let (_h2, _e2, mut status) = subscribe(&transport, Table::Guests);
        assert_eq!(status.recv().await, Some(ChannelStatus::Subscribed));
        assert_eq!(transport.subscriber_count(Table::Guests), 1);
    }

    #[tokio::test]
    async fn close_channel_detaches_one_subscriber() {
        let transport = MemoryTransport::new();
        let (handle, _events, _status) = subscribe(&transport, Table::Students);
        let (_other, _e, _s) = subscribe(&transport, Table::Students);
        assert_eq!(transport.subscriber_count(Table::Students), 2);

        transport.close_channel(handle);
        assert_eq!(transport.subscriber_count(Table::Students), 1);

        // closing twice is a no-op
        transport.close_channel(handle);
        assert_eq!(transport.subscriber_count(Table::Students), 1);
    }

    #[tokio::test]
    async fn remote_close_notifies_subscribers() {
        let transport = MemoryTransport::new();
        let (_handle, _events, mut status) = subscribe(&transport, Table::QrCodes);
        assert_eq!(status.recv().await, Some(ChannelStatus::Subscribed));

        transport.close_channels(Table::QrCodes);
        assert_eq!(status.recv().await, Some(ChannelStatus::Closed));
        assert_eq!(transport.subscriber_count(Table::QrCodes), 0);
    }
}
