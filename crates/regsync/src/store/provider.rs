use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value as JsonValue;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::collection::{decode_rows, CollectionHandle};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::model::{AttendanceLog, Entity, Guest, Group, QrCode, Single, Student, Table};
use crate::notify::{Notification, Notifier};
use crate::protocol::Change;
use crate::sync::{run_channel, watchdog, ChannelContext, ChannelState, ConnectionStatus, ConnectionTracker};
use crate::transport::{ChannelHandle, Transport};

/// Process-wide store of the six mirrored registration collections
///
/// The provider is constructed explicitly with [`SyncProvider::mount`] and
/// passed down by handle (it clones cheaply); there is no ambient global.
/// Mounting spawns one subscription channel per table plus a connection
/// watchdog, and runs the initial bulk fetch of all collections. Unmounting
/// closes every channel and resets the collections; operations on an
/// unmounted provider fail with [`SyncError::NotMounted`].
pub struct SyncProvider<T: Transport> {
    inner: Arc<ProviderInner<T>>,
}

impl<T: Transport> Clone for SyncProvider<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct ProviderInner<T: Transport> {
    transport: Arc<T>,
    config: SyncConfig,
    students: CollectionHandle<Student>,
    guests: CollectionHandle<Guest>,
    groups: CollectionHandle<Group>,
    singles: CollectionHandle<Single>,
    qr_codes: CollectionHandle<QrCode>,
    attendance_logs: CollectionHandle<AttendanceLog>,
    notifier: Notifier,
    change_tx: broadcast::Sender<(Table, Change)>,
    tracker: Arc<ConnectionTracker>,
    open_channels: Arc<Mutex<HashMap<u64, ChannelHandle>>>,
    tasks: Mutex<JoinSet<()>>,
    mounted: AtomicBool,
}

/// Raw event stream from an ad hoc table subscription.
pub struct TableSubscription {
    table: Table,
    events: mpsc::UnboundedReceiver<Change>,
}

impl TableSubscription {
    pub fn table(&self) -> Table {
        self.table
    }

    /// Receive the next change event; `None` once the channel is gone.
    pub async fn recv(&mut self) -> Option<Change> {
        self.events.recv().await
    }
}

impl<T: Transport> SyncProvider<T> {
    /// Mount the provider: spawn the six subscription channels and the
    /// watchdog, then run the initial bulk fetch of all collections
    /// concurrently.
    pub async fn mount(transport: T, config: SyncConfig) -> Self {
        let (change_tx, _) = broadcast::channel(config.change_buffer);

        let provider = Self {
            inner: Arc::new(ProviderInner {
                transport: Arc::new(transport),
                notifier: Notifier::new(config.notification_buffer),
                config,
                students: CollectionHandle::new(),
                guests: CollectionHandle::new(),
                groups: CollectionHandle::new(),
                singles: CollectionHandle::new(),
                qr_codes: CollectionHandle::new(),
                attendance_logs: CollectionHandle::new(),
                change_tx,
                tracker: Arc::new(ConnectionTracker::new()),
                open_channels: Arc::new(Mutex::new(HashMap::new())),
                tasks: Mutex::new(JoinSet::new()),
                mounted: AtomicBool::new(true),
            }),
        };

        provider.spawn_channels();
        provider.refresh_all_collections().await;
        info!(
            "sync provider mounted, {} channels connecting",
            Table::ALL.len()
        );
        provider
    }

    fn spawn_channels(&self) {
        let mut tasks = self.inner.tasks.lock().unwrap();
        tasks.spawn(run_channel(self.channel_context(&self.inner.students)));
        tasks.spawn(run_channel(self.channel_context(&self.inner.guests)));
        tasks.spawn(run_channel(self.channel_context(&self.inner.groups)));
        tasks.spawn(run_channel(self.channel_context(&self.inner.singles)));
        tasks.spawn(run_channel(self.channel_context(&self.inner.qr_codes)));
        tasks.spawn(run_channel(
            self.channel_context(&self.inner.attendance_logs),
        ));
        tasks.spawn(watchdog(
            self.inner.tracker.clone(),
            self.inner.notifier.clone(),
            self.inner.config.connect_timeout,
        ));
    }

    fn channel_context<E: Entity>(&self, collection: &CollectionHandle<E>) -> ChannelContext<T, E> {
        ChannelContext {
            transport: self.inner.transport.clone(),
            collection: collection.clone(),
            tracker: self.inner.tracker.clone(),
            notifier: self.inner.notifier.clone(),
            changes: self.inner.change_tx.clone(),
            open_channels: self.inner.open_channels.clone(),
            config: self.inner.config.clone(),
        }
    }

    /// Registered student contestants.
    pub fn students(&self) -> CollectionHandle<Student> {
        self.inner.students.clone()
    }

    /// Non-performing attendees.
    pub fn guests(&self) -> CollectionHandle<Guest> {
        self.inner.guests.clone()
    }

    /// Group performance units.
    pub fn groups(&self) -> CollectionHandle<Group> {
        self.inner.groups.clone()
    }

    /// Single-contestant entries.
    pub fn singles(&self) -> CollectionHandle<Single> {
        self.inner.singles.clone()
    }

    /// Issued QR codes.
    pub fn qr_codes(&self) -> CollectionHandle<QrCode> {
        self.inner.qr_codes.clone()
    }

    /// Check-in scan events.
    pub fn attendance_logs(&self) -> CollectionHandle<AttendanceLog> {
        self.inner.attendance_logs.clone()
    }

    pub async fn refresh_students(&self) -> SyncResult<()> {
        self.ensure_mounted()?;
        self.refresh_collection(&self.inner.students).await;
        Ok(())
    }

    pub async fn refresh_guests(&self) -> SyncResult<()> {
        self.ensure_mounted()?;
        self.refresh_collection(&self.inner.guests).await;
        Ok(())
    }

    pub async fn refresh_groups(&self) -> SyncResult<()> {
        self.ensure_mounted()?;
        self.refresh_collection(&self.inner.groups).await;
        Ok(())
    }

    pub async fn refresh_singles(&self) -> SyncResult<()> {
        self.ensure_mounted()?;
        self.refresh_collection(&self.inner.singles).await;
        Ok(())
    }

    pub async fn refresh_qr_codes(&self) -> SyncResult<()> {
        self.ensure_mounted()?;
        self.refresh_collection(&self.inner.qr_codes).await;
        Ok(())
    }

    pub async fn refresh_attendance_logs(&self) -> SyncResult<()> {
        self.ensure_mounted()?;
        self.refresh_collection(&self.inner.attendance_logs).await;
        Ok(())
    }

    /// Re-fetch all six collections concurrently.
    pub async fn refresh_all(&self) -> SyncResult<()> {
        self.ensure_mounted()?;
        self.refresh_all_collections().await;
        Ok(())
    }

    async fn refresh_all_collections(&self) {
        tokio::join!(
            self.refresh_collection(&self.inner.students),
            self.refresh_collection(&self.inner.guests),
            self.refresh_collection(&self.inner.groups),
            self.refresh_collection(&self.inner.singles),
            self.refresh_collection(&self.inner.qr_codes),
            self.refresh_collection(&self.inner.attendance_logs),
        );
    }

    /// Fetch one table and swap the collection's contents.
    ///
    /// Failures leave the current rows untouched and surface as an error
    /// notification; overlapping refreshes are not de-duplicated (last
    /// write wins).
    async fn refresh_collection<E: Entity>(&self, collection: &CollectionHandle<E>) {
        let table = E::TABLE;
        collection.begin_refresh();

        let fetched = self
            .inner
            .transport
            .fetch_table(table)
            .await
            .map_err(SyncError::from)
            .and_then(decode_rows::<E>);

        match fetched {
            Ok(rows) => {
                // A refresh that resolves after unmount must not resurrect
                // rows into a reset collection.
                if !self.inner.mounted.load(Ordering::Acquire) {
                    debug!("discarding {} refresh that resolved after unmount", table);
                    return;
                }
                debug!("refreshed {} ({} rows)", table, rows.len());
                collection.replace(rows);
            }
            Err(e) => {
                warn!("refresh of {} failed: {}", table, e);
                self.inner
                    .notifier
                    .error(format!("failed to load {}: {}", table, e));
            }
        }
        collection.end_refresh();
    }

    /// Watch the overall connection state.
    pub fn connection(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.tracker.watch()
    }

    /// The connection state as of now.
    pub fn connection_status(&self) -> ConnectionStatus {
        self.inner.tracker.current()
    }

    /// True only while all six channels are subscribed.
    pub fn is_connected(&self) -> bool {
        self.connection_status().is_connected
    }

    /// Current lifecycle state of one table's channel.
    pub fn channel_state(&self, table: Table) -> ChannelState {
        self.inner.tracker.state(table)
    }

    /// Failed connection attempts recorded for one table's channel; resets
    /// to 0 on a successful subscribe.
    pub fn retry_count(&self, table: Table) -> u32 {
        self.inner.tracker.retry_count(table)
    }

    /// Subscribe to user-facing notifications.
    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.inner.notifier.subscribe()
    }

    /// Subscribe to every change applied to any collection.
    pub fn subscribe_to_changes(&self) -> broadcast::Receiver<(Table, Change)> {
        self.inner.change_tx.subscribe()
    }

    /// Ad hoc subscription to raw change events for one table, bypassing
    /// the built-in collections.
    pub fn subscribe_to_table(&self, table: Table) -> SyncResult<TableSubscription> {
        self.ensure_mounted()?;

        let (event_tx, events) = mpsc::unbounded_channel();
        // Ad hoc consumers get events only; lifecycle tracking stays with
        // the built-in channels.
        let (status_tx, _status_rx) = mpsc::unbounded_channel();
        let handle = self.inner.transport.open_channel(table, event_tx, status_tx);
        self.inner
            .open_channels
            .lock()
            .unwrap()
            .insert(handle.id(), handle);

        Ok(TableSubscription { table, events })
    }

    /// Current rows of `table` in their untyped row form.
    pub fn table_snapshot(&self, table: Table) -> Vec<JsonValue> {
        match table {
            Table::Students => rows_to_json(&self.inner.students.rows()),
            Table::Guests => rows_to_json(&self.inner.guests.rows()),
            Table::Groups => rows_to_json(&self.inner.groups.rows()),
            Table::Singles => rows_to_json(&self.inner.singles.rows()),
            Table::QrCodes => rows_to_json(&self.inner.qr_codes.rows()),
            Table::AttendanceLogs => rows_to_json(&self.inner.attendance_logs.rows()),
        }
    }

    /// Tear the provider down: close all channels, stop the tasks, and
    /// reset the collections. Safe to call more than once.
    pub async fn unmount(&self) {
        if !self.inner.mounted.swap(false, Ordering::AcqRel) {
            return;
        }

        let handles: Vec<ChannelHandle> = self
            .inner
            .open_channels
            .lock()
            .unwrap()
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in handles {
            self.inner.transport.close_channel(handle);
        }

        let mut tasks = std::mem::take(&mut *self.inner.tasks.lock().unwrap());
        tasks.abort_all();
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                if !e.is_cancelled() {
                    warn!("sync task error during unmount: {}", e);
                }
            }
        }

        self.inner.students.reset();
        self.inner.guests.reset();
        self.inner.groups.reset();
        self.inner.singles.reset();
        self.inner.qr_codes.reset();
        self.inner.attendance_logs.reset();
        self.inner.tracker.reset();
        info!("sync provider unmounted");
    }

    fn ensure_mounted(&self) -> SyncResult<()> {
        if self.inner.mounted.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(SyncError::NotMounted)
        }
    }
}

fn rows_to_json<E: Entity>(rows: &[E]) -> Vec<JsonValue> {
    rows.iter()
        .filter_map(|row| serde_json::to_value(row).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures;
    use crate::notify::Severity;
    use crate::transport::MemoryTransport;
    use tokio::time::{timeout, Duration};
    use tokio_test::assert_ok;

    const WAIT: Duration = Duration::from_secs(60);

    fn seeded_backend() -> MemoryTransport {
        let backend = MemoryTransport::new();
        for id in 1..=3 {
            backend.insert_record(&fixtures::student(id)).unwrap();
        }
        backend.insert_record(&fixtures::guest(1)).unwrap();
        backend.insert_record(&fixtures::group(1)).unwrap();
        backend.insert_record(&fixtures::single(1, 2)).unwrap();
        let code = fixtures::qr_code(1);
        backend.insert_record(&code).unwrap();
        backend
            .insert_record(&fixtures::attendance_log(1, code.qr_id))
            .unwrap();
        backend
    }

    async fn wait_connected(provider: &SyncProvider<MemoryTransport>) {
        let mut rx = provider.connection();
        timeout(WAIT, async {
            loop {
                if rx.borrow_and_update().is_connected {
                    break;
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .expect("provider should reach quorum connect");
    }

    async fn wait_disconnected(provider: &SyncProvider<MemoryTransport>) {
        let mut rx = provider.connection();
        timeout(WAIT, async {
            loop {
                if !rx.borrow_and_update().is_connected {
                    break;
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .expect("provider should observe the disconnect");
    }

    #[tokio::test(start_paused = true)]
    async fn mount_populates_collections_and_reaches_quorum() {
        let backend = seeded_backend();
        let provider = SyncProvider::mount(backend, SyncConfig::default()).await;

        // Initial fetch mirrors the remote contents, newest first.
        let students = provider.students();
        assert!(!students.is_loading());
        let ids: Vec<i64> = students.rows().iter().map(|s| s.student_id).collect();
        assert_eq!(ids, vec![3, 2, 1]);
        assert_eq!(provider.guests().len(), 1);
        assert_eq!(provider.groups().len(), 1);
        assert_eq!(provider.singles().len(), 1);
        assert_eq!(provider.qr_codes().len(), 1);
        assert_eq!(provider.attendance_logs().len(), 1);

        wait_connected(&provider).await;
        for table in Table::ALL {
            assert_eq!(provider.channel_state(table), ChannelState::Subscribed);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn insert_event_prepends_and_notifies() {
        let backend = seeded_backend();
        let provider = SyncProvider::mount(backend.clone(), SyncConfig::default()).await;
        wait_connected(&provider).await;

        let mut notifications = provider.notifications();
        let mut changes = provider.subscribe_to_changes();

        backend.insert_record(&fixtures::student(10)).unwrap();

        let (table, change) = timeout(WAIT, changes.recv()).await.unwrap().unwrap();
        assert_eq!(table, Table::Students);
        assert!(matches!(change, Change::Insert { .. }));

        let rows = provider.students().rows();
        assert_eq!(rows[0].student_id, 10);
        assert_eq!(rows.len(), 4);

        let toast = timeout(WAIT, notifications.recv()).await.unwrap().unwrap();
        assert_eq!(toast.severity, Severity::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn update_for_unknown_id_is_dropped_silently() {
        let backend = seeded_backend();
        let provider = SyncProvider::mount(backend.clone(), SyncConfig::default()).await;
        wait_connected(&provider).await;

        let mut changes = provider.subscribe_to_changes();

        // id 42 is not in memory; the follow-up insert doubles as a fence
        // because events on one channel are applied in order.
        backend.update_record(&fixtures::student(42)).unwrap();
        backend.insert_record(&fixtures::student(50)).unwrap();

        let (_, change) = timeout(WAIT, changes.recv()).await.unwrap().unwrap();
        assert!(matches!(change, Change::Insert { .. }));

        let students = provider.students();
        assert_eq!(students.len(), 4);
        assert!(students.get(42).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_keeps_stale_rows_and_notifies() {
        let backend = seeded_backend();
        let provider = SyncProvider::mount(backend.clone(), SyncConfig::default()).await;
        wait_connected(&provider).await;

        let mut notifications = provider.notifications();
        backend.fail_next_fetches(Table::Students, 1);

        // The refetch itself succeeds; the failure surfaces as a toast.
        assert_ok!(provider.refresh_students().await);

        let students = provider.students();
        assert_eq!(students.len(), 3);
        assert!(!students.is_loading());

        let toast = timeout(WAIT, notifications.recv()).await.unwrap().unwrap();
        assert_eq!(toast.severity, Severity::Error);
        assert!(toast.message.contains("students"));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_subscribe_errors_are_retried_to_success() {
        let backend = seeded_backend();
        backend.refuse_next_subscribes(Table::Guests, 2);

        let provider = SyncProvider::mount(backend.clone(), SyncConfig::default()).await;
        wait_connected(&provider).await;

        // Two refusals plus the successful third attempt.
        assert_eq!(backend.subscribe_attempts(Table::Guests), 3);
        assert_eq!(provider.retry_count(Table::Guests), 0);
        assert_eq!(provider.channel_state(Table::Guests), ChannelState::Subscribed);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_give_up_with_a_reload_notice() {
        let backend = seeded_backend();
        backend.refuse_next_subscribes(Table::Guests, 10);

        let provider = SyncProvider::mount(backend.clone(), SyncConfig::default()).await;
        let mut notifications = provider.notifications();

        let toast = timeout(WAIT, async {
            loop {
                let toast = notifications.recv().await.unwrap();
                if toast.severity == Severity::Error && toast.message.contains("reload") {
                    break toast;
                }
            }
        })
        .await
        .unwrap();
        assert!(toast.message.contains("guests"));

        // No further automatic attempts after the bound.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(backend.subscribe_attempts(Table::Guests), 3);
        assert_eq!(provider.retry_count(Table::Guests), 3);
        assert!(!provider.is_connected());
        assert_eq!(
            provider.channel_state(Table::Guests),
            ChannelState::ChannelError
        );
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_reports_an_unreachable_service() {
        let backend = seeded_backend();
        backend.hold_subscriptions(true);

        let provider = SyncProvider::mount(backend, SyncConfig::default()).await;
        let mut notifications = provider.notifications();

        let toast = timeout(WAIT, notifications.recv()).await.unwrap().unwrap();
        assert_eq!(toast.severity, Severity::Error);

        let status = provider.connection_status();
        assert!(!status.is_connected);
        assert!(status
            .last_error
            .unwrap()
            .contains("paused or unreachable"));
    }

    #[tokio::test(start_paused = true)]
    async fn remote_close_drops_the_quorum_without_resubscribing() {
        let backend = seeded_backend();
        let provider = SyncProvider::mount(backend.clone(), SyncConfig::default()).await;
        wait_connected(&provider).await;

        let attempts_before = backend.subscribe_attempts(Table::QrCodes);
        backend.close_channels(Table::QrCodes);
        wait_disconnected(&provider).await;

        assert_eq!(provider.channel_state(Table::QrCodes), ChannelState::Closed);

        // No recovery path from a post-subscribe close.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(backend.subscribe_attempts(Table::QrCodes), attempts_before);
        assert!(!provider.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn ad_hoc_table_subscriptions_see_raw_events() {
        let backend = seeded_backend();
        let provider = SyncProvider::mount(backend.clone(), SyncConfig::default()).await;
        wait_connected(&provider).await;

        let mut subscription = provider.subscribe_to_table(Table::Guests).unwrap();
        assert_eq!(subscription.table(), Table::Guests);

        backend.insert_record(&fixtures::guest(7)).unwrap();
        let change = timeout(WAIT, subscription.recv()).await.unwrap().unwrap();
        assert!(matches!(change, Change::Insert { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn unmount_closes_channels_and_resets_state() {
        let backend = seeded_backend();
        let provider = SyncProvider::mount(backend.clone(), SyncConfig::default()).await;
        wait_connected(&provider).await;

        provider.unmount().await;

        for table in Table::ALL {
            assert_eq!(backend.subscriber_count(table), 0);
        }
        assert!(provider.students().is_empty());
        assert!(provider.students().is_loading());
        assert!(!provider.is_connected());
        assert!(matches!(
            provider.refresh_students().await,
            Err(SyncError::NotMounted)
        ));
        assert!(matches!(
            provider.subscribe_to_table(Table::Guests),
            Err(SyncError::NotMounted)
        ));

        // A second unmount is a no-op.
        provider.unmount().await;
    }

    #[tokio::test(start_paused = true)]
    async fn table_snapshot_serializes_current_rows() {
        let backend = seeded_backend();
        let provider = SyncProvider::mount(backend, SyncConfig::default()).await;

        let rows = provider.table_snapshot(Table::Students);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["student_id"], 3);
    }
}
