use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::model::Table;
use crate::notify::Notifier;

/// Lifecycle of one subscription channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelState {
    #[default]
    Idle,
    Connecting,
    Subscribed,
    ChannelError,
    TimedOut,
    Closed,
}

/// Overall connection state exposed to consumers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionStatus {
    /// True only while every channel reports subscribed (quorum connect).
    pub is_connected: bool,
    /// The most recent connection-level error, if any.
    pub last_error: Option<String>,
}

/// Tracks per-channel states, retry counters, and the quorum connect flag
pub(crate) struct ConnectionTracker {
    subscribed: Mutex<HashSet<Table>>,
    states: DashMap<Table, ChannelState>,
    retries: DashMap<Table, u32>,
    status_tx: watch::Sender<ConnectionStatus>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::default());
        Self {
            subscribed: Mutex::new(HashSet::new()),
            states: DashMap::new(),
            retries: DashMap::new(),
            status_tx,
        }
    }

    /// Watch the overall connection state.
    pub fn watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    /// The connection state as of now.
    pub fn current(&self) -> ConnectionStatus {
        self.status_tx.borrow().clone()
    }

    pub fn state(&self, table: Table) -> ChannelState {
        self.states.get(&table).map(|s| *s).unwrap_or_default()
    }

    pub fn set_state(&self, table: Table, state: ChannelState) {
        self.states.insert(table, state);
    }

    pub fn retry_count(&self, table: Table) -> u32 {
        self.retries.get(&table).map(|n| *n).unwrap_or(0)
    }

    /// Count one failed connection attempt, returning the new total.
    pub fn record_retry(&self, table: Table) -> u32 {
        let mut count = self.retries.entry(table).or_insert(0);
        *count += 1;
        *count
    }

    /// Mark a channel subscribed; flips the quorum flag once all are in and
    /// resets the channel's retry counter.
    pub fn mark_subscribed(&self, table: Table) {
        self.set_state(table, ChannelState::Subscribed);
        self.retries.insert(table, 0);

        let all_in = {
            let mut subscribed = self.subscribed.lock().unwrap();
            subscribed.insert(table);
            subscribed.len() == Table::ALL.len()
        };
        if all_in {
            info!("all {} channels subscribed", Table::ALL.len());
            self.status_tx.send_if_modified(|status| {
                if status.is_connected {
                    false
                } else {
                    status.is_connected = true;
                    true
                }
            });
        }
    }

    /// Mark a channel gone; the quorum flag drops immediately.
    pub fn mark_unsubscribed(&self, table: Table, state: ChannelState) {
        self.set_state(table, state);
        self.subscribed.lock().unwrap().remove(&table);
        self.status_tx.send_if_modified(|status| {
            if status.is_connected {
                status.is_connected = false;
                true
            } else {
                false
            }
        });
    }

    pub fn subscribed_count(&self) -> usize {
        self.subscribed.lock().unwrap().len()
    }

    /// Record a connection-level error visible to consumers.
    pub fn record_error(&self, message: impl Into<String>) {
        let message = message.into();
        warn!("connection error: {}", message);
        self.status_tx.send_modify(|status| {
            status.is_connected = false;
            status.last_error = Some(message);
        });
    }

    /// Return to the pre-mount state.
    pub fn reset(&self) {
        self.subscribed.lock().unwrap().clear();
        self.states.clear();
        self.retries.clear();
        self.status_tx.send_modify(|status| {
            status.is_connected = false;
        });
    }
}

/// Report a connection error if no channel has subscribed within `timeout`
/// of mount. Fires at most once; per-channel retries continue regardless.
pub(crate) async fn watchdog(
    tracker: Arc<ConnectionTracker>,
    notifier: Notifier,
    timeout: Duration,
) {
    tokio::time::sleep(timeout).await;
    if tracker.subscribed_count() == 0 {
        tracker.record_error("realtime service may be paused or unreachable");
        notifier.error("could not reach the realtime service; data will not update live");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn quorum_requires_all_channels() {
        let tracker = ConnectionTracker::new();

        for table in &Table::ALL[..5] {
            tracker.mark_subscribed(*table);
            assert!(!tracker.current().is_connected);
        }

        tracker.mark_subscribed(Table::AttendanceLogs);
        assert!(tracker.current().is_connected);
    }

    #[tokio::test]
    async fn losing_one_channel_drops_the_quorum() {
        let tracker = ConnectionTracker::new();
        for table in Table::ALL {
            tracker.mark_subscribed(table);
        }
        assert!(tracker.current().is_connected);

        tracker.mark_unsubscribed(Table::Guests, ChannelState::Closed);
        assert!(!tracker.current().is_connected);
        assert_eq!(tracker.state(Table::Guests), ChannelState::Closed);
    }

    #[tokio::test]
    async fn subscribing_resets_the_retry_counter() {
        let tracker = ConnectionTracker::new();
        tracker.record_retry(Table::Guests);
        tracker.record_retry(Table::Guests);
        assert_eq!(tracker.retry_count(Table::Guests), 2);

        tracker.mark_subscribed(Table::Guests);
        assert_eq!(tracker.retry_count(Table::Guests), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_reports_when_nothing_subscribes() {
        let tracker = Arc::new(ConnectionTracker::new());
        let notifier = Notifier::new(8);
        let mut notifications = notifier.subscribe();

        tokio::spawn(watchdog(
            tracker.clone(),
            notifier,
            Duration::from_secs(10),
        ));

        let toast = notifications.recv().await.unwrap();
        assert_eq!(toast.severity, crate::notify::Severity::Error);
        let status = tracker.current();
        assert!(!status.is_connected);
        assert!(status.last_error.unwrap().contains("paused or unreachable"));
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_stays_quiet_once_a_channel_subscribed() {
        let tracker = Arc::new(ConnectionTracker::new());
        let notifier = Notifier::new(8);
        let mut notifications = notifier.subscribe();

        tracker.mark_subscribed(Table::Students);
        watchdog(tracker.clone(), notifier, Duration::from_secs(10)).await;

        assert!(notifications.try_recv().is_err());
        assert_eq!(tracker.current().last_error, None);
    }
}
