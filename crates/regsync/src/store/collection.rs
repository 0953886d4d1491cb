use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use serde_json::Value as JsonValue;
use tracing::warn;

use crate::error::SyncError;
use crate::model::{record_key, Entity};
use crate::protocol::Change;

/// Outcome of applying one change notification to a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Applied {
    Inserted,
    Updated,
    Removed,
    /// Update for an id the collection does not hold; dropped without
    /// side effects, never upserted.
    UnknownUpdate,
    /// Delete for an id the collection does not hold.
    UnknownDelete,
    /// The payload did not decode as a record of this collection.
    Undecodable,
}

/// The in-memory, eventually consistent copy of one remote table
///
/// Rows are kept in arrival order, newest first. The collection owns no
/// ordering guarantee beyond that; consumers needing a stable sort do it on
/// their own snapshot.
pub struct Collection<E: Entity> {
    rows: RwLock<Vec<E>>,
    loading: AtomicBool,
}

impl<E: Entity> Collection<E> {
    pub(crate) fn new() -> Self {
        Self {
            rows: RwLock::new(Vec::new()),
            loading: AtomicBool::new(true),
        }
    }

    /// Snapshot of the current rows.
    pub fn rows(&self) -> Vec<E> {
        self.rows.read().unwrap().clone()
    }

    /// True until the first fetch (or an in-flight refresh) completes.
    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.rows.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().unwrap().is_empty()
    }

    /// Find a row by its identifier.
    pub fn get(&self, id: E::Id) -> Option<E> {
        self.rows
            .read()
            .unwrap()
            .iter()
            .find(|row| row.id() == id)
            .cloned()
    }

    pub(crate) fn begin_refresh(&self) {
        self.loading.store(true, Ordering::Release);
    }

    pub(crate) fn end_refresh(&self) {
        self.loading.store(false, Ordering::Release);
    }

    /// Replace the whole collection with freshly fetched rows.
    pub(crate) fn replace(&self, fresh: Vec<E>) {
        *self.rows.write().unwrap() = fresh;
    }

    /// Reset to the pre-mount state.
    pub(crate) fn reset(&self) {
        self.rows.write().unwrap().clear();
        self.loading.store(true, Ordering::Release);
    }

    /// Apply one change notification delivered for this collection's table.
    pub(crate) fn apply(&self, change: &Change) -> Applied {
        match change {
            Change::Insert { record } => match decode::<E>(record) {
                Some(row) => {
                    self.rows.write().unwrap().insert(0, row);
                    Applied::Inserted
                }
                None => Applied::Undecodable,
            },
            Change::Update { record } => match decode::<E>(record) {
                Some(row) => {
                    let mut rows = self.rows.write().unwrap();
                    match rows.iter_mut().find(|r| r.id() == row.id()) {
                        Some(slot) => {
                            *slot = row;
                            Applied::Updated
                        }
                        None => Applied::UnknownUpdate,
                    }
                }
                None => Applied::Undecodable,
            },
            // Delete payloads may carry only the primary key, so match on
            // the untyped key instead of decoding the full record.
            Change::Delete { record } => match record_key(E::TABLE, record) {
                Some(key) => {
                    let mut rows = self.rows.write().unwrap();
                    let before = rows.len();
                    rows.retain(|row| row.key() != key);
                    if rows.len() < before {
                        Applied::Removed
                    } else {
                        Applied::UnknownDelete
                    }
                }
                None => Applied::Undecodable,
            },
        }
    }
}

/// A cloneable handle to one collection
pub struct CollectionHandle<E: Entity> {
    inner: Arc<Collection<E>>,
}

impl<E: Entity> Clone for CollectionHandle<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: Entity> CollectionHandle<E> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Collection::new()),
        }
    }

    /// Snapshot of the current rows.
    pub fn rows(&self) -> Vec<E> {
        self.inner.rows()
    }

    /// True until the first fetch (or an in-flight refresh) completes.
    pub fn is_loading(&self) -> bool {
        self.inner.is_loading()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Find a row by its identifier.
    pub fn get(&self, id: E::Id) -> Option<E> {
        self.inner.get(id)
    }

    pub(crate) fn begin_refresh(&self) {
        self.inner.begin_refresh()
    }

    pub(crate) fn end_refresh(&self) {
        self.inner.end_refresh()
    }

    pub(crate) fn replace(&self, fresh: Vec<E>) {
        self.inner.replace(fresh)
    }

    pub(crate) fn reset(&self) {
        self.inner.reset()
    }

    pub(crate) fn apply(&self, change: &Change) -> Applied {
        self.inner.apply(change)
    }
}

fn decode<E: Entity>(record: &JsonValue) -> Option<E> {
    match serde_json::from_value(record.clone()) {
        Ok(row) => Some(row),
        Err(e) => {
            warn!("undecodable {} change payload: {}", E::TABLE, e);
            None
        }
    }
}

/// Decode a fetched row set into typed records, failing on the first bad row.
pub(crate) fn decode_rows<E: Entity>(rows: Vec<JsonValue>) -> Result<Vec<E>, SyncError> {
    rows.into_iter()
        .map(|row| {
            serde_json::from_value(row).map_err(|e| SyncError::Decode {
                table: E::TABLE,
                source: e,
            })
        })
        .collect()
}
