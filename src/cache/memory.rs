//! In-process cache tier: zero-I/O reads for the current session.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::remote::types::{sort_newest_first, MemoryRecord};

/// A cached value with freshness bookkeeping.
#[derive(Debug, Clone)]
struct CacheEntry<T> {
  value: T,
  refreshed_at: DateTime<Utc>,
  /// Changed locally since the last full refresh from remote
  dirty: bool,
}

impl<T> CacheEntry<T> {
  fn clean(value: T) -> Self {
    Self {
      value,
      refreshed_at: Utc::now(),
      dirty: false,
    }
  }
}

/// What the memory tier knows about the full record list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
  /// Records newest first
  pub records: Vec<MemoryRecord>,
  /// When the list was last replaced wholesale
  pub refreshed_at: DateTime<Utc>,
  /// Confirmed by the remote store (false for provisional local-store data)
  pub confirmed: bool,
  /// Locally written since the last wholesale replacement
  pub dirty: bool,
}

impl Snapshot {
  /// Fresh means confirmed by remote and younger than `stale_after`.
  pub fn is_fresh(&self, stale_after: Duration) -> bool {
    self.confirmed && Utc::now() - self.refreshed_at <= stale_after
  }
}

#[derive(Default)]
struct Inner {
  entries: HashMap<String, CacheEntry<MemoryRecord>>,
  /// Listing order; `None` until a full snapshot was loaded this session
  order: Option<CacheEntry<Vec<String>>>,
  confirmed: bool,
}

/// Memory tier. Only the orchestrator writes to it.
#[derive(Default)]
pub struct MemoryCache {
  inner: RwLock<Inner>,
}

impl MemoryCache {
  pub fn new() -> Self {
    Self::default()
  }

  // A poisoned lock only means a panic happened mid-update of plain maps;
  // the data is still structurally valid.
  fn read_lock(&self) -> RwLockReadGuard<'_, Inner> {
    self.inner.read().unwrap_or_else(|e| e.into_inner())
  }

  fn write_lock(&self) -> RwLockWriteGuard<'_, Inner> {
    self.inner.write().unwrap_or_else(|e| e.into_inner())
  }

  /// Look up a single record.
  pub fn read(&self, id: &str) -> Option<MemoryRecord> {
    self.read_lock().entries.get(id).map(|e| e.value.clone())
  }

  /// The full list, or `None` if no snapshot was loaded this session.
  ///
  /// An empty `Snapshot` means "loaded and empty", never "not loaded".
  pub fn read_all(&self) -> Option<Snapshot> {
    let inner = self.read_lock();
    let order = inner.order.as_ref()?;

    let records = order
      .value
      .iter()
      .filter_map(|id| inner.entries.get(id).map(|e| e.value.clone()))
      .collect();

    Some(Snapshot {
      records,
      refreshed_at: order.refreshed_at,
      confirmed: inner.confirmed,
      dirty: order.dirty,
    })
  }

  /// Replace everything with `records`.
  ///
  /// `confirmed` is false for provisional snapshots loaded from the local store.
  pub fn load_snapshot(&self, records: Vec<MemoryRecord>, confirmed: bool) {
    self.replace(records, confirmed, Utc::now());
  }

  /// Install a provisional snapshot read from the local store, keeping the
  /// time it was originally cached.
  pub fn load_provisional(&self, records: Vec<MemoryRecord>, cached_at: Option<DateTime<Utc>>) {
    self.replace(records, false, cached_at.unwrap_or_else(Utc::now));
  }

  fn replace(&self, mut records: Vec<MemoryRecord>, confirmed: bool, at: DateTime<Utc>) {
    sort_newest_first(&mut records);

    let mut inner = self.write_lock();
    let order = records.iter().map(|r| r.id.clone()).collect();
    inner.entries = records
      .into_iter()
      .map(|r| {
        let mut entry = CacheEntry::clean(r);
        entry.refreshed_at = at;
        (entry.value.id.clone(), entry)
      })
      .collect();
    let mut order = CacheEntry::clean(order);
    order.refreshed_at = at;
    inner.order = Some(order);
    inner.confirmed = confirmed;
  }

  /// Remember a single record read from a lower tier without touching the
  /// snapshot.
  pub fn fill(&self, record: MemoryRecord) {
    let mut inner = self.write_lock();
    inner
      .entries
      .insert(record.id.clone(), CacheEntry::clean(record));
  }

  /// Insert or replace a record, splicing it into the snapshot in sort order.
  pub fn write(&self, record: MemoryRecord) {
    let mut guard = self.write_lock();
    let inner = &mut *guard;

    if let Some(order) = inner.order.as_mut() {
      order.value.retain(|id| id != &record.id);
      // Newest first; a record goes after existing ones with the same timestamp.
      let position = order
        .value
        .iter()
        .position(|id| {
          inner
            .entries
            .get(id)
            .is_some_and(|e| e.value.created_at < record.created_at)
        })
        .unwrap_or(order.value.len());
      order.value.insert(position, record.id.clone());
      order.dirty = true;
    }

    let mut entry = CacheEntry::clean(record);
    entry.dirty = true;
    inner.entries.insert(entry.value.id.clone(), entry);
  }

  /// Keep the data but flag it as not confirmed by remote.
  pub fn mark_stale(&self) {
    self.write_lock().confirmed = false;
  }

  /// Drop a single record from the entries and the snapshot.
  pub fn invalidate(&self, id: &str) {
    let mut inner = self.write_lock();
    inner.entries.remove(id);
    if let Some(order) = inner.order.as_mut() {
      order.value.retain(|existing| existing != id);
      order.dirty = true;
    }
  }

  /// Forget everything; the next `read_all` is a miss.
  pub fn invalidate_all(&self) {
    *self.write_lock() = Inner::default();
  }

  /// True if the entry was written locally since the last full refresh.
  #[cfg(test)]
  pub(crate) fn is_dirty(&self, id: &str) -> bool {
    self
      .read_lock()
      .entries
      .get(id)
      .is_some_and(|e| e.dirty)
  }
}
