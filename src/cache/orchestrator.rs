//! Cache orchestrator: the CRUD surface that keeps memory, local store and
//! remote consistent.

use chrono::{Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::memory::MemoryCache;
use super::storage::{CacheStorage, SEED_MARKER};
use super::traits::CacheResult;
use crate::error::{Result, SyncError};
use crate::remote::types::{sort_newest_first, validate_body, MemoryPatch, MemoryRecord, NewMemory};
use crate::remote::{ListOrder, RemoteStore};
use crate::seed;

type Refresh = Shared<BoxFuture<'static, Result<Vec<MemoryRecord>>>>;

/// A write acknowledged by remote while a full refresh was in flight.
#[derive(Debug, Clone)]
enum LocalWrite {
  Upsert(MemoryRecord),
  Remove(String),
}

struct Inner<R, S> {
  remote: R,
  storage: S,
  memory: MemoryCache,
  /// How long a confirmed snapshot is served without asking remote again
  stale_after: Duration,
  inflight: Mutex<Option<Refresh>>,
  /// Writes made since the in-flight refresh was issued; replayed on top of
  /// its result so a slow listing cannot resurrect or drop them.
  writes_during_refresh: Mutex<Option<Vec<LocalWrite>>>,
  disposed: AtomicBool,
}

/// The journal's cache orchestrator.
///
/// Sits between the UI and the remote store: reads are served from memory,
/// then the local store, then remote; writes go to remote first and reach the
/// caches only after remote acknowledged them. Clones share one state.
pub struct CacheOrchestrator<R: RemoteStore, S: CacheStorage + 'static> {
  inner: Arc<Inner<R, S>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl<R: RemoteStore, S: CacheStorage + 'static> Inner<R, S> {
  fn record_write(&self, write: LocalWrite) {
    if let Some(pending) = lock(&self.writes_during_refresh).as_mut() {
      pending.push(write);
    }
  }

  /// Put a remote-acknowledged record into both cache tiers.
  fn commit(&self, record: &MemoryRecord) {
    self.memory.write(record.clone());
    self.record_write(LocalWrite::Upsert(record.clone()));
    if let Err(e) = self.storage.put(record) {
      warn!(id = %record.id, error = %e, "local store unavailable, record cached in memory only");
    }
  }

  /// Drop a remote-deleted record from both cache tiers.
  fn evict(&self, id: &str) {
    self.memory.invalidate(id);
    self.record_write(LocalWrite::Remove(id.to_string()));
    if let Err(e) = self.storage.remove::<MemoryRecord>(id) {
      warn!(id, error = %e, "local store unavailable, could not evict record");
    }
  }

  /// Install a full remote listing in both tiers.
  fn apply_refresh(&self, mut records: Vec<MemoryRecord>) -> Vec<MemoryRecord> {
    let writes = lock(&self.writes_during_refresh).take().unwrap_or_default();
    for write in writes {
      match write {
        LocalWrite::Upsert(record) => {
          records.retain(|r| r.id != record.id);
          records.push(record);
        }
        LocalWrite::Remove(id) => records.retain(|r| r.id != id),
      }
    }
    sort_newest_first(&mut records);

    if self.disposed.load(Ordering::SeqCst) {
      return records;
    }

    self.memory.load_snapshot(records.clone(), true);
    if let Err(e) = self.storage.replace_all(&records) {
      warn!(error = %e, "local store unavailable, snapshot kept in memory only");
    }
    records
  }
}

impl<R: RemoteStore, S: CacheStorage + 'static> CacheOrchestrator<R, S> {
  /// Create an orchestrator over `remote` and the local `storage`.
  pub fn new(remote: R, storage: S) -> Self {
    Self {
      inner: Arc::new(Inner {
        remote,
        storage,
        memory: MemoryCache::new(),
        stale_after: Duration::minutes(5),
        inflight: Mutex::new(None),
        writes_during_refresh: Mutex::new(None),
        disposed: AtomicBool::new(false),
      }),
    }
  }

  /// Set how long a confirmed snapshot is served without a remote refresh.
  ///
  /// Must be called before the orchestrator is cloned or shared.
  pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
    let inner = Arc::get_mut(&mut self.inner);
    debug_assert!(inner.is_some(), "with_stale_after called on a shared orchestrator");
    match inner {
      Some(inner) => inner.stale_after = stale_after,
      None => warn!("stale_after ignored: orchestrator already shared"),
    }
    self
  }

  fn ensure_active(&self) -> Result<()> {
    if self.inner.disposed.load(Ordering::SeqCst) {
      return Err(SyncError::Disposed);
    }
    Ok(())
  }

  /// Startup: seed an empty journal once, then load the list.
  pub async fn init(&self) -> CacheResult<Vec<MemoryRecord>> {
    match self.seed_if_empty().await {
      Ok(0) => {}
      Ok(n) => info!(inserted = n, "seeded example memories"),
      Err(e) => warn!(error = %e, "seeding skipped"),
    }
    self.read_all().await
  }

  /// Stop serving: drop the memory tier and any pending refresh.
  pub fn dispose(&self) {
    self.inner.disposed.store(true, Ordering::SeqCst);
    lock(&self.inner.inflight).take();
    lock(&self.inner.writes_during_refresh).take();
    self.inner.memory.invalidate_all();
    debug!("journal cache disposed");
  }

  /// Start a refresh, or join the one already in flight.
  fn refresh(&self) -> Refresh {
    let mut slot = lock(&self.inner.inflight);
    if let Some(pending) = slot.as_ref() {
      debug!("joining in-flight refresh");
      return pending.clone();
    }

    lock(&self.inner.writes_during_refresh).get_or_insert_with(Vec::new);

    let inner = Arc::clone(&self.inner);
    let refresh = async move {
      let result = inner.remote.list(ListOrder::NewestFirst).await;
      let result = match result {
        Ok(records) => {
          let records = inner.apply_refresh(records);
          info!(count = records.len(), "refreshed memories from remote");
          Ok(records)
        }
        Err(e) => {
          lock(&inner.writes_during_refresh).take();
          inner.memory.mark_stale();
          warn!(error = %e, "remote refresh failed, serving cached memories");
          Err(e)
        }
      };
      lock(&inner.inflight).take();
      result
    }
    .boxed()
    .shared();

    *slot = Some(refresh.clone());
    refresh
  }

  /// The full list, newest first. Never fails: when remote is unreachable the
  /// last known snapshot is returned with an `Offline` source.
  pub async fn read_all(&self) -> CacheResult<Vec<MemoryRecord>> {
    if let Err(e) = self.ensure_active() {
      return CacheResult::offline(Vec::new(), None, e);
    }

    let memory = &self.inner.memory;
    match memory.read_all() {
      Some(snapshot) if snapshot.is_fresh(self.inner.stale_after) => {
        debug!(count = snapshot.records.len(), "memory snapshot hit");
        return CacheResult::from_memory(snapshot.records, snapshot.refreshed_at);
      }
      Some(_) => debug!("memory snapshot stale"),
      None => match self.inner.storage.get_all::<MemoryRecord>() {
        Ok(local) if !local.entities.is_empty() => {
          debug!(count = local.entities.len(), "loaded provisional snapshot from local store");
          memory.load_provisional(local.entities, local.cached_at);
        }
        Ok(_) => debug!("local store empty"),
        Err(e) => warn!(error = %e, "local store unavailable, reading remote only"),
      },
    }

    match self.refresh().await {
      Ok(records) => CacheResult::from_network(records),
      Err(e) => match memory.read_all() {
        Some(snapshot) => CacheResult::offline(snapshot.records, Some(snapshot.refreshed_at), e),
        None => CacheResult::offline(Vec::new(), None, e),
      },
    }
  }

  /// A single record: memory, then local store, then a list refresh.
  pub async fn read(&self, id: &str) -> Result<Option<MemoryRecord>> {
    self.ensure_active()?;
    let memory = &self.inner.memory;

    if let Some(record) = memory.read(id) {
      return Ok(Some(record));
    }

    match self.inner.storage.get::<MemoryRecord>(id) {
      Ok(Some(cached)) => {
        memory.fill(cached.entity.clone());
        return Ok(Some(cached.entity));
      }
      Ok(None) => {}
      Err(e) => warn!(id, error = %e, "local store unavailable"),
    }

    let fresh = memory
      .read_all()
      .is_some_and(|s| s.is_fresh(self.inner.stale_after));
    if fresh {
      return Ok(None);
    }

    self.read_all().await;
    Ok(memory.read(id))
  }

  /// Insert a record remotely, then cache the server's version of it.
  pub async fn create(&self, memory: NewMemory) -> Result<MemoryRecord> {
    self.ensure_active()?;
    memory.validate()?;

    let record = self.inner.remote.create(&memory).await?;
    self.inner.commit(&record);
    info!(id = %record.id, author = %record.author, "created memory");
    Ok(record)
  }

  /// Upload every image, then create the record referencing them.
  ///
  /// If any upload fails nothing is created.
  pub async fn create_with_images(
    &self,
    mut memory: NewMemory,
    images: Vec<Vec<u8>>,
  ) -> Result<MemoryRecord> {
    self.ensure_active()?;
    if images.is_empty() {
      return self.create(memory).await;
    }
    if images.iter().any(Vec::is_empty) {
      return Err(SyncError::InvalidRecord("attached image is empty".to_string()));
    }

    let mut urls = Vec::with_capacity(images.len());
    for bytes in images {
      urls.push(self.inner.remote.upload_asset(bytes).await?);
    }
    memory.image_urls.extend(urls);
    self.create(memory).await
  }

  /// Update a record remotely, then cache the server's version of it.
  ///
  /// On failure the caches keep the pre-update state.
  pub async fn update(&self, id: &str, patch: MemoryPatch) -> Result<MemoryRecord> {
    self.ensure_active()?;
    if patch.is_empty() {
      return Err(SyncError::InvalidRecord("nothing to update".to_string()));
    }

    let known = match self.inner.memory.read(id) {
      Some(record) => Some(record),
      None => self
        .inner
        .storage
        .get::<MemoryRecord>(id)
        .ok()
        .flatten()
        .map(|c| c.entity),
    };
    match known {
      Some(current) => {
        let patched = patch.apply_to(&current);
        validate_body(&patched.content, &patched.image_urls)?;
      }
      None => {
        if let (Some(content), Some(images)) = (&patch.content, &patch.image_urls) {
          validate_body(content, images)?;
        }
      }
    }

    let record = self.inner.remote.update(id, &patch).await?;
    self.inner.commit(&record);
    info!(id = %record.id, "updated memory");
    Ok(record)
  }

  /// Delete a record remotely, then drop it from both cache tiers.
  ///
  /// Returns `false` if it was already gone; the caches are cleaned either way.
  pub async fn delete(&self, id: &str) -> Result<bool> {
    self.ensure_active()?;

    let existed = self.inner.remote.remove(id).await?;
    self.inner.evict(id);
    if existed {
      info!(id, "deleted memory");
    } else {
      debug!(id, "memory was already gone");
    }
    Ok(existed)
  }

  /// Insert the example records if the journal is empty and was never seeded.
  ///
  /// Returns how many records were inserted.
  pub async fn seed_if_empty(&self) -> Result<usize> {
    self.ensure_active()?;

    match self.inner.storage.marker(SEED_MARKER) {
      Ok(Some(_)) => {
        debug!("journal already seeded");
        return Ok(0);
      }
      Ok(None) => {}
      Err(e) => {
        // Without the marker a wiped journal would be re-seeded.
        warn!(error = %e, "cannot read seed marker, not seeding");
        return Ok(0);
      }
    }

    let existing = self.refresh().await?;
    if existing.is_empty() {
      let examples = seed::examples();
      let count = examples.len();
      for memory in examples {
        self.create(memory).await?;
      }
      self.mark_seeded();
      return Ok(count);
    }

    // Someone already wrote to the journal; it never needs seeding.
    self.mark_seeded();
    Ok(0)
  }

  fn mark_seeded(&self) {
    if let Err(e) = self
      .inner
      .storage
      .set_marker(SEED_MARKER, &Utc::now().to_rfc3339())
    {
      warn!(error = %e, "could not record seed marker");
    }
  }

  /// Drop the memory tier and reload from the lower tiers.
  pub async fn force_reload(&self) -> CacheResult<Vec<MemoryRecord>> {
    self.inner.memory.invalidate_all();
    self.read_all().await
  }

  /// Discard every cached copy on this device. Markers survive.
  pub fn reset_local_cache(&self) -> Result<()> {
    self.ensure_active()?;
    self.inner.memory.invalidate_all();
    self.inner.storage.clear()?;
    info!("local cache cleared");
    Ok(())
  }

  #[cfg(test)]
  pub(crate) fn memory(&self) -> &MemoryCache {
    &self.inner.memory
  }

  #[cfg(test)]
  pub(crate) fn storage(&self) -> &S {
    &self.inner.storage
  }

  #[cfg(test)]
  pub(crate) fn remote(&self) -> &R {
    &self.inner.remote
  }
}

impl<R: RemoteStore, S: CacheStorage + 'static> Clone for CacheOrchestrator<R, S> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}
