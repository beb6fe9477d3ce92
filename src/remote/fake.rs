//! In-process remote store for tests: records calls and can be told to fail
//! or to stall.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::types::{sort_newest_first, MemoryPatch, MemoryRecord, NewMemory};
use super::{ListOrder, RemoteStore};
use crate::error::{Result, SyncError};

#[derive(Default)]
pub(crate) struct FakeRemote {
  rows: Mutex<Vec<MemoryRecord>>,
  next_id: AtomicUsize,
  clock: AtomicI64,
  pub fail_reads: AtomicBool,
  pub fail_writes: AtomicBool,
  pub fail_uploads: AtomicBool,
  list_delay: Mutex<Option<Duration>>,
  pub creates: AtomicUsize,
  pub updates: AtomicUsize,
  pub removes: AtomicUsize,
  pub lists: AtomicUsize,
  pub uploads: AtomicUsize,
}

impl FakeRemote {
  pub fn new() -> Self {
    Self {
      clock: AtomicI64::new(1_000),
      ..Self::default()
    }
  }

  /// Preload rows as if another client had written them.
  pub fn with_rows(rows: Vec<MemoryRecord>) -> Self {
    let fake = Self::new();
    *fake.rows.lock().unwrap() = rows;
    fake
  }

  pub fn set_list_delay(&self, delay: Duration) {
    *self.list_delay.lock().unwrap() = Some(delay);
  }

  pub fn rows(&self) -> Vec<MemoryRecord> {
    self.rows.lock().unwrap().clone()
  }

  /// Delete a row behind the client's back (the other device did it).
  pub fn delete_behind(&self, id: &str) {
    self.rows.lock().unwrap().retain(|r| r.id != id);
  }

  pub fn count(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
  }

  fn write_guard(&self) -> Result<()> {
    if self.fail_writes.load(Ordering::SeqCst) {
      return Err(SyncError::RemoteWriteFailed("connection reset".to_string()));
    }
    Ok(())
  }
}

#[async_trait]
impl RemoteStore for FakeRemote {
  async fn create(&self, memory: &NewMemory) -> Result<MemoryRecord> {
    self.creates.fetch_add(1, Ordering::SeqCst);
    self.write_guard()?;

    let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
    let record = MemoryRecord {
      id: format!("srv-{}", id),
      content: memory.content.clone(),
      created_at: memory
        .created_at
        .unwrap_or_else(|| self.clock.fetch_add(1, Ordering::SeqCst)),
      author: memory.author,
      image_urls: memory.image_urls.clone(),
      tags: memory.tags.clone(),
    };
    self.rows.lock().unwrap().push(record.clone());
    Ok(record)
  }

  async fn update(&self, id: &str, patch: &MemoryPatch) -> Result<MemoryRecord> {
    self.updates.fetch_add(1, Ordering::SeqCst);
    self.write_guard()?;

    let mut rows = self.rows.lock().unwrap();
    let row = rows
      .iter_mut()
      .find(|r| r.id == id)
      .ok_or_else(|| SyncError::NotFound(id.to_string()))?;
    *row = patch.apply_to(row);
    Ok(row.clone())
  }

  async fn remove(&self, id: &str) -> Result<bool> {
    self.removes.fetch_add(1, Ordering::SeqCst);
    self.write_guard()?;

    let mut rows = self.rows.lock().unwrap();
    let before = rows.len();
    rows.retain(|r| r.id != id);
    Ok(rows.len() != before)
  }

  async fn list(&self, order: ListOrder) -> Result<Vec<MemoryRecord>> {
    self.lists.fetch_add(1, Ordering::SeqCst);
    // The server answers with the rows as of the moment the query arrived.
    let mut rows = self.rows();
    let delay = *self.list_delay.lock().unwrap();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }
    if self.fail_reads.load(Ordering::SeqCst) {
      return Err(SyncError::RemoteReadFailed("timed out".to_string()));
    }

    match order {
      ListOrder::NewestFirst => sort_newest_first(&mut rows),
      ListOrder::OldestFirst => rows.sort_by_key(|r| r.created_at),
    }
    Ok(rows)
  }

  async fn upload_asset(&self, bytes: Vec<u8>) -> Result<String> {
    let n = self.uploads.fetch_add(1, Ordering::SeqCst);
    if self.fail_uploads.load(Ordering::SeqCst) {
      return Err(SyncError::UploadFailed("bucket full".to_string()));
    }
    Ok(format!("https://assets.test/{}-{}.bin", n, bytes.len()))
  }
}
