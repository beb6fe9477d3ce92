//! Remote sync client: the source of truth for journal records.

pub mod api_types;
mod cache;
pub mod client;
#[cfg(test)]
pub(crate) mod fake;
pub mod types;

use async_trait::async_trait;

use crate::error::{Result, SyncError};
use types::{MemoryPatch, MemoryRecord, NewMemory};

pub use client::RestClient;

/// Listing order for [`RemoteStore::list`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ListOrder {
  /// Descending by creation time (the journal view)
  #[default]
  NewestFirst,
  OldestFirst,
}

/// Network-observable operations against the remote store.
///
/// Each write is issued at most once per call: implementations must not retry
/// on their own, because a retried create can insert twice.
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
  /// Insert a record; the id comes from the server response.
  async fn create(&self, memory: &NewMemory) -> Result<MemoryRecord>;

  /// Update a record, failing with [`SyncError::NotFound`] if it is gone.
  async fn update(&self, id: &str, patch: &MemoryPatch) -> Result<MemoryRecord>;

  /// Delete a record. `Ok(false)` means it was already gone.
  async fn remove(&self, id: &str) -> Result<bool>;

  /// Every record in the requested order.
  async fn list(&self, order: ListOrder) -> Result<Vec<MemoryRecord>>;

  /// Store image bytes and return a retrievable URL.
  async fn upload_asset(&self, bytes: Vec<u8>) -> Result<String>;
}

/// Stand-in used when no endpoint is configured: every call fails the way a
/// network outage would, so the cache tiers keep serving what they have.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredRemote;

const NOT_CONFIGURED: &str = "remote store not configured";

#[async_trait]
impl RemoteStore for UnconfiguredRemote {
  async fn create(&self, _memory: &NewMemory) -> Result<MemoryRecord> {
    Err(SyncError::RemoteWriteFailed(NOT_CONFIGURED.to_string()))
  }

  async fn update(&self, _id: &str, _patch: &MemoryPatch) -> Result<MemoryRecord> {
    Err(SyncError::RemoteWriteFailed(NOT_CONFIGURED.to_string()))
  }

  async fn remove(&self, _id: &str) -> Result<bool> {
    Err(SyncError::RemoteWriteFailed(NOT_CONFIGURED.to_string()))
  }

  async fn list(&self, _order: ListOrder) -> Result<Vec<MemoryRecord>> {
    Err(SyncError::RemoteReadFailed(NOT_CONFIGURED.to_string()))
  }

  async fn upload_asset(&self, _bytes: Vec<u8>) -> Result<String> {
    Err(SyncError::UploadFailed(NOT_CONFIGURED.to_string()))
  }
}

/// Either the real client or the unconfigured stand-in, chosen from config.
pub enum AnyRemote {
  Rest(RestClient),
  Unconfigured(UnconfiguredRemote),
}

#[async_trait]
impl RemoteStore for AnyRemote {
  async fn create(&self, memory: &NewMemory) -> Result<MemoryRecord> {
    match self {
      AnyRemote::Rest(c) => c.create(memory).await,
      AnyRemote::Unconfigured(c) => c.create(memory).await,
    }
  }

  async fn update(&self, id: &str, patch: &MemoryPatch) -> Result<MemoryRecord> {
    match self {
      AnyRemote::Rest(c) => c.update(id, patch).await,
      AnyRemote::Unconfigured(c) => c.update(id, patch).await,
    }
  }

  async fn remove(&self, id: &str) -> Result<bool> {
    match self {
      AnyRemote::Rest(c) => c.remove(id).await,
      AnyRemote::Unconfigured(c) => c.remove(id).await,
    }
  }

  async fn list(&self, order: ListOrder) -> Result<Vec<MemoryRecord>> {
    match self {
      AnyRemote::Rest(c) => c.list(order).await,
      AnyRemote::Unconfigured(c) => c.list(order).await,
    }
  }

  async fn upload_asset(&self, bytes: Vec<u8>) -> Result<String> {
    match self {
      AnyRemote::Rest(c) => c.upload_asset(bytes).await,
      AnyRemote::Unconfigured(c) => c.upload_asset(bytes).await,
    }
  }
}
