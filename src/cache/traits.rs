//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};

use crate::error::SyncError;

/// Trait for entities that can be cached.
///
/// Implementors provide a unique cache key; the key is the identity used in
/// every tier, so two snapshots with the same key are the same entity.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned {
  /// Unique identifier for this entity (the remote-assigned id)
  fn cache_key(&self) -> String;

  /// Entity type name for storage organization (e.g., "memory")
  fn entity_type() -> &'static str;
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was last confirmed (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
  /// Why a refresh failed, when `source` is `Offline`
  pub stale_reason: Option<SyncError>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
      stale_reason: None,
    }
  }

  /// Create a new cache result from the in-memory snapshot.
  pub fn from_memory(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Memory,
      cached_at: Some(cached_at),
      stale_reason: None,
    }
  }

  /// Create a new cache result for offline mode.
  ///
  /// `cached_at` is `None` when nothing was cached at all.
  pub fn offline(data: T, cached_at: Option<DateTime<Utc>>, reason: SyncError) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at,
      stale_reason: Some(reason),
    }
  }

  /// True when the data was not confirmed by the remote store.
  pub fn is_stale(&self) -> bool {
    self.source == CacheSource::Offline
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from the memory snapshot, still considered fresh
  Memory,
  /// Offline mode - network unavailable, serving the last known snapshot
  Offline,
}
