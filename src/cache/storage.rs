//! Local durable store trait and SQLite implementation.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use super::traits::Cacheable;
use crate::error::{Result, SyncError};

/// Marker key recording that the example records were inserted once.
pub const SEED_MARKER: &str = "seed_completed";

/// A single cached entity.
#[derive(Debug, Clone)]
pub struct CachedEntity<T> {
  /// The cached entity
  pub entity: T,
  /// When the entity was cached
  pub cached_at: DateTime<Utc>,
}

/// Every cached entity of one type.
#[derive(Debug, Clone)]
pub struct CachedSnapshot<T> {
  /// Entities in storage order (no ordering guarantee for callers)
  pub entities: Vec<T>,
  /// Most recent write among the entities
  pub cached_at: Option<DateTime<Utc>>,
}

/// Trait for local durable store backends.
///
/// Every method fails with [`SyncError::StorageUnavailable`] when the device
/// storage cannot be used.
pub trait CacheStorage: Send + Sync {
  /// Get a single entity by key.
  fn get<T: Cacheable>(&self, key: &str) -> Result<Option<CachedEntity<T>>>;

  /// Get every cached entity of type `T`.
  fn get_all<T: Cacheable>(&self) -> Result<CachedSnapshot<T>>;

  /// Upsert a single entity.
  fn put<T: Cacheable>(&self, entity: &T) -> Result<()>;

  /// Upsert many entities in one transaction.
  fn put_all<T: Cacheable>(&self, entities: &[T]) -> Result<()>;

  /// Replace every entity of type `T` with `entities` in one transaction.
  fn replace_all<T: Cacheable>(&self, entities: &[T]) -> Result<()>;

  /// Remove an entity. Removing a missing key is not an error.
  fn remove<T: Cacheable>(&self, key: &str) -> Result<()>;

  /// Drop every cached entity. Markers survive.
  fn clear(&self) -> Result<()>;

  /// Read a singleton marker.
  fn marker(&self, key: &str) -> Result<Option<String>>;

  /// Write a singleton marker.
  fn set_marker(&self, key: &str, value: &str) -> Result<()>;
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - entity operations are no-ops.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn get<T: Cacheable>(&self, _key: &str) -> Result<Option<CachedEntity<T>>> {
    Ok(None) // Always miss
  }

  fn get_all<T: Cacheable>(&self) -> Result<CachedSnapshot<T>> {
    Ok(CachedSnapshot {
      entities: Vec::new(),
      cached_at: None,
    })
  }

  fn put<T: Cacheable>(&self, _entity: &T) -> Result<()> {
    Ok(()) // Discard
  }

  fn put_all<T: Cacheable>(&self, _entities: &[T]) -> Result<()> {
    Ok(()) // Discard
  }

  fn replace_all<T: Cacheable>(&self, _entities: &[T]) -> Result<()> {
    Ok(()) // Discard
  }

  fn remove<T: Cacheable>(&self, _key: &str) -> Result<()> {
    Ok(())
  }

  fn clear(&self) -> Result<()> {
    Ok(())
  }

  // Markers cannot be remembered, so report them as unavailable rather than
  // absent: callers must not mistake "never recorded" for "cannot know".
  fn marker(&self, _key: &str) -> Result<Option<String>> {
    Err(SyncError::StorageUnavailable(
      "local caching is disabled".to_string(),
    ))
  }

  fn set_marker(&self, _key: &str, _value: &str) -> Result<()> {
    Err(SyncError::StorageUnavailable(
      "local caching is disabled".to_string(),
    ))
  }
}

/// The store chosen at startup: SQLite, or nothing when caching is disabled
/// or the database cannot be opened.
pub enum AnyStorage {
  Sqlite(SqliteStorage),
  Noop(NoopStorage),
}

impl AnyStorage {
  pub fn is_persistent(&self) -> bool {
    matches!(self, AnyStorage::Sqlite(_))
  }
}

macro_rules! delegate {
  ($self:ident, $s:ident => $call:expr) => {
    match $self {
      AnyStorage::Sqlite($s) => $call,
      AnyStorage::Noop($s) => $call,
    }
  };
}

impl CacheStorage for AnyStorage {
  fn get<T: Cacheable>(&self, key: &str) -> Result<Option<CachedEntity<T>>> {
    delegate!(self, s => s.get(key))
  }

  fn get_all<T: Cacheable>(&self) -> Result<CachedSnapshot<T>> {
    delegate!(self, s => s.get_all())
  }

  fn put<T: Cacheable>(&self, entity: &T) -> Result<()> {
    delegate!(self, s => s.put(entity))
  }

  fn put_all<T: Cacheable>(&self, entities: &[T]) -> Result<()> {
    delegate!(self, s => s.put_all(entities))
  }

  fn replace_all<T: Cacheable>(&self, entities: &[T]) -> Result<()> {
    delegate!(self, s => s.replace_all(entities))
  }

  fn remove<T: Cacheable>(&self, key: &str) -> Result<()> {
    delegate!(self, s => s.remove::<T>(key))
  }

  fn clear(&self) -> Result<()> {
    delegate!(self, s => s.clear())
  }

  fn marker(&self, key: &str) -> Result<Option<String>> {
    delegate!(self, s => s.marker(key))
  }

  fn set_marker(&self, key: &str, value: &str) -> Result<()> {
    delegate!(self, s => s.set_marker(key, value))
  }
}

/// SQLite-based local store.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the store for `endpoint` at the default location.
  pub fn open_default(endpoint: &str) -> Result<Self> {
    let path = Self::default_path(endpoint)?;
    Self::open(&path)
  }

  /// Open or create the store at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
      std::fs::create_dir_all(parent).map_err(|e| {
        SyncError::StorageUnavailable(format!("Failed to create cache directory: {}", e))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      SyncError::StorageUnavailable(format!(
        "Failed to open cache database at {}: {}",
        path.display(),
        e
      ))
    })?;

    debug!(path = %path.display(), "opened local cache");
    Self::with_connection(conn)
  }

  /// Open a throwaway store that lives as long as the process.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Default database path, one file per remote endpoint.
  pub fn default_path(endpoint: &str) -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| {
        SyncError::StorageUnavailable("Could not determine data directory".to_string())
      })?;

    Ok(
      data_dir
        .join("duojournal")
        .join(format!("cache-{}.db", endpoint_hash(endpoint))),
    )
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| SyncError::StorageUnavailable(format!("Lock poisoned: {}", e)))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    conn.execute_batch(CACHE_SCHEMA).map_err(|e| {
      SyncError::StorageUnavailable(format!("Failed to run cache migrations: {}", e))
    })?;

    Ok(())
  }
}

/// Stable, short file-name fragment for an endpoint URL.
fn endpoint_hash(endpoint: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(endpoint.trim().trim_end_matches('/').as_bytes());
  let digest = hex::encode(hasher.finalize());
  digest[..16].to_string()
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Entity snapshots (serialized JSON)
CREATE TABLE IF NOT EXISTS entity_cache (
    entity_type TEXT NOT NULL,
    entity_key TEXT NOT NULL,
    data BLOB NOT NULL,
    position INTEGER NOT NULL DEFAULT 0,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (entity_type, entity_key)
);

CREATE INDEX IF NOT EXISTS idx_entity_cache_position
    ON entity_cache(entity_type, position);

-- Singleton flags (seed marker, UI preferences)
CREATE TABLE IF NOT EXISTS markers (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

// New rows go in front of everything already cached so storage order stays
// newest-first. Existing rows keep their position.
const UPSERT_ENTITY: &str = "INSERT INTO entity_cache (entity_type, entity_key, data, position, cached_at)
   VALUES (?1, ?2, ?3,
     (SELECT COALESCE(MIN(position), 0) - 1 FROM entity_cache WHERE entity_type = ?1),
     datetime('now'))
   ON CONFLICT(entity_type, entity_key)
   DO UPDATE SET data = excluded.data, cached_at = excluded.cached_at";

fn serialize<T: Cacheable>(entity: &T) -> Result<Vec<u8>> {
  serde_json::to_vec(entity)
    .map_err(|e| SyncError::StorageUnavailable(format!("Failed to serialize entity: {}", e)))
}

impl CacheStorage for SqliteStorage {
  fn get<T: Cacheable>(&self, key: &str) -> Result<Option<CachedEntity<T>>> {
    let conn = self.lock()?;

    let row: Option<(Vec<u8>, String)> = conn
      .query_row(
        "SELECT data, cached_at FROM entity_cache
         WHERE entity_type = ? AND entity_key = ?",
        params![T::entity_type(), key],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()?;

    match row {
      Some((data, cached_at_str)) => {
        let entity: T = serde_json::from_slice(&data).map_err(|e| {
          SyncError::StorageUnavailable(format!("Failed to deserialize entity {}: {}", key, e))
        })?;
        let cached_at = parse_datetime(&cached_at_str)?;
        Ok(Some(CachedEntity { entity, cached_at }))
      }
      None => Ok(None),
    }
  }

  fn get_all<T: Cacheable>(&self) -> Result<CachedSnapshot<T>> {
    let conn = self.lock()?;

    let mut stmt = conn.prepare(
      "SELECT entity_key, data, cached_at FROM entity_cache
       WHERE entity_type = ?
       ORDER BY position",
    )?;

    let rows: Vec<(String, Vec<u8>, String)> = stmt
      .query_map(params![T::entity_type()], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
      })?
      .collect::<rusqlite::Result<_>>()?;

    let mut entities = Vec::with_capacity(rows.len());
    let mut cached_at: Option<DateTime<Utc>> = None;
    for (key, data, cached_at_str) in rows {
      match serde_json::from_slice::<T>(&data) {
        Ok(entity) => entities.push(entity),
        Err(e) => {
          warn!(key = %key, error = %e, "skipping unreadable cached entity");
          continue;
        }
      }
      let at = parse_datetime(&cached_at_str)?;
      cached_at = Some(cached_at.map_or(at, |current| current.max(at)));
    }

    Ok(CachedSnapshot {
      entities,
      cached_at,
    })
  }

  fn put<T: Cacheable>(&self, entity: &T) -> Result<()> {
    let conn = self.lock()?;
    let data = serialize(entity)?;

    conn.execute(
      UPSERT_ENTITY,
      params![T::entity_type(), entity.cache_key(), data],
    )?;

    Ok(())
  }

  fn put_all<T: Cacheable>(&self, entities: &[T]) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;

    // Insert oldest-last input in reverse so the first entity ends up in front.
    for entity in entities.iter().rev() {
      let data = serialize(entity)?;
      tx.execute(
        UPSERT_ENTITY,
        params![T::entity_type(), entity.cache_key(), data],
      )?;
    }

    tx.commit()?;
    Ok(())
  }

  fn replace_all<T: Cacheable>(&self, entities: &[T]) -> Result<()> {
    let mut conn = self.lock()?;
    let entity_type = T::entity_type();
    let tx = conn.transaction()?;

    tx.execute(
      "DELETE FROM entity_cache WHERE entity_type = ?",
      params![entity_type],
    )?;

    for (position, entity) in entities.iter().enumerate() {
      let data = serialize(entity)?;
      tx.execute(
        "INSERT OR REPLACE INTO entity_cache (entity_type, entity_key, data, position, cached_at)
         VALUES (?, ?, ?, ?, datetime('now'))",
        params![entity_type, entity.cache_key(), data, position as i64],
      )?;
    }

    tx.commit()?;
    Ok(())
  }

  fn remove<T: Cacheable>(&self, key: &str) -> Result<()> {
    let conn = self.lock()?;
    conn.execute(
      "DELETE FROM entity_cache WHERE entity_type = ? AND entity_key = ?",
      params![T::entity_type(), key],
    )?;
    Ok(())
  }

  fn clear(&self) -> Result<()> {
    let conn = self.lock()?;
    conn.execute("DELETE FROM entity_cache", [])?;
    Ok(())
  }

  fn marker(&self, key: &str) -> Result<Option<String>> {
    let conn = self.lock()?;
    let value = conn
      .query_row(
        "SELECT value FROM markers WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()?;
    Ok(value)
  }

  fn set_marker(&self, key: &str, value: &str) -> Result<()> {
    let conn = self.lock()?;
    conn.execute(
      "INSERT OR REPLACE INTO markers (key, value, updated_at) VALUES (?, ?, datetime('now'))",
      params![key, value],
    )?;
    Ok(())
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| SyncError::StorageUnavailable(format!("Failed to parse datetime '{}': {}", s, e)))
}

/// Store whose device storage is gone: every call fails.
#[cfg(test)]
pub(crate) struct UnavailableStorage;

#[cfg(test)]
impl UnavailableStorage {
  fn fail<T>() -> Result<T> {
    Err(SyncError::StorageUnavailable("quota exceeded".to_string()))
  }
}

#[cfg(test)]
impl CacheStorage for UnavailableStorage {
  fn get<T: Cacheable>(&self, _key: &str) -> Result<Option<CachedEntity<T>>> {
    Self::fail()
  }

  fn get_all<T: Cacheable>(&self) -> Result<CachedSnapshot<T>> {
    Self::fail()
  }

  fn put<T: Cacheable>(&self, _entity: &T) -> Result<()> {
    Self::fail()
  }

  fn put_all<T: Cacheable>(&self, _entities: &[T]) -> Result<()> {
    Self::fail()
  }

  fn replace_all<T: Cacheable>(&self, _entities: &[T]) -> Result<()> {
    Self::fail()
  }

  fn remove<T: Cacheable>(&self, _key: &str) -> Result<()> {
    Self::fail()
  }

  fn clear(&self) -> Result<()> {
    Self::fail()
  }

  fn marker(&self, _key: &str) -> Result<Option<String>> {
    Self::fail()
  }

  fn set_marker(&self, _key: &str, _value: &str) -> Result<()> {
    Self::fail()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::remote::types::{Identity, MemoryRecord};

  fn record(id: &str, created_at: i64) -> MemoryRecord {
    MemoryRecord {
      id: id.to_string(),
      content: format!("memory {}", id),
      created_at,
      author: Identity::B,
      image_urls: Vec::new(),
      tags: Default::default(),
    }
  }

  fn keys(snapshot: &CachedSnapshot<MemoryRecord>) -> Vec<&str> {
    snapshot.entities.iter().map(|r| r.id.as_str()).collect()
  }

  #[test]
  fn test_put_get_remove() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    assert!(storage.get::<MemoryRecord>("m1").unwrap().is_none());

    storage.put(&record("m1", 10)).unwrap();
    let cached = storage.get::<MemoryRecord>("m1").unwrap().unwrap();
    assert_eq!(cached.entity, record("m1", 10));

    storage.remove::<MemoryRecord>("m1").unwrap();
    assert!(storage.get::<MemoryRecord>("m1").unwrap().is_none());
    // Removing again is fine
    storage.remove::<MemoryRecord>("m1").unwrap();
  }

  #[test]
  fn test_put_overwrites_by_id() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.put(&record("m1", 10)).unwrap();

    let mut edited = record("m1", 10);
    edited.content = "edited".to_string();
    storage.put(&edited).unwrap();

    let all = storage.get_all::<MemoryRecord>().unwrap();
    assert_eq!(all.entities.len(), 1);
    assert_eq!(all.entities[0].content, "edited");
    assert!(all.cached_at.is_some());
  }

  #[test]
  fn test_put_all_and_new_put_goes_first() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage
      .put_all(&[record("m3", 300), record("m2", 200)])
      .unwrap();
    storage.put(&record("m4", 400)).unwrap();

    let all = storage.get_all::<MemoryRecord>().unwrap();
    assert_eq!(keys(&all), vec!["m4", "m3", "m2"]);
  }

  #[test]
  fn test_replace_all_drops_missing_entities() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage
      .put_all(&[record("m1", 100), record("m2", 200)])
      .unwrap();
    storage
      .replace_all(&[record("m3", 300), record("m2", 200)])
      .unwrap();

    let all = storage.get_all::<MemoryRecord>().unwrap();
    assert_eq!(keys(&all), vec!["m3", "m2"]);
  }

  #[test]
  fn test_clear_keeps_markers() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.put(&record("m1", 100)).unwrap();
    storage.set_marker(SEED_MARKER, "1").unwrap();

    storage.clear().unwrap();

    assert!(storage.get_all::<MemoryRecord>().unwrap().entities.is_empty());
    assert_eq!(storage.marker(SEED_MARKER).unwrap().as_deref(), Some("1"));
    assert!(storage.marker("dark_mode").unwrap().is_none());
  }

  #[test]
  fn test_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");

    {
      let storage = SqliteStorage::open(&path).unwrap();
      storage.put(&record("m1", 100)).unwrap();
      storage.set_marker(SEED_MARKER, "1").unwrap();
    }

    let storage = SqliteStorage::open(&path).unwrap();
    assert!(storage.get::<MemoryRecord>("m1").unwrap().is_some());
    assert!(storage.marker(SEED_MARKER).unwrap().is_some());
  }

  #[test]
  fn test_unreadable_rows_are_skipped() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.put(&record("m1", 100)).unwrap();
    {
      let conn = storage.lock().unwrap();
      conn
        .execute(
          "INSERT INTO entity_cache (entity_type, entity_key, data) VALUES ('memory', 'bad', x'00')",
          [],
        )
        .unwrap();
    }

    let all = storage.get_all::<MemoryRecord>().unwrap();
    assert_eq!(keys(&all), vec!["m1"]);
    assert!(matches!(
      storage.get::<MemoryRecord>("bad"),
      Err(SyncError::StorageUnavailable(_))
    ));
  }

  #[test]
  fn test_noop_storage_reports_markers_unavailable() {
    let storage = NoopStorage;
    storage.put(&record("m1", 100)).unwrap();
    assert!(storage.get::<MemoryRecord>("m1").unwrap().is_none());
    assert!(storage.marker(SEED_MARKER).is_err());
  }

  #[test]
  fn test_any_storage_delegates() {
    let storage = AnyStorage::Sqlite(SqliteStorage::open_in_memory().unwrap());
    assert!(storage.is_persistent());
    storage.put(&record("m1", 100)).unwrap();
    storage.set_marker(SEED_MARKER, "now").unwrap();
    assert!(storage.get::<MemoryRecord>("m1").unwrap().is_some());
    assert_eq!(storage.marker(SEED_MARKER).unwrap().as_deref(), Some("now"));

    let disabled = AnyStorage::Noop(NoopStorage);
    assert!(!disabled.is_persistent());
    assert!(disabled.marker(SEED_MARKER).is_err());
  }

  #[test]
  fn test_endpoint_hash_is_stable() {
    assert_eq!(
      endpoint_hash("https://x.example.co/"),
      endpoint_hash("https://x.example.co")
    );
    assert_ne!(
      endpoint_hash("https://x.example.co"),
      endpoint_hash("https://y.example.co")
    );
    assert_eq!(endpoint_hash("https://x.example.co").len(), 16);
  }
}
