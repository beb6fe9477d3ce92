//! Caching tiers for journal records and the orchestrator that ties them to
//! the remote store.
//!
//! - Memory tier: zero-I/O reads for the current session
//! - Local durable store: SQLite snapshots that survive restarts
//! - Orchestrator: read-through, remote-first writes, offline fallback
//!   (serve the last known snapshot when the network is unavailable)

mod memory;
mod orchestrator;
mod storage;
mod traits;

pub use memory::{MemoryCache, Snapshot};
pub use orchestrator::CacheOrchestrator;
pub use storage::{
  AnyStorage, CacheStorage, CachedEntity, CachedSnapshot, NoopStorage, SqliteStorage,
  SEED_MARKER,
};
pub use traits::{CacheResult, CacheSource, Cacheable};
