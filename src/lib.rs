//! Sync core for a two-person shared memory journal.
//!
//! Records live in a remote store; this crate keeps a memory tier and a
//! SQLite snapshot in front of it so the journal stays readable offline, and
//! runs a presence channel that tells each partner when the other is around.

pub mod cache;
pub mod config;
pub mod error;
pub mod journal;
pub mod logging;
pub mod presence;
pub mod remote;
pub mod seed;

pub use cache::{CacheOrchestrator, CacheResult, CacheSource};
pub use config::Config;
pub use error::{Result, SyncError};
pub use journal::Journal;
pub use presence::{PresenceChannel, PresenceStatus, Subscription};
pub use remote::types::{Identity, MemoryPatch, MemoryRecord, NewMemory};
