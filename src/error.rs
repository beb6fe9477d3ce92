//! Error taxonomy shared by every tier of the sync core.

use thiserror::Error;

/// Errors surfaced by the cache tiers, the remote client and the presence channel.
///
/// The enum is `Clone` so a single in-flight refresh can hand the same failure
/// to every caller waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
  /// The local durable store could not be opened, read or written.
  #[error("Local storage unavailable: {0}")]
  StorageUnavailable(String),

  /// A read against the remote store failed (network, timeout or server error).
  #[error("Remote read failed: {0}")]
  RemoteReadFailed(String),

  /// A write against the remote store failed (network, timeout or server error).
  #[error("Remote write failed: {0}")]
  RemoteWriteFailed(String),

  /// An asset upload failed; nothing referencing it may be saved.
  #[error("Upload failed: {0}")]
  UploadFailed(String),

  /// The record does not exist.
  #[error("Record not found: {0}")]
  NotFound(String),

  /// The realtime presence channel failed.
  #[error("Presence channel error: {0}")]
  ChannelError(String),

  /// A record failed validation before reaching the remote store.
  #[error("Invalid record: {0}")]
  InvalidRecord(String),

  /// Configuration is missing or malformed.
  #[error("Configuration error: {0}")]
  Config(String),

  /// The orchestrator was disposed and no longer serves requests.
  #[error("Journal cache has been disposed")]
  Disposed,
}

impl SyncError {
  /// True for failures that came from talking to the remote store.
  pub fn is_remote(&self) -> bool {
    matches!(
      self,
      SyncError::RemoteReadFailed(_) | SyncError::RemoteWriteFailed(_) | SyncError::UploadFailed(_)
    )
  }
}

impl From<rusqlite::Error> for SyncError {
  fn from(e: rusqlite::Error) -> Self {
    SyncError::StorageUnavailable(e.to_string())
  }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_is_remote() {
    assert!(SyncError::RemoteReadFailed("timeout".into()).is_remote());
    assert!(SyncError::UploadFailed("413".into()).is_remote());
    assert!(!SyncError::StorageUnavailable("locked".into()).is_remote());
    assert!(!SyncError::Disposed.is_remote());
  }
}
