//! Assemble the sync core from configuration.

use tracing::{info, warn};

use crate::cache::{AnyStorage, CacheOrchestrator, NoopStorage, SqliteStorage};
use crate::config::Config;
use crate::error::Result;
use crate::presence::PresenceChannel;
use crate::remote::{AnyRemote, RestClient, UnconfiguredRemote};

/// The orchestrator over whichever remote and local store the config selects.
pub type Journal = CacheOrchestrator<AnyRemote, AnyStorage>;

/// Build the journal for `config`.
///
/// A missing endpoint yields the unconfigured remote; a local store that
/// cannot be opened degrades to remote-only operation.
pub fn open(config: &Config) -> Result<Journal> {
  let endpoint = config.endpoint();

  let remote = match &endpoint {
    Some(endpoint) => AnyRemote::Rest(RestClient::new(
      endpoint.clone(),
      &config.remote,
      config.request_timeout(),
    )?),
    None => {
      warn!("No remote endpoint configured; serving local data only");
      AnyRemote::Unconfigured(UnconfiguredRemote)
    }
  };

  let storage = if !config.cache.enabled {
    info!("Local cache disabled");
    AnyStorage::Noop(NoopStorage)
  } else {
    let opened = match (&config.cache.path, &endpoint) {
      (Some(path), _) => SqliteStorage::open(path),
      (None, Some(endpoint)) => SqliteStorage::open_default(endpoint.url.as_str()),
      (None, None) => SqliteStorage::open_default("unconfigured"),
    };
    match opened {
      Ok(storage) => AnyStorage::Sqlite(storage),
      Err(e) => {
        warn!(error = %e, "Local cache unavailable, continuing without it");
        AnyStorage::Noop(NoopStorage)
      }
    }
  };

  Ok(CacheOrchestrator::new(remote, storage).with_stale_after(config.stale_after()))
}

/// Presence channel for the configured endpoint and room.
pub fn presence(config: &Config) -> PresenceChannel {
  PresenceChannel::new(config.endpoint(), config.presence.clone())
}
