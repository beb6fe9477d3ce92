use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::error::{Result, SyncError};
use crate::remote::types::Identity;

/// Environment variable holding the remote endpoint URL.
pub const URL_VAR: &str = "DUOJOURNAL_REMOTE_URL";
/// Environment variable holding the remote API key.
pub const API_KEY_VAR: &str = "DUOJOURNAL_API_KEY";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Which of the two journal identities this device acts as
  pub identity: Option<Identity>,
  pub remote: RemoteConfig,
  pub cache: CacheConfig,
  pub presence: PresenceConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
  /// Endpoint URL; the environment takes precedence
  pub url: Option<String>,
  pub table: String,
  /// Storage bucket for image attachments
  pub bucket: String,
  pub timeout_secs: u64,
}

impl Default for RemoteConfig {
  fn default() -> Self {
    Self {
      url: None,
      table: "memories".to_string(),
      bucket: "memory-images".to_string(),
      timeout_secs: 10,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub enabled: bool,
  /// Database path; defaults to a per-endpoint file in the data directory
  pub path: Option<PathBuf>,
  pub stale_after_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      path: None,
      stale_after_secs: 300,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
  pub room: String,
  pub heartbeat_secs: u64,
  /// Consecutive failed connection attempts before giving up
  pub max_retries: u32,
  pub initial_backoff_ms: u64,
  pub max_backoff_secs: u64,
}

impl Default for PresenceConfig {
  fn default() -> Self {
    Self {
      room: "duojournal-presence".to_string(),
      heartbeat_secs: 25,
      max_retries: 5,
      initial_backoff_ms: 1000,
      max_backoff_secs: 30,
    }
  }
}

impl PresenceConfig {
  pub fn heartbeat(&self) -> Duration {
    Duration::from_secs(self.heartbeat_secs.max(1))
  }

  /// Descriptors not refreshed for three heartbeats are considered gone.
  pub fn ttl(&self) -> Duration {
    self.heartbeat() * 3
  }
}

/// A usable remote endpoint: parsed URL plus API key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
  pub url: Url,
  pub api_key: String,
}

impl Endpoint {
  /// Pick the first non-blank URL and key from the candidates.
  ///
  /// Returns `None` when either is missing or the URL is not http(s), which
  /// callers treat as "sync and presence disabled".
  pub fn resolve<'a>(
    urls: impl IntoIterator<Item = Option<&'a str>>,
    keys: impl IntoIterator<Item = Option<&'a str>>,
  ) -> Option<Self> {
    let url = first_non_blank(urls)?;
    let api_key = first_non_blank(keys)?;

    let mut url = Url::parse(url).ok()?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
      return None;
    }
    // Keep a trailing slash so relative joins append instead of replacing.
    if !url.path().ends_with('/') {
      let path = format!("{}/", url.path());
      url.set_path(&path);
    }

    Some(Self {
      url,
      api_key: api_key.to_string(),
    })
  }
}

fn first_non_blank<'a>(candidates: impl IntoIterator<Item = Option<&'a str>>) -> Option<&'a str> {
  candidates
    .into_iter()
    .flatten()
    .map(str::trim)
    .find(|s| !s.is_empty())
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided (must exist)
  /// 2. ./duojournal.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/duojournal/config.yaml
  ///
  /// No file at all yields the defaults.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(SyncError::Config(format!(
          "Config file not found: {}",
          p.display()
        )));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("duojournal.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("duojournal").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
      SyncError::Config(format!(
        "Failed to read config file {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::parse(&contents)
      .map_err(|e| SyncError::Config(format!("Failed to parse {}: {}", path.display(), e)))
  }

  pub fn parse(contents: &str) -> std::result::Result<Self, serde_yaml::Error> {
    // An empty file is a valid, all-defaults config.
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents)
  }

  /// Resolve the remote endpoint.
  ///
  /// Runtime environment first, then values captured at build time, then the
  /// config file (URL only; keys never live in the file).
  pub fn endpoint(&self) -> Option<Endpoint> {
    let runtime_url = std::env::var(URL_VAR).ok();
    let runtime_key = std::env::var(API_KEY_VAR).ok();

    Endpoint::resolve(
      [
        runtime_url.as_deref(),
        option_env!("DUOJOURNAL_REMOTE_URL"),
        self.remote.url.as_deref(),
      ],
      [runtime_key.as_deref(), option_env!("DUOJOURNAL_API_KEY")],
    )
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.remote.timeout_secs.max(1))
  }

  pub fn stale_after(&self) -> chrono::Duration {
    chrono::Duration::seconds(self.cache.stale_after_secs as i64)
  }
}
