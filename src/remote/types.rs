use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::SyncError;

/// One of the two fixed journal identities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Identity {
  A,
  B,
}

impl Identity {
  /// The other identity of the pair.
  pub fn other(self) -> Self {
    match self {
      Identity::A => Identity::B,
      Identity::B => Identity::A,
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Identity::A => "a",
      Identity::B => "b",
    }
  }
}

impl fmt::Display for Identity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Identity {
  type Err = SyncError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "a" => Ok(Identity::A),
      "b" => Ok(Identity::B),
      other => Err(SyncError::Config(format!(
        "unknown identity '{}', expected 'a' or 'b'",
        other
      ))),
    }
  }
}

/// A journal entry as acknowledged by the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRecord {
  pub id: String,
  pub content: String,
  /// Milliseconds since epoch, listing sort key (newest first)
  pub created_at: i64,
  pub author: Identity,
  #[serde(default)]
  pub image_urls: Vec<String>,
  #[serde(default)]
  pub tags: BTreeSet<String>,
}

/// Fields for a record that does not exist yet. The id comes from the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewMemory {
  pub content: String,
  pub author: Identity,
  /// Creation time; `None` means "now" at the moment of the remote insert
  pub created_at: Option<i64>,
  pub image_urls: Vec<String>,
  pub tags: BTreeSet<String>,
}

impl NewMemory {
  pub fn new(author: Identity, content: impl Into<String>) -> Self {
    Self {
      content: content.into(),
      author,
      created_at: None,
      image_urls: Vec::new(),
      tags: BTreeSet::new(),
    }
  }

  pub fn with_created_at(mut self, created_at: i64) -> Self {
    self.created_at = Some(created_at);
    self
  }

  pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
    self.tags.insert(tag.into());
    self
  }

  pub fn with_image(mut self, url: impl Into<String>) -> Self {
    self.image_urls.push(url.into());
    self
  }

  /// Content may only be blank when an image is attached.
  pub fn validate(&self) -> Result<(), SyncError> {
    validate_body(&self.content, &self.image_urls)
  }
}

/// Partial update of the mutable fields of a record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemoryPatch {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub content: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub image_urls: Option<Vec<String>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub tags: Option<BTreeSet<String>>,
}

impl MemoryPatch {
  pub fn content(content: impl Into<String>) -> Self {
    Self {
      content: Some(content.into()),
      ..Self::default()
    }
  }

  pub fn is_empty(&self) -> bool {
    self.content.is_none() && self.image_urls.is_none() && self.tags.is_none()
  }

  /// Apply the patch to a copy of `record`.
  pub fn apply_to(&self, record: &MemoryRecord) -> MemoryRecord {
    let mut updated = record.clone();
    if let Some(content) = &self.content {
      updated.content = content.clone();
    }
    if let Some(image_urls) = &self.image_urls {
      updated.image_urls = image_urls.clone();
    }
    if let Some(tags) = &self.tags {
      updated.tags = tags.clone();
    }
    updated
  }
}

pub(crate) fn validate_body(content: &str, image_urls: &[String]) -> Result<(), SyncError> {
  if content.trim().is_empty() && image_urls.is_empty() {
    return Err(SyncError::InvalidRecord(
      "content may only be empty when an image is attached".to_string(),
    ));
  }
  Ok(())
}

/// Sort newest first. The sort is stable, so equal timestamps keep the
/// order they arrived in (remote insertion order).
pub fn sort_newest_first(records: &mut [MemoryRecord]) {
  records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}
