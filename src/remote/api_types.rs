//! Serde types matching the remote REST rows.
//!
//! These types are separate from domain types so that loosely typed columns
//! (numeric or text ids, timestamps as millis or RFC 3339, nullable arrays)
//! are normalized in one place.

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::types::{Identity, MemoryRecord, NewMemory};

// ============================================================================
// Column types
// ============================================================================

/// Row ids may be bigint identity columns or uuid/text columns.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ApiId {
  Number(i64),
  Text(String),
}

impl ApiId {
  fn into_string(self) -> String {
    match self {
      ApiId::Number(n) => n.to_string(),
      ApiId::Text(s) => s,
    }
  }
}

/// `created_at` as epoch millis (bigint) or a timestamptz string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ApiTimestamp {
  Millis(i64),
  Text(String),
}

impl ApiTimestamp {
  fn to_millis(&self) -> Option<i64> {
    match self {
      ApiTimestamp::Millis(ms) => Some(*ms),
      ApiTimestamp::Text(s) => DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.timestamp_millis()),
    }
  }
}

// ============================================================================
// Memory rows
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiMemoryRow {
  pub id: ApiId,
  #[serde(default)]
  pub content: Option<String>,
  pub created_at: ApiTimestamp,
  pub author: Identity,
  #[serde(default)]
  pub image_urls: Option<Vec<String>>,
  #[serde(default)]
  pub tags: Option<Vec<String>>,
}

impl ApiMemoryRow {
  /// Convert to the domain record. `None` if the timestamp is unreadable.
  pub fn into_record(self) -> Option<MemoryRecord> {
    let created_at = self.created_at.to_millis()?;
    Some(MemoryRecord {
      id: self.id.into_string(),
      content: self.content.unwrap_or_default(),
      created_at,
      author: self.author,
      image_urls: self.image_urls.unwrap_or_default(),
      tags: self
        .tags
        .unwrap_or_default()
        .into_iter()
        .collect::<BTreeSet<_>>(),
    })
  }
}

/// Body of an insert. The id is never sent; the server assigns it.
#[derive(Debug, Serialize)]
pub struct ApiInsertRow<'a> {
  pub content: &'a str,
  pub author: Identity,
  pub created_at: i64,
  pub image_urls: &'a [String],
  pub tags: Vec<&'a str>,
}

impl<'a> ApiInsertRow<'a> {
  pub fn new(memory: &'a NewMemory, now_ms: i64) -> Self {
    Self {
      content: &memory.content,
      author: memory.author,
      created_at: memory.created_at.unwrap_or(now_ms),
      image_urls: &memory.image_urls,
      tags: memory.tags.iter().map(String::as_str).collect(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_row_with_numeric_id_and_millis() {
    let row: ApiMemoryRow = serde_json::from_str(
      r#"{"id": 42, "content": "hi", "created_at": 1700000000000, "author": "a",
          "image_urls": null, "tags": ["trip"]}"#,
    )
    .unwrap();
    let record = row.into_record().unwrap();
    assert_eq!(record.id, "42");
    assert_eq!(record.created_at, 1_700_000_000_000);
    assert!(record.image_urls.is_empty());
    assert!(record.tags.contains("trip"));
  }

  #[test]
  fn test_row_with_text_timestamp() {
    let row: ApiMemoryRow = serde_json::from_str(
      r#"{"id": "6f1c", "content": null, "created_at": "2024-02-14T10:00:00+00:00",
          "author": "b", "image_urls": ["https://img/1.png"]}"#,
    )
    .unwrap();
    let record = row.into_record().unwrap();
    assert_eq!(record.id, "6f1c");
    assert_eq!(record.content, "");
    assert_eq!(record.created_at, 1_707_904_800_000);
    assert_eq!(record.author, Identity::B);
  }

  #[test]
  fn test_row_with_bad_timestamp_is_rejected() {
    let row: ApiMemoryRow = serde_json::from_str(
      r#"{"id": 1, "created_at": "yesterday", "author": "a"}"#,
    )
    .unwrap();
    assert!(row.into_record().is_none());
  }

  #[test]
  fn test_insert_row_defaults_created_at() {
    let memory = NewMemory::new(Identity::A, "hello").with_tag("x");
    let body = serde_json::to_value(ApiInsertRow::new(&memory, 99)).unwrap();
    assert_eq!(body["created_at"], 99);
    assert_eq!(body["author"], "a");
    assert_eq!(body["tags"][0], "x");
    assert!(body.get("id").is_none());
  }
}
