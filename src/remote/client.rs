use async_trait::async_trait;
use chrono::Utc;
use reqwest::{header, RequestBuilder, Response, StatusCode};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::api_types::{ApiInsertRow, ApiMemoryRow};
use super::types::{sort_newest_first, MemoryPatch, MemoryRecord, NewMemory};
use super::{ListOrder, RemoteStore};
use crate::config::{Endpoint, RemoteConfig};
use crate::error::{Result, SyncError};

/// Longest response body excerpt kept in error messages.
const MAX_ERROR_BODY: usize = 200;

/// REST client for the remote row store and its object storage.
#[derive(Clone)]
pub struct RestClient {
  http: reqwest::Client,
  endpoint: Endpoint,
  table: String,
  bucket: String,
  timeout: Duration,
}

impl RestClient {
  pub fn new(endpoint: Endpoint, remote: &RemoteConfig, timeout: Duration) -> Result<Self> {
    // The timeout bounds the whole request, connect through body.
    let http = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| SyncError::Config(format!("Failed to create HTTP client: {}", e)))?;

    Ok(Self {
      http,
      endpoint,
      table: remote.table.clone(),
      bucket: remote.bucket.clone(),
      timeout,
    })
  }

  fn join(&self, path: &str) -> Result<Url> {
    self
      .endpoint
      .url
      .join(path)
      .map_err(|e| SyncError::Config(format!("Invalid remote path '{}': {}", path, e)))
  }

  /// `{base}/rest/v1/{table}`
  pub(crate) fn table_url(&self) -> Result<Url> {
    self.join(&format!("rest/v1/{}", self.table))
  }

  /// Table URL filtered to a single row.
  pub(crate) fn row_url(&self, id: &str) -> Result<Url> {
    let mut url = self.table_url()?;
    url
      .query_pairs_mut()
      .append_pair("id", &format!("eq.{}", id));
    Ok(url)
  }

  pub(crate) fn list_url(&self, order: ListOrder) -> Result<Url> {
    let direction = match order {
      ListOrder::NewestFirst => "created_at.desc",
      ListOrder::OldestFirst => "created_at.asc",
    };
    let mut url = self.table_url()?;
    url
      .query_pairs_mut()
      .append_pair("select", "*")
      .append_pair("order", direction);
    Ok(url)
  }

  pub(crate) fn upload_url(&self, object_name: &str) -> Result<Url> {
    self.join(&format!("storage/v1/object/{}/{}", self.bucket, object_name))
  }

  pub(crate) fn public_url(&self, object_name: &str) -> Result<Url> {
    self.join(&format!(
      "storage/v1/object/public/{}/{}",
      self.bucket, object_name
    ))
  }

  fn authed(&self, request: RequestBuilder) -> RequestBuilder {
    request
      .header("apikey", &self.endpoint.api_key)
      .bearer_auth(&self.endpoint.api_key)
  }

  /// Send a request, turning transport failures into `classify` errors.
  async fn dispatch(
    &self,
    request: RequestBuilder,
    classify: fn(String) -> SyncError,
    what: &str,
  ) -> Result<Response> {
    self
      .authed(request)
      .send()
      .await
      .map_err(|e| classify(self.describe(what, &e)))
  }

  /// Fail non-2xx responses with a `classify` error carrying a body excerpt.
  async fn check(
    response: Response,
    classify: fn(String) -> SyncError,
    what: &str,
  ) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
      return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(classify(status_message(what, status, &body)))
  }

  async fn send(
    &self,
    request: RequestBuilder,
    classify: fn(String) -> SyncError,
    what: &str,
  ) -> Result<Response> {
    let response = self.dispatch(request, classify, what).await?;
    Self::check(response, classify, what).await
  }

  fn describe(&self, what: &str, e: &reqwest::Error) -> String {
    if e.is_timeout() {
      format!("{} timed out after {:?}", what, self.timeout)
    } else {
      format!("{}: {}", what, e)
    }
  }

  async fn rows(
    &self,
    response: Response,
    classify: fn(String) -> SyncError,
    what: &str,
  ) -> Result<Vec<MemoryRecord>> {
    let rows: Vec<ApiMemoryRow> = response
      .json()
      .await
      .map_err(|e| classify(format!("{}: unreadable response: {}", what, e)))?;

    rows
      .into_iter()
      .map(|row| {
        row
          .into_record()
          .ok_or_else(|| classify(format!("{}: row with unreadable created_at", what)))
      })
      .collect()
  }
}

fn status_message(what: &str, status: StatusCode, body: &str) -> String {
  let mut excerpt: String = body.chars().take(MAX_ERROR_BODY).collect();
  if body.chars().count() > MAX_ERROR_BODY {
    excerpt.push('…');
  }
  format!("{} returned {}: {}", what, status, excerpt.trim())
}

/// Object name for uploaded bytes: content hash plus a sniffed extension, so
/// the same image uploads to the same object.
pub(crate) fn object_name(bytes: &[u8]) -> (String, &'static str) {
  let (extension, mime) = sniff_image(bytes);
  let mut hasher = Sha256::new();
  hasher.update(bytes);
  (
    format!("{}.{}", hex::encode(hasher.finalize()), extension),
    mime,
  )
}

fn sniff_image(bytes: &[u8]) -> (&'static str, &'static str) {
  match bytes {
    [0x89, b'P', b'N', b'G', ..] => ("png", "image/png"),
    [0xFF, 0xD8, 0xFF, ..] => ("jpg", "image/jpeg"),
    [b'G', b'I', b'F', b'8', ..] => ("gif", "image/gif"),
    [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => ("webp", "image/webp"),
    _ => ("bin", "application/octet-stream"),
  }
}

#[async_trait]
impl RemoteStore for RestClient {
  async fn create(&self, memory: &NewMemory) -> Result<MemoryRecord> {
    let body = ApiInsertRow::new(memory, Utc::now().timestamp_millis());
    let request = self
      .http
      .post(self.table_url()?)
      .header("Prefer", "return=representation")
      .json(&body);

    let response = self
      .send(request, SyncError::RemoteWriteFailed, "create memory")
      .await?;
    let record = self
      .rows(response, SyncError::RemoteWriteFailed, "create memory")
      .await?
      .into_iter()
      .next()
      .ok_or_else(|| {
        SyncError::RemoteWriteFailed("create memory: server returned no row".to_string())
      })?;

    debug!(id = %record.id, "remote created memory");
    Ok(record)
  }

  async fn update(&self, id: &str, patch: &MemoryPatch) -> Result<MemoryRecord> {
    let request = self
      .http
      .patch(self.row_url(id)?)
      .header("Prefer", "return=representation")
      .json(patch);

    let response = self
      .dispatch(request, SyncError::RemoteWriteFailed, "update memory")
      .await?;
    if response.status() == StatusCode::NOT_FOUND {
      return Err(SyncError::NotFound(id.to_string()));
    }
    let response = Self::check(response, SyncError::RemoteWriteFailed, "update memory").await?;

    // An empty representation means no row matched the filter.
    self
      .rows(response, SyncError::RemoteWriteFailed, "update memory")
      .await?
      .into_iter()
      .next()
      .ok_or_else(|| SyncError::NotFound(id.to_string()))
  }

  async fn remove(&self, id: &str) -> Result<bool> {
    let request = self
      .http
      .delete(self.row_url(id)?)
      .header("Prefer", "return=representation");

    let response = self
      .send(request, SyncError::RemoteWriteFailed, "delete memory")
      .await?;
    let deleted = self
      .rows(response, SyncError::RemoteWriteFailed, "delete memory")
      .await?;

    debug!(id, existed = !deleted.is_empty(), "remote delete");
    Ok(!deleted.is_empty())
  }

  async fn list(&self, order: ListOrder) -> Result<Vec<MemoryRecord>> {
    let request = self.http.get(self.list_url(order)?);

    let response = self
      .send(request, SyncError::RemoteReadFailed, "list memories")
      .await?;
    let mut records = self
      .rows(response, SyncError::RemoteReadFailed, "list memories")
      .await?;

    // Stable re-sort: the server order breaks ties.
    match order {
      ListOrder::NewestFirst => sort_newest_first(&mut records),
      ListOrder::OldestFirst => records.sort_by_key(|r| r.created_at),
    }
    Ok(records)
  }

  async fn upload_asset(&self, bytes: Vec<u8>) -> Result<String> {
    if bytes.is_empty() {
      return Err(SyncError::UploadFailed("refusing to upload an empty file".to_string()));
    }

    let (name, mime) = object_name(&bytes);
    let request = self
      .http
      .post(self.upload_url(&name)?)
      .header(header::CONTENT_TYPE, mime)
      .header("x-upsert", "true")
      .body(bytes);

    self
      .send(request, SyncError::UploadFailed, "upload image")
      .await?;

    let url = self
      .public_url(&name)
      .map_err(|e| SyncError::UploadFailed(e.to_string()))?;
    debug!(%url, "uploaded image");
    Ok(url.to_string())
  }
}
