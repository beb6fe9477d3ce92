//! Realtime channel frames (Phoenix JSON v1 as spoken by Supabase Realtime).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use url::Url;

use super::state::PresenceDescriptor;
use crate::config::Endpoint;
use crate::error::{Result, SyncError};
use crate::remote::types::Identity;

const PHOENIX_TOPIC: &str = "phoenix";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
  pub topic: String,
  pub event: String,
  #[serde(default)]
  pub payload: Value,
  #[serde(rename = "ref", default)]
  pub reference: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub join_ref: Option<String>,
}

impl Frame {
  pub fn to_text(&self) -> String {
    // Serializing a struct of strings and a Value cannot fail.
    serde_json::to_string(self).unwrap_or_default()
  }
}

/// `realtime:{room}`
pub fn topic(room: &str) -> String {
  format!("realtime:{}", room)
}

/// Websocket URL for the realtime service of `endpoint`.
pub fn socket_url(endpoint: &Endpoint) -> Result<Url> {
  let mut url = endpoint
    .url
    .join("realtime/v1/websocket")
    .map_err(|e| SyncError::ChannelError(format!("Invalid realtime URL: {}", e)))?;

  let scheme = if url.scheme() == "http" { "ws" } else { "wss" };
  url
    .set_scheme(scheme)
    .map_err(|_| SyncError::ChannelError("Cannot build realtime websocket URL".to_string()))?;
  url
    .query_pairs_mut()
    .append_pair("apikey", &endpoint.api_key)
    .append_pair("vsn", "1.0.0");
  Ok(url)
}

pub fn join(room: &str, instance_id: &str, reference: &str) -> Frame {
  Frame {
    topic: topic(room),
    event: "phx_join".to_string(),
    payload: json!({
      "config": {
        "broadcast": { "self": false },
        "presence": { "key": instance_id }
      }
    }),
    reference: Some(reference.to_string()),
    join_ref: Some(reference.to_string()),
  }
}

/// Announce (or re-announce) this session.
pub fn track(
  room: &str,
  identity: Identity,
  instance_id: &str,
  now: DateTime<Utc>,
  reference: &str,
) -> Frame {
  Frame {
    topic: topic(room),
    event: "presence".to_string(),
    payload: json!({
      "type": "presence",
      "event": "track",
      "payload": {
        "identity": identity,
        "instance_id": instance_id,
        "online_at": now.timestamp_millis()
      }
    }),
    reference: Some(reference.to_string()),
    join_ref: None,
  }
}

pub fn untrack(room: &str, reference: &str) -> Frame {
  Frame {
    topic: topic(room),
    event: "presence".to_string(),
    payload: json!({ "type": "presence", "event": "untrack" }),
    reference: Some(reference.to_string()),
    join_ref: None,
  }
}

pub fn leave(room: &str, reference: &str) -> Frame {
  Frame {
    topic: topic(room),
    event: "phx_leave".to_string(),
    payload: json!({}),
    reference: Some(reference.to_string()),
    join_ref: None,
  }
}

pub fn heartbeat(reference: &str) -> Frame {
  Frame {
    topic: PHOENIX_TOPIC.to_string(),
    event: "heartbeat".to_string(),
    payload: json!({}),
    reference: Some(reference.to_string()),
    join_ref: None,
  }
}

/// Frames the presence task reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
  /// Full roster sync
  State(Vec<PresenceDescriptor>),
  /// Incremental change; `leaves` are instance ids
  Diff {
    joins: Vec<PresenceDescriptor>,
    leaves: Vec<String>,
  },
  /// The server accepted the request with this ref
  Ok(Option<String>),
  /// The channel failed; reconnect
  Error(String),
  /// The server closed the channel; reconnect
  Closed,
  Ignored,
}

#[derive(Debug, Deserialize)]
struct Metas {
  #[serde(default)]
  metas: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct Meta {
  identity: Identity,
  instance_id: String,
}

/// Parse a `{key: {metas: [...]}}` map, skipping metas from other clients
/// that do not carry our fields.
fn descriptors(map: &Value, seen_at: DateTime<Utc>) -> Vec<PresenceDescriptor> {
  let Ok(entries) = serde_json::from_value::<HashMap<String, Metas>>(map.clone()) else {
    return Vec::new();
  };

  entries
    .into_values()
    .flat_map(|entry| entry.metas)
    .filter_map(|meta| serde_json::from_value::<Meta>(meta).ok())
    .map(|meta| PresenceDescriptor {
      identity: meta.identity,
      instance_id: meta.instance_id,
      last_seen_at: seen_at,
    })
    .collect()
}

/// Decode a text frame received at `now`.
pub fn parse(text: &str, room: &str, now: DateTime<Utc>) -> Result<Incoming> {
  let frame: Frame = serde_json::from_str(text)
    .map_err(|e| SyncError::ChannelError(format!("Unreadable frame: {}", e)))?;

  if frame.topic == PHOENIX_TOPIC {
    // Heartbeat replies
    return Ok(match frame.payload["status"].as_str() {
      Some("ok") => Incoming::Ok(frame.reference),
      Some(status) => Incoming::Error(format!("heartbeat {}", status)),
      None => Incoming::Ignored,
    });
  }
  if frame.topic != topic(room) {
    return Ok(Incoming::Ignored);
  }

  let incoming = match frame.event.as_str() {
    "presence_state" => Incoming::State(descriptors(&frame.payload, now)),
    "presence_diff" => Incoming::Diff {
      joins: descriptors(&frame.payload["joins"], now),
      leaves: descriptors(&frame.payload["leaves"], now)
        .into_iter()
        .map(|d| d.instance_id)
        .collect(),
    },
    "phx_reply" => match frame.payload["status"].as_str() {
      Some("ok") => Incoming::Ok(frame.reference),
      _ => Incoming::Error(format!("request rejected: {}", frame.payload["response"])),
    },
    "phx_error" => Incoming::Error("channel crashed".to_string()),
    "phx_close" => Incoming::Closed,
    "system" if frame.payload["status"].as_str() == Some("error") => {
      Incoming::Error(format!("system: {}", frame.payload["message"]))
    }
    _ => Incoming::Ignored,
  };
  Ok(incoming)
}
