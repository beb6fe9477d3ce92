use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

use crate::remote::types::Identity;

/// One announced session of a journal identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceDescriptor {
  pub identity: Identity,
  /// Random per session; tells apart two tabs or devices of one identity
  pub instance_id: String,
  pub last_seen_at: DateTime<Utc>,
}

/// What subscribers are told.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PresenceStatus {
  pub partner_online: bool,
  pub partner: Option<Identity>,
}

impl PresenceStatus {
  pub const OFFLINE: PresenceStatus = PresenceStatus {
    partner_online: false,
    partner: None,
  };
}

/// Every descriptor currently announced in the room, keyed by instance id.
#[derive(Debug, Default)]
pub struct Roster {
  descriptors: HashMap<String, PresenceDescriptor>,
}

impl Roster {
  pub fn new() -> Self {
    Self::default()
  }

  /// Replace the roster with a full state sync.
  pub fn replace(&mut self, descriptors: Vec<PresenceDescriptor>) {
    self.descriptors = descriptors
      .into_iter()
      .map(|d| (d.instance_id.clone(), d))
      .collect();
  }

  /// Add or refresh a descriptor.
  pub fn join(&mut self, descriptor: PresenceDescriptor) {
    self
      .descriptors
      .insert(descriptor.instance_id.clone(), descriptor);
  }

  pub fn leave(&mut self, instance_id: &str) {
    self.descriptors.remove(instance_id);
  }

  pub fn clear(&mut self) {
    self.descriptors.clear();
  }

  /// Drop descriptors not refreshed within `ttl`.
  pub fn prune(&mut self, now: DateTime<Utc>, ttl: Duration) {
    self
      .descriptors
      .retain(|_, d| now - d.last_seen_at <= ttl);
  }

  pub fn len(&self) -> usize {
    self.descriptors.len()
  }

  pub fn is_empty(&self) -> bool {
    self.descriptors.is_empty()
  }

  /// Partner status as seen from the local session.
  ///
  /// A partner is a descriptor with another identity and another instance
  /// id; a second tab of the local identity never counts.
  pub fn status(&self, local_identity: Identity, local_instance: &str) -> PresenceStatus {
    let partner = self
      .descriptors
      .values()
      .find(|d| d.identity != local_identity && d.instance_id != local_instance);

    match partner {
      Some(d) => PresenceStatus {
        partner_online: true,
        partner: Some(d.identity),
      },
      None => PresenceStatus::OFFLINE,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn descriptor(identity: Identity, instance: &str) -> PresenceDescriptor {
    PresenceDescriptor {
      identity,
      instance_id: instance.to_string(),
      last_seen_at: Utc::now(),
    }
  }

  #[test]
  fn test_same_identity_tabs_are_not_partners() {
    let mut roster = Roster::new();
    roster.join(descriptor(Identity::A, "tab-1"));
    roster.join(descriptor(Identity::A, "tab-2"));

    assert_eq!(roster.status(Identity::A, "tab-1"), PresenceStatus::OFFLINE);
    assert_eq!(roster.status(Identity::A, "tab-2"), PresenceStatus::OFFLINE);
  }

  #[test]
  fn test_other_identity_is_partner() {
    let mut roster = Roster::new();
    roster.join(descriptor(Identity::A, "tab-1"));
    roster.join(descriptor(Identity::B, "phone"));

    let status = roster.status(Identity::A, "tab-1");
    assert!(status.partner_online);
    assert_eq!(status.partner, Some(Identity::B));

    let status = roster.status(Identity::B, "phone");
    assert_eq!(status.partner, Some(Identity::A));
  }

  #[test]
  fn test_own_instance_never_counts_even_if_identity_differs() {
    // Switching identity in a session must not report itself as partner.
    let mut roster = Roster::new();
    roster.join(descriptor(Identity::B, "tab-1"));
    assert_eq!(roster.status(Identity::A, "tab-1"), PresenceStatus::OFFLINE);
  }

  #[test]
  fn test_leave_and_replace() {
    let mut roster = Roster::new();
    roster.join(descriptor(Identity::B, "phone"));
    roster.leave("phone");
    assert!(roster.is_empty());

    roster.replace(vec![descriptor(Identity::B, "p1"), descriptor(Identity::A, "t1")]);
    assert_eq!(roster.len(), 2);
    roster.replace(vec![descriptor(Identity::A, "t1")]);
    assert_eq!(roster.status(Identity::A, "t2"), PresenceStatus::OFFLINE);
  }

  #[test]
  fn test_prune_drops_silent_descriptors() {
    let mut roster = Roster::new();
    let mut old = descriptor(Identity::B, "old");
    old.last_seen_at = Utc::now() - Duration::seconds(120);
    roster.join(old);
    roster.join(descriptor(Identity::B, "new"));

    roster.prune(Utc::now(), Duration::seconds(75));
    assert_eq!(roster.len(), 1);
    assert!(roster.status(Identity::A, "me").partner_online);
  }
}
