use std::sync::{Arc, Mutex, MutexGuard, Weak};

use super::state::PresenceStatus;

type Callback = Arc<dyn Fn(PresenceStatus) + Send + Sync>;

struct Registry {
  next_id: u64,
  callbacks: Vec<(u64, Callback)>,
  current: PresenceStatus,
}

/// Subscriber list with notify-on-change.
pub struct Subscribers {
  registry: Mutex<Registry>,
}

impl Default for Subscribers {
  fn default() -> Self {
    Self {
      registry: Mutex::new(Registry {
        next_id: 0,
        callbacks: Vec::new(),
        current: PresenceStatus::OFFLINE,
      }),
    }
  }
}

impl Subscribers {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  fn lock(&self) -> MutexGuard<'_, Registry> {
    self.registry.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Register `callback`; it is called right away with the current status
  /// and then on every change.
  pub fn subscribe<F>(self: &Arc<Self>, callback: F) -> Subscription
  where
    F: Fn(PresenceStatus) + Send + Sync + 'static,
  {
    let callback: Callback = Arc::new(callback);
    let (id, current) = {
      let mut registry = self.lock();
      registry.next_id += 1;
      let id = registry.next_id;
      registry.callbacks.push((id, Arc::clone(&callback)));
      (id, registry.current)
    };

    callback(current);
    Subscription {
      id,
      registry: Arc::downgrade(self),
    }
  }

  /// Record `status` and notify subscribers if it changed.
  pub fn publish(&self, status: PresenceStatus) {
    let callbacks: Vec<Callback> = {
      let mut registry = self.lock();
      if registry.current == status {
        return;
      }
      registry.current = status;
      registry.callbacks.iter().map(|(_, cb)| Arc::clone(cb)).collect()
    };

    // Called without the lock held so callbacks may unsubscribe.
    for callback in callbacks {
      callback(status);
    }
  }

  pub fn current(&self) -> PresenceStatus {
    self.lock().current
  }

  pub fn len(&self) -> usize {
    self.lock().callbacks.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  fn remove(&self, id: u64) {
    self.lock().callbacks.retain(|(existing, _)| *existing != id);
  }
}

/// Handle returned by [`Subscribers::subscribe`]. Dropping it keeps the
/// subscription; call [`Subscription::unsubscribe`] to end it.
#[must_use = "keep the handle to be able to unsubscribe"]
pub struct Subscription {
  id: u64,
  registry: Weak<Subscribers>,
}

impl Subscription {
  pub fn unsubscribe(&self) {
    if let Some(registry) = self.registry.upgrade() {
      registry.remove(self.id);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::remote::types::Identity;

  fn online(identity: Identity) -> PresenceStatus {
    PresenceStatus {
      partner_online: true,
      partner: Some(identity),
    }
  }

  #[test]
  fn test_subscriber_gets_current_then_changes_only() {
    let subscribers = Subscribers::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _sub = subscribers.subscribe(move |s| sink.lock().unwrap().push(s));

    subscribers.publish(online(Identity::B));
    subscribers.publish(online(Identity::B));
    subscribers.publish(PresenceStatus::OFFLINE);

    assert_eq!(
      *seen.lock().unwrap(),
      vec![PresenceStatus::OFFLINE, online(Identity::B), PresenceStatus::OFFLINE]
    );
  }

  #[test]
  fn test_unsubscribe_stops_notifications() {
    let subscribers = Subscribers::new();
    let count = Arc::new(Mutex::new(0));
    let sink = Arc::clone(&count);
    let sub = subscribers.subscribe(move |_| *sink.lock().unwrap() += 1);

    sub.unsubscribe();
    subscribers.publish(online(Identity::A));

    assert_eq!(*count.lock().unwrap(), 1);
    assert!(subscribers.is_empty());
  }

  #[test]
  fn test_unsubscribe_from_inside_callback() {
    let subscribers = Subscribers::new();
    let handle: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
    let inner = Arc::clone(&handle);
    let sub = subscribers.subscribe(move |status| {
      if status.partner_online {
        if let Some(sub) = inner.lock().unwrap().as_ref() {
          sub.unsubscribe();
        }
      }
    });
    *handle.lock().unwrap() = Some(sub);

    subscribers.publish(online(Identity::A));
    assert!(subscribers.is_empty());
  }
}
