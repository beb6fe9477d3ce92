use chrono::Utc;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::protocol::{self, Frame, Incoming};
use super::state::{PresenceStatus, Roster};
use super::subscribers::{Subscribers, Subscription};
use crate::config::{Endpoint, PresenceConfig};
use crate::remote::types::Identity;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

const LEAVE_TIMEOUT: Duration = Duration::from_secs(2);
/// Upper bound on waiting for the join reply; shorter heartbeats shorten it.
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

enum Command {
  Announce,
  Leave(oneshot::Sender<()>),
}

struct Session {
  identity: Identity,
  shutdown_tx: watch::Sender<bool>,
  commands: mpsc::UnboundedSender<Command>,
}

impl Session {
  fn shutdown(&self) {
    let _ = self.shutdown_tx.send(true);
  }
}

/// Announces the local identity in the shared room and tracks whether the
/// partner is online.
pub struct PresenceChannel {
  endpoint: Option<Endpoint>,
  config: PresenceConfig,
  instance_id: String,
  subscribers: Arc<Subscribers>,
  session: Mutex<Option<Session>>,
}

impl PresenceChannel {
  pub fn new(endpoint: Option<Endpoint>, config: PresenceConfig) -> Self {
    Self {
      endpoint,
      config,
      instance_id: uuid::Uuid::new_v4().to_string(),
      subscribers: Subscribers::new(),
      session: Mutex::new(None),
    }
  }

  fn session(&self) -> MutexGuard<'_, Option<Session>> {
    self.session.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn instance_id(&self) -> &str {
    &self.instance_id
  }

  /// Identity of the running session, if any.
  pub fn identity(&self) -> Option<Identity> {
    self.session().as_ref().map(|s| s.identity)
  }

  pub fn status(&self) -> PresenceStatus {
    self.subscribers.current()
  }

  pub fn subscribe<F>(&self, callback: F) -> Subscription
  where
    F: Fn(PresenceStatus) + Send + Sync + 'static,
  {
    self.subscribers.subscribe(callback)
  }

  /// Join the room as `identity`, replacing any previous session.
  ///
  /// Without an endpoint, or outside a tokio runtime, the channel stays
  /// offline.
  pub fn join(&self, identity: Identity) {
    let mut slot = self.session();
    if let Some(old) = slot.take() {
      debug!(identity = %old.identity, "Tearing down previous presence session");
      old.shutdown();
    }
    self.subscribers.publish(PresenceStatus::OFFLINE);

    let Some(endpoint) = self.endpoint.clone() else {
      info!("Presence disabled: no remote endpoint configured");
      return;
    };
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
      warn!("Presence disabled: join called outside a tokio runtime");
      return;
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let task = Task {
      endpoint,
      config: self.config.clone(),
      identity,
      instance_id: self.instance_id.clone(),
      subscribers: Arc::clone(&self.subscribers),
      roster: Roster::new(),
      next_ref: 0,
    };
    runtime.spawn(task.run(command_rx, shutdown_rx));

    *slot = Some(Session {
      identity,
      shutdown_tx,
      commands: command_tx,
    });
  }

  /// Re-announce right away, e.g. when the app becomes visible again.
  pub fn announce(&self) {
    if let Some(session) = self.session().as_ref() {
      let _ = session.commands.send(Command::Announce);
    }
  }

  /// Leave the room gracefully and report offline.
  pub async fn leave(&self) {
    let session = self.session().take();
    if let Some(session) = session {
      let (ack_tx, ack_rx) = oneshot::channel();
      if session.commands.send(Command::Leave(ack_tx)).is_ok()
        && tokio::time::timeout(LEAVE_TIMEOUT, ack_rx).await.is_err()
      {
        debug!("Presence leave was not acknowledged in time");
      }
      session.shutdown();
      info!(identity = %session.identity, "Left presence room");
    }
    self.subscribers.publish(PresenceStatus::OFFLINE);
  }
}

impl Drop for PresenceChannel {
  fn drop(&mut self) {
    if let Some(session) = self.session().take() {
      session.shutdown();
    }
  }
}

enum Exit {
  Shutdown,
  Disconnected,
}

/// State owned by the background connection task.
struct Task {
  endpoint: Endpoint,
  config: PresenceConfig,
  identity: Identity,
  instance_id: String,
  subscribers: Arc<Subscribers>,
  roster: Roster,
  next_ref: u64,
}

impl Task {
  fn next_ref(&mut self) -> String {
    self.next_ref += 1;
    self.next_ref.to_string()
  }

  fn publish(&self) {
    self
      .subscribers
      .publish(self.roster.status(self.identity, &self.instance_id));
  }

  fn track(&mut self) -> Frame {
    let reference = self.next_ref();
    protocol::track(
      &self.config.room,
      self.identity,
      &self.instance_id,
      Utc::now(),
      &reference,
    )
  }

  async fn run(
    mut self,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut shutdown_rx: watch::Receiver<bool>,
  ) {
    let mut backoff = Backoff::new(
      Duration::from_millis(self.config.initial_backoff_ms),
      Duration::from_secs(self.config.max_backoff_secs),
      self.config.max_retries,
    );

    loop {
      if *shutdown_rx.borrow() {
        break;
      }

      let exit = self
        .connect(&mut backoff, &mut commands, &mut shutdown_rx)
        .await;

      self.roster.clear();
      // After a shutdown the owner publishes; a replacement session may
      // already be reporting.
      if matches!(exit, Exit::Shutdown) {
        break;
      }
      self.publish();

      let Some(delay) = backoff.next_delay() else {
        info!(
          attempts = backoff.attempts(),
          "Presence unavailable, giving up after repeated failures"
        );
        break;
      };
      warn!("Presence: reconnecting in {delay:?}");

      tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        changed = shutdown_rx.changed() => {
          if changed.is_err() || *shutdown_rx.borrow() {
            break;
          }
        }
        cmd = commands.recv() => match cmd {
          Some(Command::Announce) => {}
          Some(Command::Leave(ack)) => {
            let _ = ack.send(());
            break;
          }
          None => break,
        },
      }
    }

    debug!(instance_id = %self.instance_id, "Presence loop stopped");
  }

  /// One connection lifetime: join, then pump frames until it ends.
  async fn connect(
    &mut self,
    backoff: &mut Backoff,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    shutdown_rx: &mut watch::Receiver<bool>,
  ) -> Exit {
    let url = match protocol::socket_url(&self.endpoint) {
      Ok(url) => url,
      Err(e) => {
        warn!("Presence: {e}");
        return Exit::Disconnected;
      }
    };

    let ws_stream = match tokio_tungstenite::connect_async(url.as_str()).await {
      Ok((stream, _)) => stream,
      Err(e) => {
        warn!("Presence websocket connection failed: {e}");
        return Exit::Disconnected;
      }
    };
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let join_ref = self.next_ref();
    let join = protocol::join(&self.config.room, &self.instance_id, &join_ref);
    if let Err(e) = send(&mut ws_tx, &join).await {
      warn!("Presence join send failed: {e}");
      return Exit::Disconnected;
    }

    let heartbeat = self.config.heartbeat();
    let ttl = chrono::Duration::seconds(self.config.ttl().as_secs() as i64);
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);
    let join_deadline = tokio::time::sleep(heartbeat.min(JOIN_TIMEOUT));
    tokio::pin!(join_deadline);
    let mut joined = false;
    // Ref of the last heartbeat the server has not answered yet
    let mut pending_heartbeat: Option<String> = None;

    loop {
      tokio::select! {
        msg = ws_rx.next() => {
          let text = match msg {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => {
              info!("Presence websocket closed");
              return Exit::Disconnected;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
              warn!("Presence websocket error: {e}");
              return Exit::Disconnected;
            }
          };

          let incoming = match protocol::parse(&text, &self.config.room, Utc::now()) {
            Ok(incoming) => incoming,
            Err(e) => {
              debug!("Presence: {e}");
              continue;
            }
          };

          match incoming {
            Incoming::State(descriptors) => {
              self.roster.replace(descriptors);
              self.publish();
            }
            Incoming::Diff { joins, leaves } => {
              for instance_id in &leaves {
                self.roster.leave(instance_id);
              }
              for descriptor in joins {
                self.roster.join(descriptor);
              }
              self.publish();
            }
            Incoming::Ok(reference) if !joined && reference.as_deref() == Some(join_ref.as_str()) => {
              joined = true;
              backoff.reset();
              info!(identity = %self.identity, room = %self.config.room, "Joined presence room");
              let track = self.track();
              if let Err(e) = send(&mut ws_tx, &track).await {
                warn!("Presence track send failed: {e}");
                return Exit::Disconnected;
              }
            }
            Incoming::Ok(reference) => {
              if reference.is_some() && reference == pending_heartbeat {
                pending_heartbeat = None;
              }
            }
            Incoming::Ignored => {}
            Incoming::Error(reason) => {
              warn!("Presence channel error: {reason}");
              return Exit::Disconnected;
            }
            Incoming::Closed => {
              info!("Presence channel closed by server");
              return Exit::Disconnected;
            }
          }
        }

        _ = &mut join_deadline, if !joined => {
          warn!("Presence join timed out");
          return Exit::Disconnected;
        }

        _ = ticker.tick() => {
          if pending_heartbeat.is_some() {
            warn!("Presence heartbeat timed out");
            return Exit::Disconnected;
          }
          let reference = self.next_ref();
          if let Err(e) = send(&mut ws_tx, &protocol::heartbeat(&reference)).await {
            warn!("Presence heartbeat failed: {e}");
            return Exit::Disconnected;
          }
          pending_heartbeat = Some(reference);
          if joined {
            let track = self.track();
            if let Err(e) = send(&mut ws_tx, &track).await {
              warn!("Presence track send failed: {e}");
              return Exit::Disconnected;
            }
          }
          self.roster.prune(Utc::now(), ttl);
          self.publish();
        }

        cmd = commands.recv() => match cmd {
          Some(Command::Announce) => {
            if joined {
              let track = self.track();
              if let Err(e) = send(&mut ws_tx, &track).await {
                warn!("Presence track send failed: {e}");
                return Exit::Disconnected;
              }
            }
          }
          Some(Command::Leave(ack)) => {
            let untrack_ref = self.next_ref();
            let leave_ref = self.next_ref();
            let untrack = protocol::untrack(&self.config.room, &untrack_ref);
            let leave = protocol::leave(&self.config.room, &leave_ref);
            let _ = send(&mut ws_tx, &untrack).await;
            let _ = send(&mut ws_tx, &leave).await;
            let _ = ws_tx.close().await;
            let _ = ack.send(());
            return Exit::Shutdown;
          }
          None => {
            let _ = ws_tx.close().await;
            return Exit::Shutdown;
          }
        },

        changed = shutdown_rx.changed() => {
          if changed.is_err() || *shutdown_rx.borrow() {
            let _ = ws_tx.close().await;
            return Exit::Shutdown;
          }
        }
      }
    }
  }
}

async fn send(ws_tx: &mut WsSink, frame: &Frame) -> Result<(), tokio_tungstenite::tungstenite::Error> {
  ws_tx.send(Message::Text(frame.to_text())).await
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use tokio::net::TcpListener;

  fn quick_config() -> PresenceConfig {
    PresenceConfig {
      initial_backoff_ms: 10,
      max_backoff_secs: 1,
      max_retries: 1,
      ..PresenceConfig::default()
    }
  }

  async fn wait_for(channel: &PresenceChannel, online: bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
      while channel.status().partner_online != online {
        tokio::time::sleep(Duration::from_millis(10)).await;
      }
    })
    .await
    .expect("presence status did not change in time");
  }

  #[tokio::test]
  async fn test_without_endpoint_stays_offline() {
    let channel = PresenceChannel::new(None, PresenceConfig::default());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _sub = channel.subscribe(move |s| sink.lock().unwrap().push(s));

    channel.join(Identity::A);
    channel.announce();
    assert!(channel.identity().is_none());
    assert_eq!(channel.status(), PresenceStatus::OFFLINE);

    channel.leave().await;
    assert_eq!(*seen.lock().unwrap(), vec![PresenceStatus::OFFLINE]);
  }

  #[tokio::test]
  async fn test_unreachable_server_gives_up_offline() {
    let endpoint = Endpoint::resolve([Some("http://127.0.0.1:9")], [Some("k")]);
    let channel = PresenceChannel::new(endpoint, quick_config());
    channel.join(Identity::B);
    assert_eq!(channel.identity(), Some(Identity::B));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(channel.status(), PresenceStatus::OFFLINE);
    channel.leave().await;
    assert!(channel.identity().is_none());
  }

  async fn next_frame(ws: &mut WebSocketStream<TcpStream>) -> Option<Frame> {
    while let Some(msg) = ws.next().await {
      match msg {
        Ok(Message::Text(text)) => return serde_json::from_str(&text).ok(),
        Ok(Message::Close(_)) | Err(_) => return None,
        Ok(_) => continue,
      }
    }
    None
  }

  #[tokio::test]
  async fn test_partner_seen_through_realtime_room() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
      let (tcp, _) = listener.accept().await.unwrap();
      let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();

      let join = next_frame(&mut ws).await.unwrap();
      assert_eq!(join.event, "phx_join");
      let reply = json!({
        "topic": join.topic.clone(),
        "event": "phx_reply",
        "ref": join.reference,
        "payload": { "status": "ok", "response": {} }
      });
      ws.send(Message::Text(reply.to_string())).await.unwrap();

      let track = next_frame(&mut ws).await.unwrap();
      assert_eq!(track.payload["event"], "track");
      let own_instance = track.payload["payload"]["instance_id"].as_str().unwrap().to_string();

      let mut roster = serde_json::Map::new();
      roster.insert(
        own_instance.clone(),
        json!({ "metas": [{ "identity": "a", "instance_id": own_instance }] }),
      );
      roster.insert(
        "phone".to_string(),
        json!({ "metas": [{ "identity": "b", "instance_id": "phone" }] }),
      );
      let state = json!({
        "topic": join.topic,
        "event": "presence_state",
        "ref": null,
        "payload": roster
      });
      ws.send(Message::Text(state.to_string())).await.unwrap();

      let mut events = Vec::new();
      while let Some(frame) = next_frame(&mut ws).await {
        let leaving = frame.event == "phx_leave";
        events.push(frame.event);
        if leaving {
          break;
        }
      }
      events
    });

    let url = format!("http://{}", addr);
    let endpoint = Endpoint::resolve([Some(url.as_str())], [Some("k")]);
    let channel = PresenceChannel::new(endpoint, quick_config());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _sub = channel.subscribe(move |s| sink.lock().unwrap().push(s));

    channel.join(Identity::A);
    wait_for(&channel, true).await;
    assert_eq!(channel.status().partner, Some(Identity::B));

    channel.leave().await;
    assert_eq!(channel.status(), PresenceStatus::OFFLINE);

    let events = server.await.unwrap();
    assert_eq!(events.last().map(String::as_str), Some("phx_leave"));
    assert!(events.iter().any(|e| e == "presence"));

    let seen = seen.lock().unwrap();
    assert_eq!(seen.first(), Some(&PresenceStatus::OFFLINE));
    assert!(seen.iter().any(|s| s.partner == Some(Identity::B)));
    assert_eq!(seen.last(), Some(&PresenceStatus::OFFLINE));
  }

  fn endpoint_for(addr: std::net::SocketAddr) -> Option<Endpoint> {
    let url = format!("http://{}", addr);
    Endpoint::resolve([Some(url.as_str())], [Some("k")])
  }

  fn reply_ok(topic: &str, reference: Option<String>) -> Message {
    let reply = json!({
      "topic": topic,
      "event": "phx_reply",
      "ref": reference,
      "payload": { "status": "ok", "response": {} }
    });
    Message::Text(reply.to_string())
  }

  #[test]
  fn test_join_outside_runtime_stays_offline() {
    let endpoint = Endpoint::resolve([Some("http://127.0.0.1:9")], [Some("k")]);
    let channel = PresenceChannel::new(endpoint, quick_config());
    channel.join(Identity::A);
    assert!(channel.identity().is_none());
    assert_eq!(channel.status(), PresenceStatus::OFFLINE);
  }

  #[tokio::test]
  async fn test_silent_server_after_join_triggers_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (accepted_tx, mut accepted_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
      let mut open = Vec::new();
      while let Ok((tcp, _)) = listener.accept().await {
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        let join = next_frame(&mut ws).await.unwrap();
        ws.send(reply_ok(&join.topic, join.reference)).await.unwrap();
        let _ = accepted_tx.send(());
        // Socket stays open, nothing is ever answered again.
        open.push(ws);
      }
    });

    let config = PresenceConfig {
      heartbeat_secs: 1,
      ..quick_config()
    };
    let channel = PresenceChannel::new(endpoint_for(addr), config);
    channel.join(Identity::A);

    for _ in 0..2 {
      tokio::time::timeout(Duration::from_secs(6), accepted_rx.recv())
        .await
        .expect("client did not reconnect after unanswered heartbeats")
        .unwrap();
    }
    channel.leave().await;
  }

  #[tokio::test]
  async fn test_unanswered_join_triggers_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (accepted_tx, mut accepted_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
      let mut open = Vec::new();
      while let Ok((tcp, _)) = listener.accept().await {
        let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        let _ = accepted_tx.send(());
        open.push(ws);
      }
    });

    let config = PresenceConfig {
      heartbeat_secs: 1,
      ..quick_config()
    };
    let channel = PresenceChannel::new(endpoint_for(addr), config);
    channel.join(Identity::B);

    for _ in 0..2 {
      tokio::time::timeout(Duration::from_secs(5), accepted_rx.recv())
        .await
        .expect("client kept waiting for the join reply")
        .unwrap();
    }
    assert_eq!(channel.status(), PresenceStatus::OFFLINE);
    channel.leave().await;
  }

  #[tokio::test]
  async fn test_announce_sends_track_right_away() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (ready_tx, ready_rx) = oneshot::channel();

    let server = tokio::spawn(async move {
      let (tcp, _) = listener.accept().await.unwrap();
      let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
      let join = next_frame(&mut ws).await.unwrap();
      ws.send(reply_ok(&join.topic, join.reference.clone())).await.unwrap();

      let first = next_frame(&mut ws).await.unwrap();
      assert_eq!(first.payload["event"], "track");
      let _ = ready_tx.send(());
      next_frame(&mut ws).await
    });

    let channel = PresenceChannel::new(endpoint_for(addr), quick_config());
    channel.join(Identity::B);
    ready_rx.await.unwrap();
    channel.announce();

    let second = tokio::time::timeout(Duration::from_secs(2), server)
      .await
      .expect("announce did not reach the server")
      .unwrap()
      .unwrap();
    assert_eq!(second.event, "presence");
    assert_eq!(second.payload["event"], "track");
    assert_eq!(second.payload["payload"]["identity"], "b");
    channel.leave().await;
  }

  #[tokio::test]
  async fn test_heartbeat_interval_retracks_and_answered_heartbeats_keep_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
      let (tcp, _) = listener.accept().await.unwrap();
      let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
      let join = next_frame(&mut ws).await.unwrap();
      ws.send(reply_ok(&join.topic, join.reference.clone())).await.unwrap();

      let (mut heartbeats, mut tracks) = (0, 0);
      while heartbeats < 2 || tracks < 3 {
        let frame = next_frame(&mut ws).await.expect("client dropped the connection");
        if frame.event == "heartbeat" {
          assert_eq!(frame.topic, "phoenix");
          heartbeats += 1;
          ws.send(reply_ok(&frame.topic, frame.reference.clone())).await.unwrap();
        } else if frame.payload["event"] == "track" {
          tracks += 1;
        }
      }
      (heartbeats, tracks)
    });

    let config = PresenceConfig {
      heartbeat_secs: 1,
      ..quick_config()
    };
    let channel = PresenceChannel::new(endpoint_for(addr), config);
    channel.join(Identity::A);

    let (heartbeats, tracks) = tokio::time::timeout(Duration::from_secs(6), server)
      .await
      .expect("no periodic heartbeat")
      .unwrap();
    assert!(heartbeats >= 2);
    assert!(tracks >= 3);
    channel.leave().await;
  }
}
