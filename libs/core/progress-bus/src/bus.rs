//! Subscriber registry and fanout.

use crate::events::{InboundMessage, ProgressEvent};
use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Cadence of server-initiated heartbeat frames.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// A subscriber with no ping for this long is evicted.
pub const STALE_AFTER: Duration = Duration::from_secs(120);

#[derive(Error, Debug)]
pub enum BusError {
    /// Subscriber limit reached; the transport should close with the
    /// policy-violation code (1008).
    #[error("Connection limit reached ({0})")]
    AtCapacity(usize),
}

struct Subscription {
    sender: mpsc::UnboundedSender<ProgressEvent>,
    prompt_id: Option<String>,
    room: Option<String>,
    connected_at: DateTime<Utc>,
    last_ping: DateTime<Utc>,
}

#[derive(Default)]
struct BusInner {
    connections: HashMap<String, Subscription>,
    by_prompt: HashMap<String, HashSet<String>>,
    by_room: HashMap<String, HashSet<String>>,
}

impl BusInner {
    /// Remove a client from every index. Idempotent.
    fn remove(&mut self, client_id: &str) -> Option<Subscription> {
        let subscription = self.connections.remove(client_id)?;

        if let Some(prompt_id) = &subscription.prompt_id {
            if let Some(members) = self.by_prompt.get_mut(prompt_id) {
                members.remove(client_id);
                if members.is_empty() {
                    self.by_prompt.remove(prompt_id);
                }
            }
        }
        if let Some(room) = &subscription.room {
            if let Some(members) = self.by_room.get_mut(room) {
                members.remove(client_id);
                if members.is_empty() {
                    self.by_room.remove(room);
                }
            }
        }
        Some(subscription)
    }

    fn publish_gauge(&self) {
        gauge!("websocket_connections").set(self.connections.len() as f64);
    }
}

/// Subscriber registry keyed by job (prompt) id and by room.
///
/// All index mutations take the single internal lock; delivery to each
/// subscriber rides its own unbounded channel, so one slow socket never
/// blocks another.
pub struct ProgressBus {
    max_connections: usize,
    stale_after: Duration,
    inner: Mutex<BusInner>,
}

impl ProgressBus {
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            stale_after: STALE_AFTER,
            inner: Mutex::new(BusInner::default()),
        }
    }

    /// Override the idle-eviction threshold (used in tests).
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Register a subscriber. Returns the receiving end the transport must
    /// pump into its socket. Rejects when the connection limit is reached.
    pub async fn subscribe(
        &self,
        client_id: &str,
        prompt_id: Option<String>,
        room: Option<String>,
    ) -> Result<mpsc::UnboundedReceiver<ProgressEvent>, BusError> {
        let mut inner = self.inner.lock().await;

        if !inner.connections.contains_key(client_id)
            && inner.connections.len() >= self.max_connections
        {
            warn!(client_id, "Subscription rejected: max connections reached");
            return Err(BusError::AtCapacity(self.max_connections));
        }

        // Re-subscribing replaces the previous registration.
        let _ = inner.remove(client_id);

        let (sender, receiver) = mpsc::unbounded_channel();
        let now = Utc::now();
        inner.connections.insert(
            client_id.to_string(),
            Subscription {
                sender,
                prompt_id: prompt_id.clone(),
                room: room.clone(),
                connected_at: now,
                last_ping: now,
            },
        );
        if let Some(prompt_id) = prompt_id.as_deref() {
            inner
                .by_prompt
                .entry(prompt_id.to_string())
                .or_default()
                .insert(client_id.to_string());
        }
        if let Some(room) = room.as_deref() {
            inner
                .by_room
                .entry(room.to_string())
                .or_default()
                .insert(client_id.to_string());
        }

        info!(client_id, ?prompt_id, ?room, "Subscriber connected");
        inner.publish_gauge();
        Ok(receiver)
    }

    /// Remove a subscriber from all indices. Idempotent: a second call is a
    /// no-op.
    pub async fn unsubscribe(&self, client_id: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(subscription) = inner.remove(client_id) {
            let connected_secs = (Utc::now() - subscription.connected_at).num_seconds();
            info!(client_id, connected_secs, "Subscriber disconnected");
            inner.publish_gauge();
        }
    }

    /// Best-effort send to one subscriber; a dead channel unsubscribes it.
    pub async fn send(&self, client_id: &str, event: ProgressEvent) {
        let mut inner = self.inner.lock().await;
        let Some(subscription) = inner.connections.get(client_id) else {
            debug!(client_id, "Send to unknown subscriber dropped");
            return;
        };

        if subscription.sender.send(event).is_err() {
            warn!(client_id, "Subscriber channel closed, removing");
            let _ = inner.remove(client_id);
            inner.publish_gauge();
        } else {
            counter!("websocket_events_sent_total").increment(1);
        }
    }

    /// Fan out to every subscriber of a prompt. Per-member failures do not
    /// halt the broadcast.
    pub async fn broadcast_to_prompt(&self, prompt_id: &str, event: ProgressEvent) {
        let mut inner = self.inner.lock().await;
        let Some(members) = inner.by_prompt.get(prompt_id) else {
            return;
        };
        let members: Vec<String> = members.iter().cloned().collect();
        Self::fanout(&mut inner, &members, event);
    }

    /// Fan out to every subscriber in a room.
    pub async fn broadcast_to_room(&self, room: &str, event: ProgressEvent) {
        let mut inner = self.inner.lock().await;
        let Some(members) = inner.by_room.get(room) else {
            return;
        };
        let members: Vec<String> = members.iter().cloned().collect();
        Self::fanout(&mut inner, &members, event);
    }

    /// Fan out to every connected subscriber.
    pub async fn broadcast_all(&self, event: ProgressEvent) {
        let mut inner = self.inner.lock().await;
        let members: Vec<String> = inner.connections.keys().cloned().collect();
        Self::fanout(&mut inner, &members, event);
    }

    fn fanout(inner: &mut BusInner, members: &[String], event: ProgressEvent) {
        let mut dead = Vec::new();
        for client_id in members {
            if let Some(subscription) = inner.connections.get(client_id) {
                if subscription.sender.send(event.clone()).is_err() {
                    dead.push(client_id.clone());
                } else {
                    counter!("websocket_events_sent_total").increment(1);
                }
            }
        }
        for client_id in dead {
            warn!(client_id = %client_id, "Subscriber channel closed during broadcast, removing");
            let _ = inner.remove(&client_id);
        }
        inner.publish_gauge();
    }

    /// Process a frame from a subscriber.
    pub async fn handle_inbound(&self, client_id: &str, message: InboundMessage) {
        match message {
            InboundMessage::Ping => {
                {
                    let mut inner = self.inner.lock().await;
                    if let Some(subscription) = inner.connections.get_mut(client_id) {
                        subscription.last_ping = Utc::now();
                    }
                }
                self.send(client_id, ProgressEvent::Pong).await;
            }
            InboundMessage::Subscribe { prompt_id } => {
                let Some(prompt_id) = prompt_id else { return };
                {
                    let mut inner = self.inner.lock().await;
                    let Some(subscription) = inner.connections.get_mut(client_id) else {
                        return;
                    };
                    let previous = subscription.prompt_id.replace(prompt_id.clone());
                    if let Some(previous) = previous {
                        if let Some(members) = inner.by_prompt.get_mut(&previous) {
                            members.remove(client_id);
                            if members.is_empty() {
                                inner.by_prompt.remove(&previous);
                            }
                        }
                    }
                    inner
                        .by_prompt
                        .entry(prompt_id.clone())
                        .or_default()
                        .insert(client_id.to_string());
                }
                self.send(client_id, ProgressEvent::Subscribed { prompt_id })
                    .await;
            }
            InboundMessage::Unsubscribe => {
                {
                    let mut inner = self.inner.lock().await;
                    let Some(subscription) = inner.connections.get_mut(client_id) else {
                        return;
                    };
                    if let Some(previous) = subscription.prompt_id.take() {
                        if let Some(members) = inner.by_prompt.get_mut(&previous) {
                            members.remove(client_id);
                            if members.is_empty() {
                                inner.by_prompt.remove(&previous);
                            }
                        }
                    }
                }
                self.send(client_id, ProgressEvent::Unsubscribed).await;
            }
            InboundMessage::JoinRoom { room } => {
                let Some(room) = room else { return };
                {
                    let mut inner = self.inner.lock().await;
                    let Some(subscription) = inner.connections.get_mut(client_id) else {
                        return;
                    };
                    let previous = subscription.room.replace(room.clone());
                    if let Some(previous) = previous {
                        if let Some(members) = inner.by_room.get_mut(&previous) {
                            members.remove(client_id);
                            if members.is_empty() {
                                inner.by_room.remove(&previous);
                            }
                        }
                    }
                    inner
                        .by_room
                        .entry(room.clone())
                        .or_default()
                        .insert(client_id.to_string());
                }
                self.send(client_id, ProgressEvent::JoinedRoom { room }).await;
            }
        }
    }

    /// One heartbeat pass: evict peers idle past the threshold, send a
    /// heartbeat frame to everyone else.
    pub async fn heartbeat_tick(&self) {
        let now = Utc::now();
        let stale_after =
            chrono::Duration::from_std(self.stale_after).unwrap_or(chrono::Duration::zero());

        let (stale, alive): (Vec<String>, Vec<String>) = {
            let inner = self.inner.lock().await;
            let mut stale = Vec::new();
            let mut alive = Vec::new();
            for (client_id, subscription) in &inner.connections {
                if now - subscription.last_ping >= stale_after {
                    stale.push(client_id.clone());
                } else {
                    alive.push(client_id.clone());
                }
            }
            (stale, alive)
        };

        for client_id in stale {
            warn!(client_id = %client_id, "Disconnecting stale subscriber");
            self.unsubscribe(&client_id).await;
        }
        for client_id in alive {
            self.send(&client_id, ProgressEvent::Heartbeat).await;
        }
    }

    /// Spawn the background heartbeat loop.
    pub fn spawn_heartbeat(self: &Arc<Self>) -> JoinHandle<()> {
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                bus.heartbeat_tick().await;
            }
        })
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.lock().await.connections.len()
    }

    pub async fn prompt_subscriber_count(&self, prompt_id: &str) -> usize {
        self.inner
            .lock()
            .await
            .by_prompt
            .get(prompt_id)
            .map_or(0, HashSet::len)
    }

    pub async fn room_count(&self, room: &str) -> usize {
        self.inner
            .lock()
            .await
            .by_room
            .get(room)
            .map_or(0, HashSet::len)
    }

    /// Drop every subscriber (shutdown path).
    pub async fn close_all(&self) {
        let mut inner = self.inner.lock().await;
        let count = inner.connections.len();
        inner.connections.clear();
        inner.by_prompt.clear();
        inner.by_room.clear();
        inner.publish_gauge();
        if count > 0 {
            info!(count, "Closed all subscribers");
        }
    }
}
