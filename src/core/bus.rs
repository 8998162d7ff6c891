//! Topic-based publish/subscribe event bus.
//!
//! The bus is an injected service, never ambient global state. Components
//! publish; connections registered by a transport receive matching events
//! over a per-connection queue, so delivery to one subscriber is ordered.
//!
//! Clients that cannot hold a live connection reconstruct state from the
//! store's read operations instead; the bus keeps only a short ring of
//! recent events for catch-up display.

use crate::core::events::Event;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::Sender;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Default capacity of the recent-events ring.
pub const DEFAULT_RECENT_CAPACITY: usize = 200;

/// A subscriber-supplied topic pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicPattern {
    /// Exact topic, `kind:id`.
    Exact(String),
    /// All topics of one kind, `kind:*`.
    Kind(String),
    /// Every topic, `*`.
    All,
}

impl TopicPattern {
    /// Parses a raw pattern string.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        if raw == "*" {
            return Self::All;
        }
        if let Some(kind) = raw.strip_suffix(":*") {
            return Self::Kind(kind.to_string());
        }
        Self::Exact(raw.to_string())
    }

    /// Checks whether a topic matches this pattern.
    #[must_use]
    pub fn matches(&self, topic: &str) -> bool {
        match self {
            Self::All => true,
            Self::Exact(t) => topic == t,
            Self::Kind(kind) => topic
                .split_once(':')
                .is_some_and(|(k, _)| k == kind.as_str()),
        }
    }
}

impl std::fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => write!(f, "*"),
            Self::Kind(kind) => write!(f, "{kind}:*"),
            Self::Exact(t) => write!(f, "{t}"),
        }
    }
}

/// Messages a client sends over the subscription transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { topics: Vec<String> },
    Unsubscribe { topics: Vec<String> },
    Pong,
}

/// Messages the server pushes to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Subscribed {
        topics: Vec<String>,
    },
    Event {
        topic: String,
        event_type: String,
        data: serde_json::Value,
    },
    Ping,
    Error {
        code: String,
        message: String,
    },
}

/// Liveness configuration for the sweep pass.
#[derive(Debug, Clone, Copy)]
pub struct LivenessConfig {
    /// Idle interval after which a connection is probed with a ping.
    pub probe_after: Duration,
    /// Grace period after the probe before the connection is dropped.
    pub drop_after: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            probe_after: Duration::from_secs(30),
            drop_after: Duration::from_secs(10),
        }
    }
}

/// Identifier for a registered connection.
pub type ConnectionId = Uuid;

struct Connection {
    patterns: Vec<TopicPattern>,
    tx: Sender<ServerMessage>,
    last_activity: Instant,
    probed_at: Option<Instant>,
}

struct BusInner {
    connections: HashMap<ConnectionId, Connection>,
    recent: VecDeque<Event>,
}

/// The event bus.
pub struct EventBus {
    inner: Mutex<BusInner>,
    recent_capacity: usize,
}

impl EventBus {
    /// Creates a bus with the default recent-events capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_recent_capacity(DEFAULT_RECENT_CAPACITY)
    }

    /// Creates a bus retaining up to `capacity` recent events.
    #[must_use]
    pub fn with_recent_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(BusInner {
                connections: HashMap::new(),
                recent: VecDeque::new(),
            }),
            recent_capacity: capacity,
        }
    }

    /// Registers a transport connection. The transport owns the receiving
    /// end of `tx` and is responsible for draining it.
    pub fn register(&self, tx: Sender<ServerMessage>) -> ConnectionId {
        let id = Uuid::new_v4();
        let mut inner = self.inner.lock().expect("bus lock poisoned");
        inner.connections.insert(
            id,
            Connection {
                patterns: Vec::new(),
                tx,
                last_activity: Instant::now(),
                probed_at: None,
            },
        );
        id
    }

    /// Removes a connection and all of its subscriptions.
    pub fn disconnect(&self, conn: ConnectionId) {
        let mut inner = self.inner.lock().expect("bus lock poisoned");
        inner.connections.remove(&conn);
    }

    /// Adds topic patterns to a connection and acknowledges with
    /// `subscribed`. Unknown connections are ignored.
    pub fn subscribe(&self, conn: ConnectionId, topics: &[String]) {
        let mut inner = self.inner.lock().expect("bus lock poisoned");
        let Some(connection) = inner.connections.get_mut(&conn) else {
            return;
        };

        for raw in topics {
            let pattern = TopicPattern::parse(raw);
            if !connection.patterns.contains(&pattern) {
                connection.patterns.push(pattern);
            }
        }
        connection.last_activity = Instant::now();
        connection.probed_at = None;

        let ack = ServerMessage::Subscribed {
            topics: topics.to_vec(),
        };
        if connection.tx.send(ack).is_err() {
            inner.connections.remove(&conn);
        }
    }

    /// Removes topic patterns from a connection.
    pub fn unsubscribe(&self, conn: ConnectionId, topics: &[String]) {
        let mut inner = self.inner.lock().expect("bus lock poisoned");
        let Some(connection) = inner.connections.get_mut(&conn) else {
            return;
        };

        for raw in topics {
            let pattern = TopicPattern::parse(raw);
            connection.patterns.retain(|p| p != &pattern);
        }
        connection.last_activity = Instant::now();
    }

    /// Records a pong from a probed connection.
    pub fn pong(&self, conn: ConnectionId) {
        let mut inner = self.inner.lock().expect("bus lock poisoned");
        if let Some(connection) = inner.connections.get_mut(&conn) {
            connection.last_activity = Instant::now();
            connection.probed_at = None;
        }
    }

    /// Handles a decoded client message for a connection.
    pub fn handle_client_message(&self, conn: ConnectionId, message: ClientMessage) {
        match message {
            ClientMessage::Subscribe { topics } => self.subscribe(conn, &topics),
            ClientMessage::Unsubscribe { topics } => self.unsubscribe(conn, &topics),
            ClientMessage::Pong => self.pong(conn),
        }
    }

    /// Publishes an event to every connection with a matching pattern.
    ///
    /// Called by the core components only; external callers read state or
    /// subscribe, they never publish.
    pub fn publish(&self, event: &Event) {
        let mut inner = self.inner.lock().expect("bus lock poisoned");

        inner.recent.push_back(event.clone());
        while inner.recent.len() > self.recent_capacity {
            inner.recent.pop_front();
        }

        let message = ServerMessage::Event {
            topic: event.topic.clone(),
            event_type: event.kind.as_str().to_string(),
            data: event.payload.clone(),
        };

        let mut dead = Vec::new();
        for (id, connection) in &inner.connections {
            if !connection.patterns.iter().any(|p| p.matches(&event.topic)) {
                continue;
            }
            if connection.tx.send(message.clone()).is_err() {
                dead.push(*id);
            }
        }
        for id in dead {
            inner.connections.remove(&id);
        }
    }

    /// Probes idle connections and drops those that missed the pong window.
    ///
    /// Returns the ids of dropped connections.
    pub fn sweep(&self, config: LivenessConfig) -> Vec<ConnectionId> {
        self.sweep_at(config, Instant::now())
    }

    fn sweep_at(&self, config: LivenessConfig, now: Instant) -> Vec<ConnectionId> {
        let mut inner = self.inner.lock().expect("bus lock poisoned");
        let mut dropped = Vec::new();

        for (id, connection) in &mut inner.connections {
            match connection.probed_at {
                Some(probed) => {
                    if now.duration_since(probed) >= config.drop_after {
                        dropped.push(*id);
                    }
                }
                None => {
                    if now.duration_since(connection.last_activity) >= config.probe_after {
                        if connection.tx.send(ServerMessage::Ping).is_err() {
                            dropped.push(*id);
                        } else {
                            connection.probed_at = Some(now);
                        }
                    }
                }
            }
        }

        for id in &dropped {
            inner.connections.remove(id);
        }
        dropped
    }

    /// Returns up to `limit` most recent events, newest first.
    #[must_use]
    pub fn recent(&self, limit: usize) -> Vec<Event> {
        let inner = self.inner.lock().expect("bus lock poisoned");
        inner.recent.iter().rev().take(limit).cloned().collect()
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        let inner = self.inner.lock().expect("bus lock poisoned");
        inner.connections.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::EventKind;
    use serde_json::json;
    use std::sync::mpsc;

    fn event(topic: &str) -> Event {
        Event::new(topic, EventKind::TaskUpdated, json!({}))
    }

    #[test]
    fn pattern_matching() {
        assert!(TopicPattern::parse("*").matches("task:1"));
        assert!(TopicPattern::parse("task:*").matches("task:1"));
        assert!(!TopicPattern::parse("task:*").matches("stream:1"));
        assert!(TopicPattern::parse("stream:auth").matches("stream:auth"));
        assert!(!TopicPattern::parse("stream:auth").matches("stream:db"));
    }

    #[test]
    fn publish_reaches_matching_connections_only() {
        let bus = EventBus::new();

        let (tx_a, rx_a) = mpsc::channel();
        let a = bus.register(tx_a);
        bus.subscribe(a, &["task:*".to_string()]);

        let (tx_b, rx_b) = mpsc::channel();
        let b = bus.register(tx_b);
        bus.subscribe(b, &["stream:auth".to_string()]);

        // Drain the subscribed acks.
        assert!(matches!(
            rx_a.try_recv().unwrap(),
            ServerMessage::Subscribed { .. }
        ));
        assert!(matches!(
            rx_b.try_recv().unwrap(),
            ServerMessage::Subscribed { .. }
        ));

        bus.publish(&event("task:42"));

        match rx_a.try_recv().unwrap() {
            ServerMessage::Event { topic, .. } => assert_eq!(topic, "task:42"),
            other => panic!("unexpected message: {other:?}"),
        }
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let (tx, rx) = mpsc::channel();
        let conn = bus.register(tx);
        bus.subscribe(conn, &["task:*".to_string()]);
        let _ = rx.try_recv();

        bus.unsubscribe(conn, &["task:*".to_string()]);
        bus.publish(&event("task:1"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn delivery_is_publish_ordered_per_connection() {
        let bus = EventBus::new();
        let (tx, rx) = mpsc::channel();
        let conn = bus.register(tx);
        bus.subscribe(conn, &["*".to_string()]);
        let _ = rx.try_recv();

        bus.publish(&event("task:1"));
        bus.publish(&event("task:2"));
        bus.publish(&event("task:3"));

        let topics: Vec<String> = (0..3)
            .map(|_| match rx.try_recv().unwrap() {
                ServerMessage::Event { topic, .. } => topic,
                other => panic!("unexpected message: {other:?}"),
            })
            .collect();
        assert_eq!(topics, ["task:1", "task:2", "task:3"]);
    }

    #[test]
    fn sweep_probes_then_drops_silent_connections() {
        let bus = EventBus::new();
        let (tx, rx) = mpsc::channel();
        let conn = bus.register(tx);
        bus.subscribe(conn, &["*".to_string()]);
        let _ = rx.try_recv();

        let config = LivenessConfig {
            probe_after: Duration::from_secs(0),
            drop_after: Duration::from_secs(0),
        };

        // First sweep probes.
        let dropped = bus.sweep(config);
        assert!(dropped.is_empty());
        assert!(matches!(rx.try_recv().unwrap(), ServerMessage::Ping));

        // No pong: second sweep drops.
        let dropped = bus.sweep(config);
        assert_eq!(dropped, vec![conn]);
        assert_eq!(bus.connection_count(), 0);
    }

    #[test]
    fn pong_keeps_connection_alive() {
        let bus = EventBus::new();
        let (tx, rx) = mpsc::channel();
        let conn = bus.register(tx);
        bus.subscribe(conn, &["*".to_string()]);
        let _ = rx.try_recv();

        let config = LivenessConfig {
            probe_after: Duration::from_secs(0),
            drop_after: Duration::from_secs(3600),
        };

        assert!(bus.sweep(config).is_empty());
        bus.pong(conn);
        assert!(bus.sweep(config).is_empty());
        assert_eq!(bus.connection_count(), 1);
    }

    #[test]
    fn dropped_receiver_is_pruned_on_publish() {
        let bus = EventBus::new();
        let (tx, rx) = mpsc::channel();
        let conn = bus.register(tx);
        bus.subscribe(conn, &["*".to_string()]);
        let _ = rx.try_recv();
        drop(rx);

        bus.publish(&event("task:1"));
        assert_eq!(bus.connection_count(), 0);
        bus.disconnect(conn); // no-op, already gone
    }

    #[test]
    fn recent_ring_is_bounded_and_newest_first() {
        let bus = EventBus::with_recent_capacity(2);
        bus.publish(&event("task:1"));
        bus.publish(&event("task:2"));
        bus.publish(&event("task:3"));

        let recent = bus.recent(10);
        let topics: Vec<&str> = recent.iter().map(|e| e.topic.as_str()).collect();
        assert_eq!(topics, ["task:3", "task:2"]);
    }

    #[test]
    fn client_messages_round_trip() {
        let msg = ClientMessage::Subscribe {
            topics: vec!["task:*".to_string()],
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"subscribe\""));
        let restored: ClientMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, msg);

        let pong: ClientMessage = serde_json::from_str(r#"{"type":"pong"}"#).unwrap();
        assert_eq!(pong, ClientMessage::Pong);
    }
}
