use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Topic under which a message is routed. Per-topic FIFO order is the only
/// ordering guarantee the bus makes; cross-topic ordering is unspecified.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoutingKey(String);

impl RoutingKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoutingKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for RoutingKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// Message variants. `None` and `Quit` are header-only control sentinels:
/// `None` signals "nothing available" on an empty receive, `Quit` signals a
/// clean pump shutdown. Neither carries a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Normal,
    None,
    Quit,
}

/// Envelope that flows through every component: header fields plus an opaque
/// body. Immutable apart from the bookkeeping the consumer maintains
/// (`handled_count`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub topic: RoutingKey,
    pub kind: MessageKind,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    /// Times this message has been handed back for redelivery.
    pub handled_count: u32,
}

impl Message {
    /// Generate a new UUIDv7 message ID.
    pub fn new_id() -> Uuid {
        Uuid::now_v7()
    }

    pub fn new(topic: impl Into<RoutingKey>, body: Vec<u8>) -> Self {
        Self {
            id: Self::new_id(),
            topic: topic.into(),
            kind: MessageKind::Normal,
            headers: HashMap::new(),
            body,
            handled_count: 0,
        }
    }

    pub fn with_headers(
        topic: impl Into<RoutingKey>,
        headers: HashMap<String, String>,
        body: Vec<u8>,
    ) -> Self {
        Self {
            headers,
            ..Self::new(topic, body)
        }
    }

    /// The "nothing available" sentinel returned by empty receives.
    pub fn none() -> Self {
        Self {
            id: Self::new_id(),
            topic: RoutingKey::new(""),
            kind: MessageKind::None,
            headers: HashMap::new(),
            body: Vec::new(),
            handled_count: 0,
        }
    }

    /// The shutdown sentinel a channel enqueues on `stop`.
    pub fn quit(topic: RoutingKey) -> Self {
        Self {
            id: Self::new_id(),
            topic,
            kind: MessageKind::Quit,
            headers: HashMap::new(),
            body: Vec::new(),
            handled_count: 0,
        }
    }

    pub fn is_none(&self) -> bool {
        self.kind == MessageKind::None
    }

    pub fn is_quit(&self) -> bool {
        self.kind == MessageKind::Quit
    }

    pub fn is_sentinel(&self) -> bool {
        self.kind != MessageKind::Normal
    }

    /// Redelivery-exhaustion primitive: whether this message has been
    /// requeued at least `limit` times. What to do about it (dead-letter,
    /// drop) is the caller's policy, not this crate's.
    pub fn handled_count_reached(&self, limit: u32) -> bool {
        self.handled_count >= limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_message_has_normal_kind_and_zero_handled_count() {
        let msg = Message::new("orders", vec![1, 2, 3]);
        assert_eq!(msg.kind, MessageKind::Normal);
        assert_eq!(msg.handled_count, 0);
        assert_eq!(msg.topic.as_str(), "orders");
        assert!(!msg.is_sentinel());
    }

    #[test]
    fn sentinels_are_header_only() {
        let none = Message::none();
        assert!(none.is_none());
        assert!(none.body.is_empty());

        let quit = Message::quit(RoutingKey::new("orders"));
        assert!(quit.is_quit());
        assert!(quit.is_sentinel());
        assert!(quit.body.is_empty());
        assert_eq!(quit.topic.as_str(), "orders");
    }

    #[test]
    fn handled_count_reached_is_inclusive() {
        let mut msg = Message::new("orders", vec![]);
        assert!(!msg.handled_count_reached(1));
        msg.handled_count = 1;
        assert!(msg.handled_count_reached(1));
        msg.handled_count = 5;
        assert!(msg.handled_count_reached(3));
    }

    #[test]
    fn routing_key_display_and_conversions() {
        let key: RoutingKey = "payments".into();
        assert_eq!(key.to_string(), "payments");
        assert_eq!(RoutingKey::from("payments".to_string()), key);
    }
}
