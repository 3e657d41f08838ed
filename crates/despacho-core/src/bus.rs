use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::message::{Message, RoutingKey};

/// In-process, topic-keyed, blocking multi-producer/multi-consumer queue.
/// This is the reference transport: it exercises every channel and consumer
/// rule without a real broker.
///
/// Per-topic FIFO order is preserved. Cross-topic ordering is unspecified.
pub struct InternalBus {
    topics: Mutex<HashMap<RoutingKey, VecDeque<Message>>>,
    available: Condvar,
}

impl InternalBus {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            available: Condvar::new(),
        }
    }

    fn lock_topics(&self) -> MutexGuard<'_, HashMap<RoutingKey, VecDeque<Message>>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append under the topic from the message header and wake any waiter.
    pub fn enqueue(&self, message: Message) {
        let mut topics = self.lock_topics();
        topics
            .entry(message.topic.clone())
            .or_default()
            .push_back(message);
        drop(topics);
        self.available.notify_all();
    }

    /// Pop the oldest message for `topic`, blocking up to `timeout`.
    /// Returns the `None` sentinel on timeout or absence rather than failing.
    pub fn dequeue(&self, topic: &RoutingKey, timeout: Duration) -> Message {
        let deadline = Instant::now() + timeout;
        let mut topics = self.lock_topics();
        loop {
            if let Some(queue) = topics.get_mut(topic) {
                if let Some(message) = queue.pop_front() {
                    return message;
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Message::none();
            }
            let (guard, _timed_out) = self
                .available
                .wait_timeout(topics, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            topics = guard;
        }
    }

    /// Non-destructive point-in-time snapshot of a topic's queue, not a
    /// live view. For test inspection.
    pub fn stream(&self, topic: &RoutingKey) -> Vec<Message> {
        let topics = self.lock_topics();
        topics
            .get(topic)
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop everything buffered for `topic`. Returns how many messages were
    /// discarded.
    pub fn purge(&self, topic: &RoutingKey) -> usize {
        let mut topics = self.lock_topics();
        let dropped = topics.remove(topic).map(|queue| queue.len()).unwrap_or(0);
        if dropped > 0 {
            debug!(%topic, dropped, "purged topic");
        }
        dropped
    }

    /// Number of messages currently queued for `topic`.
    pub fn depth(&self, topic: &RoutingKey) -> usize {
        let topics = self.lock_topics();
        topics.get(topic).map(VecDeque::len).unwrap_or(0)
    }
}

impl Default for InternalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn topic(name: &str) -> RoutingKey {
        RoutingKey::new(name)
    }

    #[test]
    fn dequeue_preserves_fifo_order_per_topic() {
        let bus = InternalBus::new();
        let first = Message::new("orders", vec![1]);
        let second = Message::new("orders", vec![2]);
        bus.enqueue(first.clone());
        bus.enqueue(second.clone());

        assert_eq!(bus.dequeue(&topic("orders"), Duration::ZERO).id, first.id);
        assert_eq!(bus.dequeue(&topic("orders"), Duration::ZERO).id, second.id);
    }

    #[test]
    fn dequeue_on_empty_topic_returns_none_sentinel() {
        let bus = InternalBus::new();
        let msg = bus.dequeue(&topic("orders"), Duration::from_millis(10));
        assert!(msg.is_none());
    }

    #[test]
    fn topics_are_independent() {
        let bus = InternalBus::new();
        bus.enqueue(Message::new("orders", vec![1]));

        assert!(bus.dequeue(&topic("payments"), Duration::ZERO).is_none());
        assert!(!bus.dequeue(&topic("orders"), Duration::ZERO).is_none());
    }

    #[test]
    fn stream_is_a_snapshot_not_a_live_view() {
        let bus = InternalBus::new();
        bus.enqueue(Message::new("orders", vec![1]));
        bus.enqueue(Message::new("orders", vec![2]));

        let snapshot = bus.stream(&topic("orders"));
        assert_eq!(snapshot.len(), 2);

        // Draining the queue does not affect the snapshot already taken
        bus.dequeue(&topic("orders"), Duration::ZERO);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(bus.stream(&topic("orders")).len(), 1);
    }

    #[test]
    fn blocking_dequeue_wakes_on_enqueue() {
        let bus = Arc::new(InternalBus::new());
        let bus_for_thread = Arc::clone(&bus);

        let handle = std::thread::spawn(move || {
            bus_for_thread.dequeue(&topic("orders"), Duration::from_secs(5))
        });

        // Give the receiver a moment to park, then publish
        std::thread::sleep(Duration::from_millis(20));
        bus.enqueue(Message::new("orders", vec![42]));

        let received = handle.join().unwrap();
        assert_eq!(received.body, vec![42]);
    }

    #[test]
    fn purge_empties_a_single_topic() {
        let bus = InternalBus::new();
        bus.enqueue(Message::new("orders", vec![1]));
        bus.enqueue(Message::new("orders", vec![2]));
        bus.enqueue(Message::new("payments", vec![3]));

        assert_eq!(bus.purge(&topic("orders")), 2);
        assert_eq!(bus.depth(&topic("orders")), 0);
        assert_eq!(bus.depth(&topic("payments")), 1);
    }
}
