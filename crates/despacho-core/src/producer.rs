use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_channel::Receiver;
use tracing::debug;
use uuid::Uuid;

use crate::bus::InternalBus;
use crate::error::{DispatchError, SendError};
use crate::message::{Message, RoutingKey};

/// Broker acknowledgement reported by a self-confirming producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishConfirmation {
    pub message_id: Uuid,
    pub success: bool,
}

/// A producer capable of pushing one message to a broker.
///
/// Producers come in two confirmation modes:
/// - **pipeline-confirms**: `confirmations()` returns `None`; the dispatch
///   pipeline marks the outbox dispatched right after a successful send.
/// - **self-confirming**: `confirmations()` returns the channel on which
///   the producer reports broker acknowledgements; the pipeline polls that
///   channel and marks the outbox from it instead of after the send.
pub trait Producer: Send + Sync {
    /// Topic this producer publishes to.
    fn topic(&self) -> &RoutingKey;

    /// Push one message to the broker. Transient failures are expected
    /// here; the pipeline wraps this call in its retry policy.
    fn send(&self, message: &Message) -> Result<(), SendError>;

    /// Confirmation channel for producers that confirm publication
    /// asynchronously. The default (`None`) selects pipeline-confirms mode.
    fn confirmations(&self) -> Option<Receiver<PublishConfirmation>> {
        None
    }

    /// Release broker resources. Reentrant-safe; invoked by
    /// [`ProducerRegistry::close_all`] during shutdown.
    fn close(&self) {}
}

/// Topic → producer lookup used by the dispatch pipeline. Built once by
/// the composition root, then shared read-only.
pub struct ProducerRegistry {
    producers: HashMap<RoutingKey, Arc<dyn Producer>>,
}

impl ProducerRegistry {
    pub fn new() -> Self {
        Self {
            producers: HashMap::new(),
        }
    }

    /// Register a producer under its own topic. A later registration for
    /// the same topic replaces the earlier one.
    pub fn register(&mut self, producer: Arc<dyn Producer>) {
        let topic = producer.topic().clone();
        debug!(%topic, "producer registered");
        self.producers.insert(topic, producer);
    }

    /// Resolve the producer for a topic. A miss is a wiring bug and fails
    /// fast rather than being retried.
    pub fn lookup(&self, topic: &RoutingKey) -> Result<Arc<dyn Producer>, DispatchError> {
        self.producers
            .get(topic)
            .cloned()
            .ok_or_else(|| DispatchError::MissingProducer(topic.clone()))
    }

    pub fn topics(&self) -> Vec<RoutingKey> {
        self.producers.keys().cloned().collect()
    }

    /// Close every registered producer. Safe to call more than once.
    pub fn close_all(&self) {
        for producer in self.producers.values() {
            producer.close();
        }
    }
}

impl Default for ProducerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Reference producer: publishes straight onto the in-process bus.
pub struct InMemoryProducer {
    topic: RoutingKey,
    bus: Arc<InternalBus>,
}

impl InMemoryProducer {
    pub fn new(topic: impl Into<RoutingKey>, bus: Arc<InternalBus>) -> Self {
        Self {
            topic: topic.into(),
            bus,
        }
    }
}

impl Producer for InMemoryProducer {
    fn topic(&self) -> &RoutingKey {
        &self.topic
    }

    fn send(&self, message: &Message) -> Result<(), SendError> {
        self.bus.enqueue(message.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn lookup_unknown_topic_is_a_missing_producer_error() {
        let registry = ProducerRegistry::new();
        let err = match registry.lookup(&RoutingKey::new("orders")) {
            Err(e) => e,
            Ok(_) => panic!("expected missing producer error"),
        };
        assert!(matches!(err, DispatchError::MissingProducer(_)));
    }

    #[test]
    fn register_then_lookup_round_trips() {
        let bus = Arc::new(InternalBus::new());
        let mut registry = ProducerRegistry::new();
        registry.register(Arc::new(InMemoryProducer::new("orders", Arc::clone(&bus))));

        let producer = registry.lookup(&RoutingKey::new("orders")).unwrap();
        assert_eq!(producer.topic().as_str(), "orders");
    }

    #[test]
    fn in_memory_producer_publishes_to_the_bus() {
        let bus = Arc::new(InternalBus::new());
        let producer = InMemoryProducer::new("orders", Arc::clone(&bus));

        let msg = Message::new("orders", vec![9]);
        producer.send(&msg).unwrap();

        let received = bus.dequeue(&RoutingKey::new("orders"), Duration::ZERO);
        assert_eq!(received.id, msg.id);
    }
}
