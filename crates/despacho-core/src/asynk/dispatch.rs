use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, error, info_span, warn, Instrument};

use super::{AsyncOutbox, AsyncProducer};
use crate::clock::{Clock, SystemClock};
use crate::dispatch::OutstandingMonitor;
use crate::error::DispatchError;
use crate::message::{Message, RoutingKey};
use crate::retry::RetryPolicy;

/// Topic → async producer lookup, mirroring
/// [`crate::producer::ProducerRegistry`].
pub struct AsyncProducerRegistry {
    producers: HashMap<RoutingKey, Arc<dyn AsyncProducer>>,
}

impl AsyncProducerRegistry {
    pub fn new() -> Self {
        Self {
            producers: HashMap::new(),
        }
    }

    pub fn register(&mut self, producer: Arc<dyn AsyncProducer>) {
        let topic = producer.topic().clone();
        debug!(%topic, "async producer registered");
        self.producers.insert(topic, producer);
    }

    pub fn lookup(&self, topic: &RoutingKey) -> Result<Arc<dyn AsyncProducer>, DispatchError> {
        self.producers
            .get(topic)
            .cloned()
            .ok_or_else(|| DispatchError::MissingProducer(topic.clone()))
    }

    pub fn topics(&self) -> Vec<RoutingKey> {
        self.producers.keys().cloned().collect()
    }

    pub async fn close_all(&self) {
        for producer in self.producers.values() {
            producer.close().await;
        }
    }
}

impl Default for AsyncProducerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Async counterpart of [`crate::dispatch::Dispatcher`]: the same retry
/// wrapping, confirmation branch, and swallow-transient-failures contract,
/// with awaited sends. Exhausted retries feed the same thread-backed
/// [`OutstandingMonitor`] — its trigger never blocks the runtime.
pub struct AsyncDispatcher {
    registry: Arc<AsyncProducerRegistry>,
    outbox: Arc<dyn AsyncOutbox>,
    retry: RetryPolicy,
    monitor: OutstandingMonitor,
    clock: Arc<dyn Clock>,
}

impl AsyncDispatcher {
    pub fn new(
        registry: Arc<AsyncProducerRegistry>,
        outbox: Arc<dyn AsyncOutbox>,
        retry: RetryPolicy,
        monitor: OutstandingMonitor,
    ) -> Self {
        Self::with_clock(registry, outbox, retry, monitor, Arc::new(SystemClock))
    }

    pub fn with_clock(
        registry: Arc<AsyncProducerRegistry>,
        outbox: Arc<dyn AsyncOutbox>,
        retry: RetryPolicy,
        monitor: OutstandingMonitor,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            outbox,
            retry,
            monitor,
            clock,
        }
    }

    pub fn monitor(&self) -> &OutstandingMonitor {
        &self.monitor
    }

    /// Post a batch under one parent span, one child span per message.
    /// Unregistered topics surface as errors; transient delivery failures
    /// do not.
    pub async fn post(&self, messages: &[Message]) -> Result<(), DispatchError> {
        let span = info_span!("dispatch_batch", count = messages.len());
        async {
            for message in messages {
                self.post_one(message).await?;
            }
            self.drain_confirmations().await;
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn post_one(&self, message: &Message) -> Result<(), DispatchError> {
        let span = info_span!("dispatch", msg_id = %message.id, topic = %message.topic);
        async {
            let producer = self.registry.lookup(&message.topic)?;
            match self
                .retry
                .execute_async(|| producer.send(message))
                .await
            {
                Ok(()) => {
                    if producer.confirmations().is_none() {
                        if let Err(e) = self
                            .outbox
                            .mark_dispatched(message.id, self.clock.wall_ms())
                            .await
                        {
                            warn!(error = %e, msg_id = %message.id, "failed to mark dispatched");
                        } else {
                            debug!(msg_id = %message.id, topic = %message.topic, "message dispatched");
                        }
                    } else {
                        debug!(msg_id = %message.id, "sent, awaiting producer confirmation");
                    }
                }
                Err(e) => {
                    error!(
                        error = %e,
                        msg_id = %message.id,
                        topic = %message.topic,
                        attempts = self.retry.attempts(),
                        "send failed after retries"
                    );
                    self.monitor.check();
                }
            }
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Apply confirmations reported by self-confirming producers to the
    /// outbox. Returns how many were applied.
    pub async fn drain_confirmations(&self) -> usize {
        let mut applied = 0;
        for topic in self.registry.topics() {
            let Ok(producer) = self.registry.lookup(&topic) else {
                continue;
            };
            let Some(confirmations) = producer.confirmations() else {
                continue;
            };
            while let Ok(confirmation) = confirmations.try_recv() {
                if confirmation.success {
                    if let Err(e) = self
                        .outbox
                        .mark_dispatched(confirmation.message_id, self.clock.wall_ms())
                        .await
                    {
                        warn!(error = %e, msg_id = %confirmation.message_id, "failed to apply confirmation");
                        continue;
                    }
                    applied += 1;
                } else {
                    warn!(
                        msg_id = %confirmation.message_id,
                        %topic,
                        "producer reported failed publication"
                    );
                }
            }
        }
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::clock::ManualClock;
    use crate::error::SendError;
    use crate::outbox::{InMemoryOutbox, Outbox};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct FlakyAsyncProducer {
        topic: RoutingKey,
        failures: u32,
        calls: AtomicU32,
    }

    impl FlakyAsyncProducer {
        fn new(topic: &str, failures: u32) -> Self {
            Self {
                topic: RoutingKey::new(topic),
                failures,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl AsyncProducer for FlakyAsyncProducer {
        fn topic(&self) -> &RoutingKey {
            &self.topic
        }

        async fn send(&self, _message: &Message) -> Result<(), SendError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(SendError("broker unavailable".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn async_dispatcher_with(
        producer: Arc<dyn AsyncProducer>,
        retry: RetryPolicy,
    ) -> (AsyncDispatcher, Arc<InMemoryOutbox>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let outbox = Arc::new(
            InMemoryOutbox::with_clock(CacheConfig::default(), Arc::clone(&clock) as Arc<dyn Clock>).unwrap(),
        );
        let mut registry = AsyncProducerRegistry::new();
        registry.register(producer);
        let monitor = OutstandingMonitor::with_clock(
            Arc::clone(&outbox) as Arc<dyn Outbox>,
            Duration::from_secs(1),
            Arc::clone(&clock) as Arc<dyn Clock>,
        );
        let dispatcher = AsyncDispatcher::with_clock(
            Arc::new(registry),
            Arc::clone(&outbox) as Arc<dyn AsyncOutbox>,
            retry,
            monitor,
            Arc::clone(&clock) as Arc<dyn Clock>,
        );
        (dispatcher, outbox, clock)
    }

    #[tokio::test]
    async fn fail_twice_then_succeed_marks_dispatched_with_three_sends() {
        let producer = Arc::new(FlakyAsyncProducer::new("orders", 2));
        let (dispatcher, outbox, _clock) = async_dispatcher_with(
            Arc::clone(&producer) as Arc<dyn AsyncProducer>,
            RetryPolicy::fixed(3, Duration::ZERO),
        );

        let msg = Message::new("orders", vec![1]);
        Outbox::add(&*outbox, msg.clone()).unwrap();
        dispatcher.post(std::slice::from_ref(&msg)).await.unwrap();

        assert_eq!(producer.calls.load(Ordering::SeqCst), 3);
        assert!(outbox.dispatched_at(&msg.id).is_some());
    }

    #[tokio::test]
    async fn exhausted_retries_are_swallowed() {
        let producer = Arc::new(FlakyAsyncProducer::new("orders", 10));
        let (dispatcher, outbox, _clock) = async_dispatcher_with(
            Arc::clone(&producer) as Arc<dyn AsyncProducer>,
            RetryPolicy::fixed(2, Duration::ZERO),
        );

        let msg = Message::new("orders", vec![1]);
        Outbox::add(&*outbox, msg.clone()).unwrap();
        dispatcher.post(std::slice::from_ref(&msg)).await.unwrap();

        assert_eq!(producer.calls.load(Ordering::SeqCst), 2);
        assert!(outbox.dispatched_at(&msg.id).is_none());
    }

    #[tokio::test]
    async fn missing_producer_fails_fast() {
        let producer = Arc::new(FlakyAsyncProducer::new("orders", 0));
        let (dispatcher, _outbox, _clock) =
            async_dispatcher_with(producer as Arc<dyn AsyncProducer>, RetryPolicy::default());

        let err = dispatcher
            .post(&[Message::new("unrouted", vec![1])])
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::MissingProducer(_)));
    }
}
