use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::ChannelConfig;
use crate::consumer::Consumer;
use crate::error::{ChannelError, ConfigError, ConsumerError};
use crate::message::{Message, RoutingKey};

pub const MIN_BUFFER_SIZE: usize = 1;
pub const MAX_BUFFER_SIZE: usize = 10;

/// Bounded front-buffer over a [`Consumer`].
///
/// The buffer holds at most `max_buffer_size` application messages plus
/// one reserved slot for the `Quit` sentinel, so a pump can always be
/// stopped even when the buffer is full. `receive` never blocks
/// indefinitely and never fails on empty — it degrades to the `None`
/// sentinel.
pub struct BufferedChannel {
    topic: RoutingKey,
    buffer: Mutex<VecDeque<Message>>,
    consumer: Box<dyn Consumer>,
    max_buffer_size: usize,
    pull_timeout: Duration,
    closed: AtomicBool,
}

impl BufferedChannel {
    pub fn new(
        topic: impl Into<RoutingKey>,
        consumer: Box<dyn Consumer>,
        config: &ChannelConfig,
    ) -> Result<Self, ConfigError> {
        if !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&config.max_buffer_size) {
            return Err(ConfigError::InvalidBufferSize(config.max_buffer_size));
        }
        Ok(Self {
            topic: topic.into(),
            buffer: Mutex::new(VecDeque::with_capacity(config.max_buffer_size + 1)),
            consumer,
            max_buffer_size: config.max_buffer_size,
            pull_timeout: config.pull_timeout(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn topic(&self) -> &RoutingKey {
        &self.topic
    }

    fn lock_buffer(&self) -> MutexGuard<'_, VecDeque<Message>> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Buffer messages ahead of delivery. Fails without touching the
    /// buffer when the batch would overflow capacity.
    pub fn enqueue(&self, messages: Vec<Message>) -> Result<(), ChannelError> {
        let mut buffer = self.lock_buffer();
        if buffer.len() + messages.len() > self.max_buffer_size {
            return Err(ChannelError::CapacityExceeded {
                requested: messages.len(),
                capacity: self.max_buffer_size,
            });
        }
        buffer.extend(messages);
        Ok(())
    }

    /// [`receive`](BufferedChannel::receive) with the configured default
    /// pull timeout.
    pub fn receive_default(&self) -> Message {
        self.receive(self.pull_timeout)
    }

    /// Next message for the pump: drain the local buffer first; on empty,
    /// pull from the consumer for up to `timeout` and buffer whatever
    /// comes back, then dequeue again; if still empty, return the `None`
    /// sentinel.
    pub fn receive(&self, timeout: Duration) -> Message {
        if let Some(message) = self.lock_buffer().pop_front() {
            return message;
        }
        match self.consumer.receive(timeout) {
            Ok(messages) => {
                let mut buffer = self.lock_buffer();
                for message in messages {
                    // Empty-receive sentinels are not worth buffering; a
                    // Quit coming from the transport is, so it drains in
                    // arrival order like any other message.
                    if !message.is_none() {
                        buffer.push_back(message);
                    }
                }
                buffer.pop_front().unwrap_or_else(Message::none)
            }
            Err(e) => {
                warn!(topic = %self.topic, error = %e, "consumer receive failed");
                Message::none()
            }
        }
    }

    pub fn acknowledge(&self, message: &Message) -> Result<(), ConsumerError> {
        self.consumer.acknowledge(message)
    }

    pub fn reject(&self, message: &Message) -> Result<bool, ConsumerError> {
        self.consumer.reject(message)
    }

    pub fn requeue(&self, message: &Message, delay: Duration) -> Result<bool, ConsumerError> {
        self.consumer.requeue(message, delay)
    }

    /// Signal a clean shutdown: the `Quit` sentinel lands behind everything
    /// already buffered, so a pump drains `m1..mk` before it observes the
    /// stop. Uses the reserved extra slot, so this cannot fail on a full
    /// buffer; a second `stop` while one sentinel is still pending is a
    /// no-op.
    pub fn stop(&self) {
        let mut buffer = self.lock_buffer();
        if buffer.iter().any(Message::is_quit) {
            return;
        }
        buffer.push_back(Message::quit(self.topic.clone()));
        debug!(topic = %self.topic, "stop requested");
    }

    /// Number of buffered messages, the pending sentinel included.
    pub fn buffered(&self) -> usize {
        self.lock_buffer().len()
    }

    /// Release the underlying consumer. Reentrant-safe; also invoked on
    /// drop so a forgotten channel still frees its transport.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.consumer.close();
        debug!(topic = %self.topic, "channel closed");
    }
}

impl Drop for BufferedChannel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InternalBus;
    use crate::config::ConsumerConfig;
    use crate::consumer::InMemoryConsumer;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn channel_over_bus(max_buffer_size: usize) -> (BufferedChannel, Arc<InternalBus>) {
        let bus = Arc::new(InternalBus::new());
        let consumer = InMemoryConsumer::new(
            Arc::clone(&bus),
            "orders",
            &ConsumerConfig {
                ack_timeout_ms: -1,
                ..ConsumerConfig::default()
            },
        );
        let config = ChannelConfig {
            max_buffer_size,
            ..ChannelConfig::default()
        };
        let channel = BufferedChannel::new("orders", Box::new(consumer), &config).unwrap();
        (channel, bus)
    }

    #[test]
    fn buffer_size_is_validated_at_construction() {
        let (_, bus) = channel_over_bus(1);
        for bad in [0usize, 11] {
            let consumer = InMemoryConsumer::new(
                Arc::clone(&bus),
                "orders",
                &ConsumerConfig::default(),
            );
            let config = ChannelConfig {
                max_buffer_size: bad,
                ..ChannelConfig::default()
            };
            let err = match BufferedChannel::new("orders", Box::new(consumer), &config) {
                Err(e) => e,
                Ok(_) => panic!("expected invalid buffer size error"),
            };
            assert!(matches!(err, ConfigError::InvalidBufferSize(b) if b == bad));
        }
    }

    #[test]
    fn enqueue_past_capacity_fails_and_leaves_buffer_intact() {
        let (channel, _bus) = channel_over_bus(2);
        channel
            .enqueue(vec![Message::new("orders", vec![1])])
            .unwrap();

        let overflow = vec![
            Message::new("orders", vec![2]),
            Message::new("orders", vec![3]),
        ];
        let err = channel.enqueue(overflow).unwrap_err();
        assert!(matches!(
            err,
            ChannelError::CapacityExceeded {
                requested: 2,
                capacity: 2
            }
        ));
        assert_eq!(channel.buffered(), 1);
    }

    #[test]
    fn buffered_messages_plus_stop_never_exceed_capacity_plus_one() {
        let (channel, _bus) = channel_over_bus(2);
        channel
            .enqueue(vec![
                Message::new("orders", vec![1]),
                Message::new("orders", vec![2]),
            ])
            .unwrap();

        channel.stop();
        channel.stop(); // reentrant stop does not stack sentinels
        assert_eq!(channel.buffered(), 3);
    }

    #[test]
    fn receive_drains_buffer_then_returns_none_sentinel() {
        let (channel, _bus) = channel_over_bus(2);
        let first = Message::new("orders", vec![1]);
        let second = Message::new("orders", vec![2]);
        channel
            .enqueue(vec![first.clone(), second.clone()])
            .unwrap();

        assert_eq!(channel.receive(Duration::ZERO).id, first.id);
        assert_eq!(channel.receive(Duration::ZERO).id, second.id);
        assert!(channel.receive(Duration::ZERO).is_none());
    }

    #[test]
    fn receive_pulls_from_the_consumer_when_buffer_is_empty() {
        let (channel, bus) = channel_over_bus(2);
        let msg = Message::new("orders", vec![7]);
        bus.enqueue(msg.clone());

        let received = channel.receive(Duration::from_millis(100));
        assert_eq!(received.id, msg.id);

        // The default-timeout variant pulls the same way
        bus.enqueue(Message::new("orders", vec![8]));
        assert_eq!(channel.receive_default().body, vec![8]);
    }

    #[test]
    fn stop_is_observed_after_all_buffered_messages() {
        let (channel, _bus) = channel_over_bus(3);
        let messages: Vec<Message> = (0..3u8)
            .map(|i| Message::new("orders", vec![i]))
            .collect();
        channel.enqueue(messages.clone()).unwrap();
        channel.stop();

        for expected in &messages {
            let got = channel.receive(Duration::ZERO);
            assert_eq!(got.id, expected.id);
            assert!(!got.is_quit());
        }
        assert!(channel.receive(Duration::ZERO).is_quit());
    }

    #[test]
    fn ack_and_requeue_delegate_to_the_consumer() {
        let (channel, bus) = channel_over_bus(2);
        bus.enqueue(Message::new("orders", vec![1]));

        let msg = channel.receive(Duration::from_millis(100));
        channel.acknowledge(&msg).unwrap();

        bus.enqueue(Message::new("orders", vec![2]));
        let msg = channel.receive(Duration::from_millis(100));
        assert!(channel.requeue(&msg, Duration::ZERO).unwrap());

        let redelivered = channel.receive(Duration::from_millis(100));
        assert_eq!(redelivered.id, msg.id);
        assert_eq!(redelivered.handled_count, 1);
    }

    #[test]
    fn close_releases_the_consumer_exactly_once() {
        struct CountingConsumer {
            closes: Arc<AtomicUsize>,
        }
        impl Consumer for CountingConsumer {
            fn receive(&self, _timeout: Duration) -> Result<Vec<Message>, ConsumerError> {
                Ok(vec![Message::none()])
            }
            fn acknowledge(&self, _message: &Message) -> Result<(), ConsumerError> {
                Ok(())
            }
            fn reject(&self, _message: &Message) -> Result<bool, ConsumerError> {
                Ok(true)
            }
            fn requeue(&self, _message: &Message, _delay: Duration) -> Result<bool, ConsumerError> {
                Ok(true)
            }
            fn purge(&self) -> Result<(), ConsumerError> {
                Ok(())
            }
            fn close(&self) {
                self.closes.fetch_add(1, Ordering::SeqCst);
            }
        }

        let closes = Arc::new(AtomicUsize::new(0));
        let channel = BufferedChannel::new(
            "orders",
            Box::new(CountingConsumer {
                closes: Arc::clone(&closes),
            }),
            &ChannelConfig::default(),
        )
        .unwrap();

        channel.close();
        channel.close();
        drop(channel);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
