use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::AsyncConsumer;
use crate::channel::{MAX_BUFFER_SIZE, MIN_BUFFER_SIZE};
use crate::config::ChannelConfig;
use crate::consumer::Consumer;
use crate::error::{ChannelError, ConfigError, ConsumerError};
use crate::message::{Message, RoutingKey};

/// Lifts a blocking [`Consumer`] onto the tokio blocking pool so the
/// in-memory reference consumer can back an [`AsyncChannel`]. Only
/// `receive` can actually block (it parks on the bus); the bookkeeping
/// operations are lock-grab quick and run inline.
pub struct BlockingConsumerAdapter<C> {
    consumer: Arc<C>,
}

impl<C: Consumer + 'static> BlockingConsumerAdapter<C> {
    pub fn new(consumer: C) -> Self {
        Self {
            consumer: Arc::new(consumer),
        }
    }

    pub fn from_arc(consumer: Arc<C>) -> Self {
        Self { consumer }
    }
}

#[async_trait]
impl<C: Consumer + 'static> AsyncConsumer for BlockingConsumerAdapter<C> {
    async fn receive(&self, timeout: Duration) -> Result<Vec<Message>, ConsumerError> {
        let consumer = Arc::clone(&self.consumer);
        tokio::task::spawn_blocking(move || consumer.receive(timeout))
            .await
            .map_err(|e| ConsumerError::Transport(format!("receive task failed: {e}")))?
    }

    async fn acknowledge(&self, message: &Message) -> Result<(), ConsumerError> {
        self.consumer.acknowledge(message)
    }

    async fn reject(&self, message: &Message) -> Result<bool, ConsumerError> {
        self.consumer.reject(message)
    }

    async fn requeue(&self, message: &Message, delay: Duration) -> Result<bool, ConsumerError> {
        self.consumer.requeue(message, delay)
    }

    async fn purge(&self) -> Result<(), ConsumerError> {
        self.consumer.purge()
    }

    async fn close(&self) {
        self.consumer.close();
    }
}

/// Async counterpart of [`crate::channel::BufferedChannel`]: the same
/// bounded front-buffer, sentinel semantics, and drain-then-stop ordering,
/// awaitable instead of blocking.
///
/// Cleanup is explicit — call [`close`](AsyncChannel::close) when done;
/// there is no drop-time fallback because releasing the consumer requires
/// an await.
pub struct AsyncChannel {
    topic: RoutingKey,
    buffer: Mutex<VecDeque<Message>>,
    consumer: Arc<dyn AsyncConsumer>,
    max_buffer_size: usize,
    pull_timeout: Duration,
    closed: AtomicBool,
}

impl AsyncChannel {
    pub fn new(
        topic: impl Into<RoutingKey>,
        consumer: Arc<dyn AsyncConsumer>,
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

    /// Buffer messages ahead of delivery. Fails without touching the
    /// buffer when the batch would overflow capacity.
    pub async fn enqueue(&self, messages: Vec<Message>) -> Result<(), ChannelError> {
        let mut buffer = self.buffer.lock().await;
        if buffer.len() + messages.len() > self.max_buffer_size {
            return Err(ChannelError::CapacityExceeded {
                requested: messages.len(),
                capacity: self.max_buffer_size,
            });
        }
        buffer.extend(messages);
        Ok(())
    }

    /// [`receive`](AsyncChannel::receive) with the configured default pull
    /// timeout.
    pub async fn receive_default(&self) -> Message {
        self.receive(self.pull_timeout).await
    }

    /// Next message for the pump: local buffer first, then one pull from
    /// the consumer, then the `None` sentinel. Never waits longer than
    /// `timeout` and never fails on empty.
    pub async fn receive(&self, timeout: Duration) -> Message {
        if let Some(message) = self.buffer.lock().await.pop_front() {
            return message;
        }
        match self.consumer.receive(timeout).await {
            Ok(messages) => {
                let mut buffer = self.buffer.lock().await;
                for message in messages {
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

    pub async fn acknowledge(&self, message: &Message) -> Result<(), ConsumerError> {
        self.consumer.acknowledge(message).await
    }

    pub async fn reject(&self, message: &Message) -> Result<bool, ConsumerError> {
        self.consumer.reject(message).await
    }

    pub async fn requeue(&self, message: &Message, delay: Duration) -> Result<bool, ConsumerError> {
        self.consumer.requeue(message, delay).await
    }

    /// Append the `Quit` sentinel behind everything already buffered,
    /// using the reserved extra slot. A second stop while one sentinel is
    /// pending is a no-op.
    pub async fn stop(&self) {
        let mut buffer = self.buffer.lock().await;
        if buffer.iter().any(Message::is_quit) {
            return;
        }
        buffer.push_back(Message::quit(self.topic.clone()));
        debug!(topic = %self.topic, "stop requested");
    }

    pub async fn buffered(&self) -> usize {
        self.buffer.lock().await.len()
    }

    /// Release the underlying consumer. Reentrant-safe.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.consumer.close().await;
        debug!(topic = %self.topic, "channel closed");
    }
}
