//! Async variants of the channel and dispatch pipeline, for applications
//! that consume and produce inside a `tokio` runtime. The sync in-memory
//! reference implementations serve both worlds: [`BlockingConsumerAdapter`]
//! lifts any blocking [`Consumer`](crate::consumer::Consumer) onto the
//! blocking pool, and the in-memory outbox implements [`AsyncOutbox`]
//! directly since none of its operations block.

mod channel;
mod dispatch;

pub use channel::{AsyncChannel, BlockingConsumerAdapter};
pub use dispatch::{AsyncDispatcher, AsyncProducerRegistry};

use std::time::Duration;

use async_trait::async_trait;
use crossbeam_channel::Receiver;
use uuid::Uuid;

use crate::error::{ConsumerError, OutboxError, SendError};
use crate::message::{Message, RoutingKey};
use crate::outbox::{InMemoryOutbox, Outbox};
use crate::producer::PublishConfirmation;

/// Async twin of [`crate::consumer::Consumer`].
#[async_trait]
pub trait AsyncConsumer: Send + Sync {
    /// Pull available messages, waiting up to `timeout`. A single `None`
    /// sentinel stands in for "nothing arrived in time".
    async fn receive(&self, timeout: Duration) -> Result<Vec<Message>, ConsumerError>;

    async fn acknowledge(&self, message: &Message) -> Result<(), ConsumerError>;

    async fn reject(&self, message: &Message) -> Result<bool, ConsumerError>;

    async fn requeue(&self, message: &Message, delay: Duration) -> Result<bool, ConsumerError>;

    async fn purge(&self) -> Result<(), ConsumerError>;

    async fn close(&self);
}

/// Async twin of [`crate::producer::Producer`], with the same two
/// confirmation modes.
#[async_trait]
pub trait AsyncProducer: Send + Sync {
    fn topic(&self) -> &RoutingKey;

    async fn send(&self, message: &Message) -> Result<(), SendError>;

    /// `Some` selects self-confirming mode; the default pipeline-confirms.
    fn confirmations(&self) -> Option<Receiver<PublishConfirmation>> {
        None
    }

    async fn close(&self) {}
}

/// Async twin of [`crate::outbox::Outbox`].
#[async_trait]
pub trait AsyncOutbox: Send + Sync {
    async fn add(&self, message: Message) -> Result<(), OutboxError>;

    async fn mark_dispatched(&self, id: Uuid, at_ms: u64) -> Result<(), OutboxError>;

    async fn outstanding_messages(
        &self,
        older_than: Duration,
        excluding: &[RoutingKey],
    ) -> Result<Vec<Message>, OutboxError>;

    async fn dispatched_messages(
        &self,
        older_than: Duration,
        batch: usize,
    ) -> Result<Vec<Message>, OutboxError>;

    async fn delete(&self, ids: &[Uuid]) -> Result<(), OutboxError>;
}

// The in-memory outbox never blocks, so its sync operations double as the
// async implementation.
#[async_trait]
impl AsyncOutbox for InMemoryOutbox {
    async fn add(&self, message: Message) -> Result<(), OutboxError> {
        Outbox::add(self, message)
    }

    async fn mark_dispatched(&self, id: Uuid, at_ms: u64) -> Result<(), OutboxError> {
        Outbox::mark_dispatched(self, id, at_ms)
    }

    async fn outstanding_messages(
        &self,
        older_than: Duration,
        excluding: &[RoutingKey],
    ) -> Result<Vec<Message>, OutboxError> {
        Outbox::outstanding_messages(self, older_than, excluding)
    }

    async fn dispatched_messages(
        &self,
        older_than: Duration,
        batch: usize,
    ) -> Result<Vec<Message>, OutboxError> {
        Outbox::dispatched_messages(self, older_than, batch)
    }

    async fn delete(&self, ids: &[Uuid]) -> Result<(), OutboxError> {
        Outbox::delete(self, ids)
    }
}
