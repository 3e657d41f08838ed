//! Reliable at-least-once messaging middleware core.
//!
//! The hot path runs application → [`Dispatcher`] → [`Producer`] → broker →
//! [`Consumer`] → [`BufferedChannel`] → handler → acknowledge/reject/
//! requeue, with the [`Outbox`] as the source of truth for anything not yet
//! confirmed delivered. Housekeeping (outstanding recount, sweeping,
//! archiving, delayed scheduling) runs off the hot path on its own timers.
//! The in-memory bus, consumer, producer, and outbox are the reference
//! transport: they exercise every concurrency and eviction rule without a
//! real broker.

pub mod asynk;
pub mod bus;
pub mod cache;
pub mod channel;
pub mod circuit;
pub mod clock;
pub mod config;
pub mod consumer;
pub mod dispatch;
pub mod error;
pub mod housekeeping;
pub mod message;
pub mod outbox;
pub mod producer;
pub mod retry;
pub mod scheduler;
pub mod telemetry;

pub use bus::InternalBus;
pub use cache::{CacheConfig, EvictionCache};
pub use channel::BufferedChannel;
pub use circuit::CircuitBreaker;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    ChannelConfig, ConsumerConfig, DispatchConfig, RuntimeConfig, SchedulerConfig, SweeperConfig,
};
pub use consumer::{Consumer, InMemoryConsumer, LockedMessage};
pub use dispatch::{Dispatcher, OutstandingMonitor};
pub use error::{
    ArchiveError, ChannelError, ConfigError, ConsumerError, DispatchError, OutboxError, SendError,
};
pub use housekeeping::{OutboxArchiver, OutboxSweeper, SweeperHandle};
pub use message::{Message, MessageKind, RoutingKey};
pub use outbox::{
    ArchiveProvider, InMemoryArchive, InMemoryOutbox, NullArchive, Outbox, OutboxRecord,
};
pub use producer::{InMemoryProducer, Producer, ProducerRegistry, PublishConfirmation};
pub use retry::{Backoff, RetryPolicy};
pub use scheduler::{MessageScheduler, ScheduleConsumer, Scheduled, SchedulerHandle};
