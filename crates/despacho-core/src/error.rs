use crate::message::RoutingKey;

/// Construction-time errors. These indicate caller bugs and fail fast —
/// nothing here is retried or degraded around.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("channel buffer size {0} out of range (1-10)")]
    InvalidBufferSize(usize),

    #[error("compaction ratio {0} out of range (0.0-1.0)")]
    InvalidCompactionRatio(f64),
}

/// Channel front-buffer errors. A failed enqueue leaves the buffer exactly
/// as it was.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("enqueueing {requested} message(s) would exceed channel capacity {capacity}")]
    CapacityExceeded { requested: usize, capacity: usize },
}

/// Transient producer failure. Absorbed by the retry policy; when retries
/// exhaust it is logged and reflected in the outstanding-message count,
/// never surfaced to the dispatch caller.
#[derive(Debug, thiserror::Error)]
#[error("send failed: {0}")]
pub struct SendError(pub String);

/// Consumer transport errors.
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("consumer transport error: {0}")]
    Transport(String),
}

/// Outbox store errors.
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("outbox store error: {0}")]
    Store(String),
}

/// Archival errors abort the current batch and propagate to the archiver's
/// caller — a partially archived batch must never be silently dropped.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("archive provider error: {0}")]
    Provider(String),

    #[error(transparent)]
    Outbox(#[from] OutboxError),
}

/// Dispatch pipeline errors surfaced to the caller. Transient delivery
/// failures are deliberately absent: those degrade to "re-driven from the
/// outbox later" instead of erroring.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no producer registered for topic {0}")]
    MissingProducer(RoutingKey),
}
