use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;
use uuid::Uuid;

use crate::cache::{CacheConfig, EvictionCache};
use crate::clock::{Clock, SystemClock};
use crate::error::{ArchiveError, ConfigError, OutboxError};
use crate::message::{Message, RoutingKey};

/// One outbox row: the message plus its dispatch bookkeeping.
#[derive(Debug, Clone)]
pub struct OutboxRecord {
    pub message: Message,
    pub written_at: Instant,
    /// Wall-clock dispatch time in ms since the epoch; `None` until the
    /// pipeline (or a producer confirmation) marks the message dispatched.
    pub dispatched_at: Option<u64>,
}

/// Durable store of not-yet-confirmed-delivered messages — the source of
/// truth for re-delivery. Write durability is the implementation's
/// business, not this crate's; [`InMemoryOutbox`] exists so every pipeline
/// rule can be exercised without a real store.
pub trait Outbox: Send + Sync {
    fn add(&self, message: Message) -> Result<(), OutboxError>;

    fn mark_dispatched(&self, id: Uuid, at_ms: u64) -> Result<(), OutboxError>;

    /// Messages written at least `older_than` ago and still undispatched,
    /// oldest first, skipping `excluding` topics (those are cooling down).
    fn outstanding_messages(
        &self,
        older_than: Duration,
        excluding: &[RoutingKey],
    ) -> Result<Vec<Message>, OutboxError>;

    /// Count of undispatched messages written at least `older_than` ago,
    /// across all topics.
    fn outstanding_count(&self, older_than: Duration) -> Result<usize, OutboxError>;

    /// Messages dispatched at least `older_than` ago, oldest dispatch
    /// first, at most `batch` of them.
    fn dispatched_messages(
        &self,
        older_than: Duration,
        batch: usize,
    ) -> Result<Vec<Message>, OutboxError>;

    fn delete(&self, ids: &[Uuid]) -> Result<(), OutboxError>;
}

/// Reference outbox over the eviction cache. TTL and capacity bounds keep
/// an abandoned in-memory outbox from growing without limit.
pub struct InMemoryOutbox {
    records: EvictionCache<Uuid, OutboxRecord>,
    clock: Arc<dyn Clock>,
}

impl InMemoryOutbox {
    pub fn new(config: CacheConfig) -> Result<Self, ConfigError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        Ok(Self {
            records: EvictionCache::with_clock(config, Arc::clone(&clock))?,
            clock,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Dispatch timestamp for a message, if it has one. Test inspection.
    pub fn dispatched_at(&self, id: &Uuid) -> Option<u64> {
        self.records.get(id).and_then(|record| record.dispatched_at)
    }
}

impl Outbox for InMemoryOutbox {
    fn add(&self, message: Message) -> Result<(), OutboxError> {
        let record = OutboxRecord {
            written_at: self.clock.now(),
            dispatched_at: None,
            message,
        };
        self.records.insert(record.message.id, record);
        Ok(())
    }

    fn mark_dispatched(&self, id: Uuid, at_ms: u64) -> Result<(), OutboxError> {
        // A miss is tolerated: the record may have been archived or deleted
        // by housekeeping between the send and the confirmation.
        if !self.records.update(&id, |record| {
            record.dispatched_at.get_or_insert(at_ms);
        }) {
            debug!(msg_id = %id, "mark_dispatched on absent outbox record");
        }
        Ok(())
    }

    fn outstanding_messages(
        &self,
        older_than: Duration,
        excluding: &[RoutingKey],
    ) -> Result<Vec<Message>, OutboxError> {
        let now = self.clock.now();
        let mut outstanding: Vec<(Instant, Message)> = self
            .records
            .snapshot()
            .into_iter()
            .filter_map(|(_, record, _)| {
                let old_enough = now.duration_since(record.written_at) >= older_than;
                let undispatched = record.dispatched_at.is_none();
                let allowed = !excluding.contains(&record.message.topic);
                (old_enough && undispatched && allowed)
                    .then_some((record.written_at, record.message))
            })
            .collect();
        outstanding.sort_by_key(|(written_at, _)| *written_at);
        Ok(outstanding.into_iter().map(|(_, message)| message).collect())
    }

    fn outstanding_count(&self, older_than: Duration) -> Result<usize, OutboxError> {
        let now = self.clock.now();
        Ok(self
            .records
            .snapshot()
            .into_iter()
            .filter(|(_, record, _)| {
                record.dispatched_at.is_none()
                    && now.duration_since(record.written_at) >= older_than
            })
            .count())
    }

    fn dispatched_messages(
        &self,
        older_than: Duration,
        batch: usize,
    ) -> Result<Vec<Message>, OutboxError> {
        let wall_now = self.clock.wall_ms();
        let stale_before = wall_now.saturating_sub(older_than.as_millis() as u64);
        let mut dispatched: Vec<(u64, Message)> = self
            .records
            .snapshot()
            .into_iter()
            .filter_map(|(_, record, _)| {
                record
                    .dispatched_at
                    .filter(|at_ms| *at_ms <= stale_before)
                    .map(|at_ms| (at_ms, record.message))
            })
            .collect();
        dispatched.sort_by_key(|(at_ms, _)| *at_ms);
        dispatched.truncate(batch);
        Ok(dispatched.into_iter().map(|(_, message)| message).collect())
    }

    fn delete(&self, ids: &[Uuid]) -> Result<(), OutboxError> {
        for id in ids {
            self.records.remove(id);
        }
        Ok(())
    }
}

/// Archive destination for dispatched-and-stale outbox messages.
pub trait ArchiveProvider: Send + Sync {
    fn archive(&self, message: &Message) -> Result<(), ArchiveError>;

    /// Archive a batch, returning the ids actually archived. The default
    /// stops at the first failure so the caller can retry the whole batch.
    fn archive_batch(&self, messages: &[Message]) -> Result<Vec<Uuid>, ArchiveError> {
        let mut archived = Vec::with_capacity(messages.len());
        for message in messages {
            self.archive(message)?;
            archived.push(message.id);
        }
        Ok(archived)
    }
}

/// Keeps archived messages in an eviction-bounded in-memory store.
pub struct InMemoryArchive {
    messages: EvictionCache<Uuid, Message>,
}

impl InMemoryArchive {
    pub fn new(config: CacheConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            messages: EvictionCache::new(config)?,
        })
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.messages.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }
}

impl ArchiveProvider for InMemoryArchive {
    fn archive(&self, message: &Message) -> Result<(), ArchiveError> {
        self.messages.insert(message.id, message.clone());
        Ok(())
    }
}

/// Discards everything it is given, for deployments that delete dispatched
/// messages rather than keep them.
pub struct NullArchive;

impl ArchiveProvider for NullArchive {
    fn archive(&self, _message: &Message) -> Result<(), ArchiveError> {
        Ok(())
    }
}
