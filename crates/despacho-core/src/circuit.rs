use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::message::RoutingKey;

/// Per-topic cooldown counter that suppresses publication attempts to
/// topics that have recently failed.
///
/// Advisory only: the dispatch pipeline and sweeper exclude `tripped()`
/// topics from their outstanding-message queries; nothing here blocks a
/// send by itself. Owned by the composition root and passed by reference —
/// process-wide sharing is the caller's explicit choice, not a hidden
/// static.
pub struct CircuitBreaker {
    topics: Mutex<HashMap<RoutingKey, u32>>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
        }
    }

    fn lock_topics(&self) -> MutexGuard<'_, HashMap<RoutingKey, u32>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start (or restart) a cooldown for `topic`. The last trip wins;
    /// counts do not accumulate. A topic tripped with `cool_down_count`
    /// leaves the tripped set after exactly that many [`cool_down`]
    /// cycles. A count of zero does not trip.
    ///
    /// [`cool_down`]: CircuitBreaker::cool_down
    pub fn trip(&self, topic: &RoutingKey, cool_down_count: u32) {
        if cool_down_count == 0 {
            return;
        }
        let mut topics = self.lock_topics();
        // The stored value is the number of remaining cycles after this
        // one's removal step, so the entry leaves the table on the cycle
        // that would take it below zero.
        topics.insert(topic.clone(), cool_down_count - 1);
        debug!(%topic, cool_down_count, "topic tripped");
    }

    /// One cooldown cycle: decrement every tracked topic and drop those
    /// whose counter would go negative. Callers invoke this on a fixed
    /// cadence (the sweeper does, once per sweep cycle). Idempotent once a
    /// topic is absent.
    pub fn cool_down(&self) {
        let mut topics = self.lock_topics();
        topics.retain(|topic, remaining| {
            if *remaining == 0 {
                debug!(%topic, "topic cooled down");
                false
            } else {
                *remaining -= 1;
                true
            }
        });
    }

    /// Snapshot of topics currently cooling down, for the dispatch
    /// pipeline to exclude from outstanding-message queries.
    pub fn tripped(&self) -> Vec<RoutingKey> {
        self.lock_topics().keys().cloned().collect()
    }

    pub fn is_tripped(&self, topic: &RoutingKey) -> bool {
        self.lock_topics().contains_key(topic)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}
