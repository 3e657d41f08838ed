use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Process-wide time abstraction, injected wherever a timing decision is
/// made (lock ages, TTL eviction, dispatch timestamps) so those decisions
/// can be driven deterministically in tests.
pub trait Clock: Send + Sync {
    /// Monotonic now, for ages and deadlines.
    fn now(&self) -> Instant;

    /// Wall-clock now in milliseconds since the Unix epoch, for dispatch
    /// timestamps handed to the outbox.
    fn wall_ms(&self) -> u64;
}

/// The real clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Manually advanced clock for tests. Starts at the construction instant
/// and only moves when `advance` is called.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    wall_base_ms: u64,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            wall_base_ms: SystemClock.wall_ms(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(PoisonError::into_inner);
        *offset += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let offset = self.offset.lock().unwrap_or_else(PoisonError::into_inner);
        self.base + *offset
    }

    fn wall_ms(&self) -> u64 {
        let offset = self.offset.lock().unwrap_or_else(PoisonError::into_inner);
        self.wall_base_ms + offset.as_millis() as u64
    }
}
