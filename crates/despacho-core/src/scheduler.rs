use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::message::Message;

/// A message parked until its due time.
#[derive(Debug, Clone)]
pub struct Scheduled {
    pub id: Uuid,
    pub message: Message,
    /// Opaque delivery context handed back with the message when due.
    pub context: HashMap<String, String>,
    pub due_at: Instant,
}

/// Callback invoked with each due entry. The composition root points this
/// back at the dispatch pipeline (via the outbox) so delayed messages
/// rejoin the normal delivery path.
pub trait ScheduleConsumer: Send + Sync {
    fn consume(&self, job: Scheduled);
}

impl<F> ScheduleConsumer for F
where
    F: Fn(Scheduled) + Send + Sync,
{
    fn consume(&self, job: Scheduled) {
        self(job)
    }
}

struct SchedulerInner {
    /// Pending entries, always sorted ascending by `due_at`. Insertion,
    /// drain, and cancel all take this one lock — the list is never
    /// walked without it.
    entries: Mutex<Vec<Scheduled>>,
    clock: Arc<dyn Clock>,
}

impl SchedulerInner {
    fn lock_entries(&self) -> MutexGuard<'_, Vec<Scheduled>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pop every entry strictly past its due time, in due order.
    fn drain_due(&self) -> Vec<Scheduled> {
        let now = self.clock.now();
        let mut entries = self.lock_entries();
        let due = entries.partition_point(|entry| entry.due_at < now);
        entries.drain(..due).collect()
    }
}

/// Time-ordered list of pending messages, drained by a recurring timer and
/// handed to a consumer callback at or after their due time.
pub struct MessageScheduler {
    inner: Arc<SchedulerInner>,
}

impl MessageScheduler {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                entries: Mutex::new(Vec::new()),
                clock,
            }),
        }
    }

    /// Park `message` until `due_at`. Returns the entry id for `cancel`.
    pub fn schedule_at(
        &self,
        due_at: Instant,
        message: Message,
        context: HashMap<String, String>,
    ) -> Uuid {
        let id = Uuid::now_v7();
        let entry = Scheduled {
            id,
            message,
            context,
            due_at,
        };
        let mut entries = self.inner.lock_entries();
        // Insert after any entry with the same due time, preserving
        // insertion order among ties
        let position = entries.partition_point(|existing| existing.due_at <= due_at);
        entries.insert(position, entry);
        debug!(schedule_id = %id, "message scheduled");
        id
    }

    /// Park `message` for `delay` from now.
    pub fn schedule_in(
        &self,
        delay: Duration,
        message: Message,
        context: HashMap<String, String>,
    ) -> Uuid {
        self.schedule_at(self.inner.clock.now() + delay, message, context)
    }

    /// Remove a pending entry by linear scan. Returns false when the entry
    /// was already consumed or cancelled.
    pub fn cancel(&self, id: Uuid) -> bool {
        let mut entries = self.inner.lock_entries();
        match entries.iter().position(|entry| entry.id == id) {
            Some(position) => {
                entries.remove(position);
                debug!(schedule_id = %id, "scheduled message cancelled");
                true
            }
            None => false,
        }
    }

    /// Pop every entry whose due time has passed, earliest first.
    pub fn drain_due(&self) -> Vec<Scheduled> {
        self.inner.drain_due()
    }

    pub fn pending(&self) -> usize {
        self.inner.lock_entries().len()
    }

    /// Drain on a recurring timer, handing each due entry to `consumer`.
    /// The returned handle stops the loop on `shutdown()` or drop.
    pub fn spawn(
        &self,
        initial_delay: Duration,
        period: Duration,
        consumer: Arc<dyn ScheduleConsumer>,
    ) -> SchedulerHandle {
        let inner = Arc::clone(&self.inner);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let spawned = thread::Builder::new()
            .name("despacho-scheduler".to_string())
            .spawn(move || {
                match stop_rx.recv_timeout(initial_delay) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                    Err(RecvTimeoutError::Timeout) => {}
                }
                loop {
                    for job in inner.drain_due() {
                        consumer.consume(job);
                    }
                    match stop_rx.recv_timeout(period) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {}
                    }
                }
            });
        match spawned {
            Ok(handle) => SchedulerHandle {
                stop: Some(stop_tx),
                thread: Some(handle),
            },
            Err(e) => {
                warn!(error = %e, "failed to spawn scheduler timer");
                SchedulerHandle {
                    stop: None,
                    thread: None,
                }
            }
        }
    }
}

impl Default for MessageScheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns the scheduler timer thread. Dropping the handle stops the loop.
pub struct SchedulerHandle {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Stop the drain loop and wait for it to finish.
    pub fn shutdown(mut self) {
        self.stop_inner();
    }

    fn stop_inner(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.stop_inner();
    }
}
