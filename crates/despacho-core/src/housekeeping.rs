use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::circuit::CircuitBreaker;
use crate::dispatch::Dispatcher;
use crate::error::ArchiveError;
use crate::outbox::{ArchiveProvider, Outbox};

/// Moves dispatched-but-stale messages out of the outbox, one batch at a
/// time.
pub struct OutboxArchiver {
    outbox: Arc<dyn Outbox>,
    provider: Arc<dyn ArchiveProvider>,
    batch_size: usize,
}

impl OutboxArchiver {
    pub fn new(
        outbox: Arc<dyn Outbox>,
        provider: Arc<dyn ArchiveProvider>,
        batch_size: usize,
    ) -> Self {
        Self {
            outbox,
            provider,
            batch_size: batch_size.max(1),
        }
    }

    /// Archive every message dispatched at least `older_than` ago, paging
    /// through the outbox in `batch_size` chunks. Any failure aborts the
    /// pass and propagates so the caller can retry the whole operation —
    /// a partially archived batch is never resumed implicitly, and the
    /// batch is only deleted from the outbox once the provider has
    /// accepted it.
    pub fn archive(&self, older_than: Duration) -> Result<usize, ArchiveError> {
        let mut total = 0;
        loop {
            let batch = self.outbox.dispatched_messages(older_than, self.batch_size)?;
            if batch.is_empty() {
                break;
            }
            let last_page = batch.len() < self.batch_size;

            let archived = self.provider.archive_batch(&batch)?;
            self.outbox.delete(&archived)?;
            total += archived.len();
            debug!(count = archived.len(), "archived outbox batch");

            if last_page {
                break;
            }
        }
        if total > 0 {
            info!(total, "outbox archive pass complete");
        }
        Ok(total)
    }
}

/// Re-drives undelivered outbox messages through the dispatch pipeline and
/// advances the circuit-breaker cooldown, once per cycle.
pub struct OutboxSweeper {
    outbox: Arc<dyn Outbox>,
    dispatcher: Arc<Dispatcher>,
    breaker: Arc<CircuitBreaker>,
    batch_size: usize,
    min_age: Duration,
}

impl OutboxSweeper {
    pub fn new(
        outbox: Arc<dyn Outbox>,
        dispatcher: Arc<Dispatcher>,
        breaker: Arc<CircuitBreaker>,
        batch_size: usize,
        min_age: Duration,
    ) -> Self {
        Self {
            outbox,
            dispatcher,
            breaker,
            batch_size: batch_size.max(1),
            min_age,
        }
    }

    /// One sweep cycle: cool the breaker, then re-post outstanding
    /// messages in batches, skipping topics still cooling down. Store
    /// failures skip the cycle — the next tick retries.
    pub fn sweep_once(&self) {
        self.breaker.cool_down();
        let excluded = self.breaker.tripped();

        let outstanding = match self.outbox.outstanding_messages(self.min_age, &excluded) {
            Ok(messages) => messages,
            Err(e) => {
                warn!(error = %e, "outstanding query failed, skipping sweep cycle");
                return;
            }
        };
        if outstanding.is_empty() {
            return;
        }
        debug!(count = outstanding.len(), "re-driving outstanding messages");

        for batch in outstanding.chunks(self.batch_size) {
            if let Err(e) = self.dispatcher.post(batch) {
                // A missing producer is a wiring bug on that topic; the
                // remaining batches may still be deliverable.
                warn!(error = %e, "sweep batch failed");
            }
        }
    }

    /// Run the sweeper on its own timer thread. The returned handle stops
    /// the loop on `shutdown()` or drop.
    pub fn spawn(self: Arc<Self>, period: Duration) -> SweeperHandle {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let sweeper = self;
        let spawned = thread::Builder::new()
            .name("despacho-sweeper".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(period) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => sweeper.sweep_once(),
                }
            });
        match spawned {
            Ok(handle) => SweeperHandle {
                stop: Some(stop_tx),
                thread: Some(handle),
            },
            Err(e) => {
                warn!(error = %e, "failed to spawn sweeper timer");
                SweeperHandle {
                    stop: None,
                    thread: None,
                }
            }
        }
    }
}

/// Owns the sweeper timer thread. Dropping the handle stops the loop.
pub struct SweeperHandle {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Stop the sweep loop and wait for it to finish.
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

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.stop_inner();
    }
}
