use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info_span, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::DispatchError;
use crate::message::Message;
use crate::outbox::Outbox;
use crate::producer::ProducerRegistry;
use crate::retry::RetryPolicy;

/// Rate-limited, backgrounded recount of undispatched outbox entries.
///
/// The resulting count is shared state the rest of the system reads for
/// admission decisions. One recount runs at a time system-wide; triggers
/// inside the rate window or during a running recount are dropped, not
/// queued.
#[derive(Clone)]
pub struct OutstandingMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    outbox: Arc<dyn Outbox>,
    clock: Arc<dyn Clock>,
    min_interval: Duration,
    /// Single recount slot, taken with `try_lock`.
    recount_slot: Mutex<()>,
    outstanding: AtomicUsize,
    last_check: Mutex<Option<Instant>>,
}

impl OutstandingMonitor {
    pub fn new(outbox: Arc<dyn Outbox>, min_interval: Duration) -> Self {
        Self::with_clock(outbox, min_interval, Arc::new(SystemClock))
    }

    pub fn with_clock(
        outbox: Arc<dyn Outbox>,
        min_interval: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                outbox,
                clock,
                min_interval,
                recount_slot: Mutex::new(()),
                outstanding: AtomicUsize::new(0),
                last_check: Mutex::new(None),
            }),
        }
    }

    /// Trigger a recount if one is due. A no-op inside the rate window; the
    /// recount itself runs on a background thread so the caller never
    /// waits on it.
    pub fn check(&self) {
        {
            let mut last_check = self
                .inner
                .last_check
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let now = self.inner.clock.now();
            if let Some(previous) = *last_check {
                if now.duration_since(previous) < self.inner.min_interval {
                    return;
                }
            }
            *last_check = Some(now);
        }
        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name("despacho-outstanding".to_string())
            .spawn(move || inner.recount());
        if let Err(e) = spawned {
            warn!(error = %e, "failed to spawn outstanding recount, skipping this cycle");
        }
    }

    /// Last known undispatched backlog.
    pub fn outstanding_count(&self) -> usize {
        self.inner.outstanding.load(Ordering::SeqCst)
    }

    /// Run the recount synchronously. Test hook.
    #[cfg(test)]
    pub(crate) fn recount_now(&self) {
        self.inner.recount();
    }
}

impl MonitorInner {
    fn recount(&self) {
        // A recount already in flight wins; this one is skipped.
        let Ok(_slot) = self.recount_slot.try_lock() else {
            return;
        };
        match self.outbox.outstanding_count(self.min_interval) {
            Ok(count) => {
                self.outstanding.store(count, Ordering::SeqCst);
                debug!(count, "outstanding messages recounted");
            }
            Err(e) => {
                // Fail safe low: a wrong high count could stall dispatch
                // admission, a zero merely waits for the next recount.
                warn!(error = %e, "outstanding recount failed, resetting count");
                self.outstanding.store(0, Ordering::SeqCst);
            }
        }
    }
}

/// Pipeline that pushes outbox-backed messages at producers.
///
/// Transient send failures are absorbed here: the retry policy bounds the
/// attempts, exhaustion is logged and surfaces only through the
/// outstanding-message recount. The outbox remains the source of truth
/// for what is undelivered — the original caller never sees a broker
/// error.
pub struct Dispatcher {
    registry: Arc<ProducerRegistry>,
    outbox: Arc<dyn Outbox>,
    retry: RetryPolicy,
    monitor: OutstandingMonitor,
    clock: Arc<dyn Clock>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ProducerRegistry>,
        outbox: Arc<dyn Outbox>,
        retry: RetryPolicy,
        monitor: OutstandingMonitor,
    ) -> Self {
        Self::with_clock(registry, outbox, retry, monitor, Arc::new(SystemClock))
    }

    pub fn with_clock(
        registry: Arc<ProducerRegistry>,
        outbox: Arc<dyn Outbox>,
        retry: RetryPolicy,
        monitor: OutstandingMonitor,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            outbox,
            retry,
            monitor,
            clock,
        }
    }

    pub fn monitor(&self) -> &OutstandingMonitor {
        &self.monitor
    }

    /// Post a batch under one parent span, one child span per message.
    /// Configuration problems (an unregistered topic) surface as errors;
    /// transient delivery failures do not. Confirmations pending from
    /// self-confirming producers are applied at batch completion.
    pub fn post(&self, messages: &[Message]) -> Result<(), DispatchError> {
        let batch_span = info_span!("dispatch_batch", count = messages.len());
        let _batch = batch_span.enter();
        for message in messages {
            self.post_one(message)?;
        }
        self.drain_confirmations();
        Ok(())
    }

    fn post_one(&self, message: &Message) -> Result<(), DispatchError> {
        let span = info_span!("dispatch", msg_id = %message.id, topic = %message.topic);
        let _guard = span.enter();

        let producer = self.registry.lookup(&message.topic)?;
        match self.retry.execute(|| producer.send(message)) {
            Ok(()) => {
                if producer.confirmations().is_none() {
                    // Pipeline-confirms mode: mark right after the send.
                    // A mark failure is not fatal — the record stays
                    // outstanding and the sweeper re-drives it, which
                    // at-least-once delivery permits.
                    if let Err(e) = self
                        .outbox
                        .mark_dispatched(message.id, self.clock.wall_ms())
                    {
                        warn!(error = %e, msg_id = %message.id, "failed to mark dispatched");
                    } else {
                        debug!(msg_id = %message.id, topic = %message.topic, "message dispatched");
                    }
                } else {
                    debug!(msg_id = %message.id, "sent, awaiting producer confirmation");
                }
            }
            Err(e) => {
                // The outbox still holds the record; the sweeper re-drives
                // it, and the caller only sees the backlog via the
                // outstanding count.
                error!(
                    error = %e,
                    msg_id = %message.id,
                    topic = %message.topic,
                    attempts = self.retry.attempts(),
                    "send failed after retries"
                );
                self.monitor.check();
            }
        }
        Ok(())
    }

    /// Apply confirmations reported by self-confirming producers to the
    /// outbox. Failed publications stay undispatched for the sweeper.
    /// Returns how many confirmations were applied.
    pub fn drain_confirmations(&self) -> usize {
        let mut applied = 0;
        for topic in self.registry.topics() {
            let Ok(producer) = self.registry.lookup(&topic) else {
                continue;
            };
            let Some(confirmations) = producer.confirmations() else {
                continue;
            };
            while let Ok(confirmation) = confirmations.try_recv() {
                if confirmation.success {
                    if let Err(e) = self
                        .outbox
                        .mark_dispatched(confirmation.message_id, self.clock.wall_ms())
                    {
                        warn!(error = %e, msg_id = %confirmation.message_id, "failed to apply confirmation");
                        continue;
                    }
                    applied += 1;
                } else {
                    warn!(
                        msg_id = %confirmation.message_id,
                        %topic,
                        "producer reported failed publication"
                    );
                }
            }
        }
        applied
    }
}
