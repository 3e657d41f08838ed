use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::InternalBus;
use crate::clock::{Clock, SystemClock};
use crate::config::ConsumerConfig;
use crate::error::ConsumerError;
use crate::message::{Message, MessageKind, RoutingKey};

/// A message handed to a channel but not yet acknowledged. At most one
/// lock entry exists per message id.
#[derive(Debug, Clone)]
pub struct LockedMessage {
    pub message: Message,
    pub locked_at: Instant,
}

/// Broker-side consumption contract the channel delegates to.
pub trait Consumer: Send + Sync {
    /// Pull available messages, waiting up to `timeout`. Implementations
    /// return a single `None` sentinel when nothing arrives in time —
    /// empty is not an error.
    fn receive(&self, timeout: Duration) -> Result<Vec<Message>, ConsumerError>;

    /// The message was handled; drop its delivery lock.
    fn acknowledge(&self, message: &Message) -> Result<(), ConsumerError>;

    /// The message must not be redelivered here. Routing it onward (to a
    /// dead-letter channel, say) is the caller's decision, not the
    /// consumer's. Returns whether the reject was recorded.
    fn reject(&self, message: &Message) -> Result<bool, ConsumerError>;

    /// Hand the message back to the source, immediately when `delay` is
    /// zero, otherwise after `delay` without blocking the caller.
    fn requeue(&self, message: &Message, delay: Duration) -> Result<bool, ConsumerError>;

    /// Drop everything buffered for this consumer's topic.
    fn purge(&self) -> Result<(), ConsumerError>;

    /// Release transport resources. Reentrant-safe.
    fn close(&self);
}

struct ConsumerShared {
    bus: Arc<InternalBus>,
    topic: RoutingKey,
    locks: Mutex<HashMap<Uuid, LockedMessage>>,
    ack_timeout: Option<Duration>,
    clock: Arc<dyn Clock>,
}

impl ConsumerShared {
    fn lock_table(&self) -> MutexGuard<'_, HashMap<Uuid, LockedMessage>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Clear any lock and put the message back on the bus, bumping its
    /// handled count.
    fn requeue_now(&self, mut message: Message) {
        self.lock_table().remove(&message.id);
        message.handled_count += 1;
        debug!(
            msg_id = %message.id,
            topic = %message.topic,
            handled_count = message.handled_count,
            "message requeued"
        );
        self.bus.enqueue(message);
    }

    /// Force-requeue every locked message whose lock age exceeds the ack
    /// timeout. This is what recovers from a handler that crashed without
    /// acknowledging. Returns how many messages were reclaimed.
    fn reclaim_abandoned(&self) -> usize {
        let Some(timeout) = self.ack_timeout else {
            return 0;
        };
        let now = self.clock.now();
        let abandoned: Vec<Message> = {
            let mut locks = self.lock_table();
            let expired_ids: Vec<Uuid> = locks
                .iter()
                .filter(|(_, locked)| now.duration_since(locked.locked_at) > timeout)
                .map(|(id, _)| *id)
                .collect();
            expired_ids
                .into_iter()
                .filter_map(|id| locks.remove(&id))
                .map(|locked| locked.message)
                .collect()
        };
        let reclaimed = abandoned.len();
        for mut message in abandoned {
            message.handled_count += 1;
            warn!(
                msg_id = %message.id,
                topic = %message.topic,
                handled_count = message.handled_count,
                "ack timeout exceeded, requeueing abandoned message"
            );
            self.bus.enqueue(message);
        }
        reclaimed
    }
}

/// Reference consumer over a topic-scoped view of the [`InternalBus`].
///
/// Every non-sentinel receive records a [`LockedMessage`]; acknowledge and
/// reject clear it. A recurring reclaim timer (period = ack timeout)
/// requeues messages whose lock has aged out, so an unacknowledged
/// delivery is redelivered rather than lost. An ack timeout of `-1` in
/// [`ConsumerConfig`] disables the timer.
pub struct InMemoryConsumer {
    shared: Arc<ConsumerShared>,
    reclaim: Mutex<Option<(Sender<()>, JoinHandle<()>)>>,
}

impl InMemoryConsumer {
    pub fn new(bus: Arc<InternalBus>, topic: impl Into<RoutingKey>, config: &ConsumerConfig) -> Self {
        Self::with_clock(bus, topic, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        bus: Arc<InternalBus>,
        topic: impl Into<RoutingKey>,
        config: &ConsumerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let shared = Arc::new(ConsumerShared {
            bus,
            topic: topic.into(),
            locks: Mutex::new(HashMap::new()),
            ack_timeout: config.ack_timeout(),
            clock,
        });
        let reclaim = shared
            .ack_timeout
            .and_then(|period| spawn_reclaim_loop(Arc::clone(&shared), period));
        Self {
            shared,
            reclaim: Mutex::new(reclaim),
        }
    }

    /// Messages currently locked (received, not yet acknowledged).
    pub fn locked_count(&self) -> usize {
        self.shared.lock_table().len()
    }

    /// Run one reclaim pass synchronously. Test hook.
    #[cfg(test)]
    pub(crate) fn reclaim_now(&self) -> usize {
        self.shared.reclaim_abandoned()
    }
}

/// Recurring reclaim timer: parks on the stop channel for one ack-timeout
/// period, scans on each tick. Spawn failure disables the scan rather than
/// failing construction — the consumer still works, it just cannot recover
/// abandoned messages.
fn spawn_reclaim_loop(
    shared: Arc<ConsumerShared>,
    period: Duration,
) -> Option<(Sender<()>, JoinHandle<()>)> {
    let (stop_tx, stop_rx) = bounded::<()>(1);
    let spawned = thread::Builder::new()
        .name(format!("despacho-reclaim-{}", shared.topic))
        .spawn(move || loop {
            match stop_rx.recv_timeout(period) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    shared.reclaim_abandoned();
                }
            }
        });
    match spawned {
        Ok(handle) => Some((stop_tx, handle)),
        Err(e) => {
            warn!(error = %e, "failed to spawn reclaim timer, ack-timeout recovery disabled");
            None
        }
    }
}

impl Consumer for InMemoryConsumer {
    fn receive(&self, timeout: Duration) -> Result<Vec<Message>, ConsumerError> {
        let message = self.shared.bus.dequeue(&self.shared.topic, timeout);
        if message.kind == MessageKind::Normal {
            let locked = LockedMessage {
                message: message.clone(),
                locked_at: self.shared.clock.now(),
            };
            self.shared.lock_table().insert(message.id, locked);
        }
        Ok(vec![message])
    }

    fn acknowledge(&self, message: &Message) -> Result<(), ConsumerError> {
        if self.shared.lock_table().remove(&message.id).is_some() {
            debug!(msg_id = %message.id, "message acknowledged");
        }
        Ok(())
    }

    fn reject(&self, message: &Message) -> Result<bool, ConsumerError> {
        self.shared.lock_table().remove(&message.id);
        debug!(msg_id = %message.id, topic = %message.topic, "message rejected");
        Ok(true)
    }

    fn requeue(&self, message: &Message, delay: Duration) -> Result<bool, ConsumerError> {
        if delay.is_zero() {
            self.shared.requeue_now(message.clone());
            return Ok(true);
        }
        // One-shot timer; the caller is not blocked for the delay
        let shared = Arc::clone(&self.shared);
        let value = message.clone();
        let fallback = message.clone();
        let spawned = thread::Builder::new()
            .name("despacho-requeue-delay".to_string())
            .spawn(move || {
                thread::sleep(delay);
                shared.requeue_now(value);
            });
        if let Err(e) = spawned {
            warn!(error = %e, "failed to spawn delayed requeue, requeueing immediately");
            self.shared.requeue_now(fallback);
        }
        Ok(true)
    }

    fn purge(&self) -> Result<(), ConsumerError> {
        self.shared.bus.purge(&self.shared.topic);
        self.shared.lock_table().clear();
        Ok(())
    }

    fn close(&self) {
        let stopped = self
            .reclaim
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((stop, handle)) = stopped {
            let _ = stop.send(());
            let _ = handle.join();
            debug!(topic = %self.shared.topic, "consumer closed");
        }
    }
}

impl Drop for InMemoryConsumer {
    fn drop(&mut self) {
        self.close();
    }
}
