use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use super::message::{
    MAX_MESSAGE_PAYLOAD_LEN, MAX_MESSAGE_TOPIC_LEN, MAX_QOS, MessageState, NewMessage,
    PersistentMessage, RetryPolicy, UserData,
};
use super::sink::DeliverySink;
use crate::utils::lock::lock_within;
use crate::utils::{Clock, Error, Result, SystemClock};

/// Number of message slots in a queue.
pub const MAX_QUEUED_MESSAGES: usize = 64;

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(5000);

/// Runtime options of a delivery queue and its worker.
#[derive(Clone)]
pub struct DeliveryConfig {
    /// Where messages are delivered. Processing refuses to run without one.
    pub sink: Option<Arc<dyn DeliverySink>>,
    /// Applied to messages enqueued without their own policy.
    pub default_retry_policy: RetryPolicy,
    pub queue_check_interval: Duration,
    pub cleanup_interval: Duration,
    pub auto_cleanup_expired: bool,
    pub priority_based_processing: bool,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            sink: None,
            default_retry_policy: RetryPolicy::default(),
            queue_check_interval: Duration::from_millis(1000),
            cleanup_interval: Duration::from_millis(10_000),
            auto_cleanup_expired: true,
            priority_based_processing: true,
        }
    }
}

impl DeliveryConfig {
    pub fn with_sink(mut self, sink: Arc<dyn DeliverySink>) -> Self {
        self.sink = Some(sink);
        self
    }
}

impl fmt::Debug for DeliveryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryConfig")
            .field("sink", &self.sink.as_ref().map(|_| "<sink>"))
            .field("default_retry_policy", &self.default_retry_policy)
            .field("queue_check_interval", &self.queue_check_interval)
            .field("cleanup_interval", &self.cleanup_interval)
            .field("auto_cleanup_expired", &self.auto_cleanup_expired)
            .field("priority_based_processing", &self.priority_based_processing)
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryStats {
    pub total_messages_queued: u64,
    pub messages_delivered: u64,
    pub messages_failed: u64,
    pub messages_expired: u64,
    /// Retries scheduled after a failed attempt.
    pub total_retries_attempted: u64,
    pub queue_full_rejections: u64,
    pub current_queue_size: usize,
    pub peak_queue_size: usize,
    /// Weighted running average of enqueue-to-attempt time.
    pub average_delivery_time_ms: f64,
    pub last_delivery_time_ms: u64,
}

/// What one processing pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessReport {
    pub attempted: usize,
    pub delivered: usize,
    pub retried: usize,
    pub failed: usize,
    pub expired: usize,
    /// Outcomes that could not be recorded because the queue lock timed
    /// out. They are applied at the start of the next pass.
    pub deferred: usize,
}

impl ProcessReport {
    pub fn is_empty(&self) -> bool {
        self.attempted == 0 && self.expired == 0 && self.deferred == 0
    }
}

struct Inner {
    slots: Vec<Option<PersistentMessage>>,
    len: usize,
    next_id: u32,
    config: DeliveryConfig,
    stats: DeliveryStats,
}

impl Inner {
    fn new(config: DeliveryConfig) -> Self {
        Self {
            slots: std::iter::repeat_with(|| None)
                .take(MAX_QUEUED_MESSAGES)
                .collect(),
            len: 0,
            next_id: 1,
            config,
            stats: DeliveryStats::default(),
        }
    }

    fn position(&self, id: u32) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|m| m.id == id))
    }

    fn take_slot(&mut self, index: usize) -> Option<PersistentMessage> {
        let message = self.slots[index].take()?;
        self.len -= 1;
        self.stats.current_queue_size = self.len;
        Some(message)
    }

    fn expire_slot(&mut self, index: usize) -> bool {
        match self.take_slot(index) {
            Some(mut message) => {
                message.state = MessageState::Expired;
                self.stats.messages_expired += 1;
                warn!("Message expired: ID={}", message.id);
                true
            }
            None => false,
        }
    }

    /// Occupied slot indexes in processing order.
    fn processing_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|_| i))
            .collect();
        let by_priority = self.config.priority_based_processing;
        order.sort_by_key(|&i| {
            let message = self.slots[i].as_ref();
            let priority = message.filter(|_| by_priority).map(|m| m.priority);
            let id = message.map_or(0, |m| m.id);
            (std::cmp::Reverse(priority), id)
        });
        order
    }

    /// Books a finished attempt. Messages that left the queue in the
    /// meantime are ignored.
    fn apply_outcome(&mut self, outcome: &Outcome, now: u64, report: &mut ProcessReport) {
        let Some(index) = self.position(outcome.id) else {
            debug!("Message {} left the queue during its attempt", outcome.id);
            return;
        };

        if outcome.delivered {
            self.take_slot(index);
            self.stats.messages_delivered += 1;
            self.stats.last_delivery_time_ms = now;
            self.record_delivery_time(
                outcome
                    .attempted_at_ms
                    .saturating_sub(outcome.created_at_ms),
            );
            report.delivered += 1;
            info!("Message delivered successfully: ID={}", outcome.id);
            return;
        }

        warn!("Message delivery failed: ID={}", outcome.id);
        let Some(message) = self.slots[index].as_mut() else {
            return;
        };

        if message.retry_count >= message.retry_policy.max_retries {
            message.state = MessageState::Failed;
            error!(
                "Message failed after {} retries: ID={}",
                message.retry_count, outcome.id
            );
            self.take_slot(index);
            self.stats.messages_failed += 1;
            report.failed += 1;
        } else {
            let delay = message.retry_policy.backoff_delay_ms(message.retry_count);
            message.retry_count += 1;
            message.next_retry_at_ms = now + delay;
            message.state = MessageState::Pending;
            info!("Retry scheduled: ID={}, delay={}ms", outcome.id, delay);
            self.stats.total_retries_attempted += 1;
            report.retried += 1;
        }
    }

    fn record_delivery_time(&mut self, sample_ms: u64) {
        let sample = sample_ms as f64;
        if self.stats.messages_delivered == 1 {
            self.stats.average_delivery_time_ms = sample;
        } else {
            self.stats.average_delivery_time_ms =
                0.8 * self.stats.average_delivery_time_ms + 0.2 * sample;
        }
    }
}

/// A message picked for an attempt, copied out of its slot.
struct Attempt {
    id: u32,
    topic: String,
    payload: String,
    qos: u8,
    user_data: Option<UserData>,
    created_at_ms: u64,
    attempted_at_ms: u64,
}

impl Attempt {
    fn outcome(&self, delivered: bool) -> Outcome {
        Outcome {
            id: self.id,
            delivered,
            created_at_ms: self.created_at_ms,
            attempted_at_ms: self.attempted_at_ms,
        }
    }
}

/// The result of one sink call, waiting to be booked.
#[derive(Debug, Clone, Copy)]
struct Outcome {
    id: u32,
    delivered: bool,
    created_at_ms: u64,
    attempted_at_ms: u64,
}

/// Fixed-capacity outbound queue with per-message priority, TTL and retry
/// policy.
///
/// The sink is always called without the queue lock held, so a slow
/// transport never stalls `enqueue`, `remove` or `list`.
pub struct DeliveryQueue {
    inner: Mutex<Inner>,
    /// Outcomes whose booking missed the queue lock. Only ever held for a
    /// push or a drain.
    unrecorded: Mutex<Vec<Outcome>>,
    clock: Arc<dyn Clock>,
    lock_timeout: Duration,
}

impl DeliveryQueue {
    pub fn new(config: DeliveryConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: DeliveryConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner::new(config)),
            unrecorded: Mutex::new(Vec::new()),
            clock,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        lock_within(&self.inner, self.lock_timeout, "delivery queue")
    }

    #[cfg(test)]
    pub(crate) fn hold_lock(&self) -> impl Sized + '_ {
        self.inner.lock()
    }

    /// Replaces the whole runtime configuration. Queued messages keep the
    /// retry policy they were enqueued with.
    pub fn configure(&self, config: DeliveryConfig) -> Result<()> {
        self.lock()?.config = config;
        info!("Delivery queue reconfigured");
        Ok(())
    }

    pub fn config(&self) -> Result<DeliveryConfig> {
        Ok(self.lock()?.config.clone())
    }

    pub fn set_delivery_callback(&self, sink: Arc<dyn DeliverySink>) -> Result<()> {
        self.lock()?.config.sink = Some(sink);
        info!("Delivery callback updated");
        Ok(())
    }

    pub fn set_default_retry_policy(&self, policy: RetryPolicy) -> Result<()> {
        self.lock()?.config.default_retry_policy = policy;
        info!("Default retry policy updated");
        Ok(())
    }

    /// Queues a message and returns its id.
    pub fn enqueue(&self, message: NewMessage) -> Result<u32> {
        if message.topic.is_empty() {
            return Err(Error::invalid_argument("message topic is required"));
        }
        if message.topic.len() >= MAX_MESSAGE_TOPIC_LEN
            || message.payload.len() >= MAX_MESSAGE_PAYLOAD_LEN
        {
            error!("Topic or payload too long");
            return Err(Error::invalid_argument(format!(
                "topic must be under {MAX_MESSAGE_TOPIC_LEN} bytes and payload under {MAX_MESSAGE_PAYLOAD_LEN} bytes"
            )));
        }
        if message.qos > MAX_QOS {
            error!("Invalid QoS level: {}", message.qos);
            return Err(Error::invalid_argument(format!(
                "invalid QoS level {}",
                message.qos
            )));
        }

        let mut inner = self.lock()?;

        let Some(index) = inner.slots.iter().position(Option::is_none) else {
            inner.stats.queue_full_rejections += 1;
            warn!("Message queue is full, rejecting message");
            return Err(Error::ResourceExhausted {
                resource: "delivery queue",
                capacity: MAX_QUEUED_MESSAGES,
            });
        };

        let id = inner.next_id;
        inner.next_id += 1;
        let retry_policy = message
            .retry_policy
            .unwrap_or(inner.config.default_retry_policy);

        info!(
            "Message queued: ID={}, topic={}, priority={}, qos={}",
            id, message.topic, message.priority, message.qos
        );
        inner.slots[index] = Some(PersistentMessage {
            id,
            topic: message.topic,
            payload: message.payload,
            priority: message.priority,
            state: MessageState::Pending,
            qos: message.qos,
            retain: message.retain,
            retry_count: 0,
            created_at_ms: self.clock.now_ms(),
            last_attempt_at_ms: 0,
            next_retry_at_ms: 0,
            ttl_ms: message.ttl_ms,
            retry_policy,
            user_data: message.user_data,
        });

        inner.len += 1;
        inner.stats.total_messages_queued += 1;
        inner.stats.current_queue_size = inner.len;
        inner.stats.peak_queue_size = inner.stats.peak_queue_size.max(inner.len);

        Ok(id)
    }

    /// Drops a queued message. An attempt already handed to the sink is not
    /// recalled; its outcome is simply not recorded.
    pub fn remove(&self, id: u32) -> Result<()> {
        let mut inner = self.lock()?;
        let index = inner
            .position(id)
            .ok_or_else(|| Error::not_found(format!("message {id}")))?;
        inner.take_slot(index);
        info!("Message removed: ID={}", id);
        Ok(())
    }

    pub fn get(&self, id: u32) -> Result<PersistentMessage> {
        let inner = self.lock()?;
        inner
            .position(id)
            .and_then(|index| inner.slots[index].clone())
            .ok_or_else(|| Error::not_found(format!("message {id}")))
    }

    /// Copies of all queued messages, oldest first.
    pub fn list(&self) -> Result<Vec<PersistentMessage>> {
        let inner = self.lock()?;
        let mut messages: Vec<_> = inner.slots.iter().flatten().cloned().collect();
        messages.sort_by_key(|m| m.id);
        Ok(messages)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.len)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Drops every queued message. Ids keep counting from where they were.
    pub fn clear(&self) -> Result<()> {
        let mut inner = self.lock()?;
        inner.slots.iter_mut().for_each(|slot| *slot = None);
        inner.len = 0;
        inner.stats.current_queue_size = 0;
        info!("Message queue cleared");
        Ok(())
    }

    pub fn get_stats(&self) -> Result<DeliveryStats> {
        Ok(self.lock()?.stats.clone())
    }

    /// Zeroes the counters but keeps the current and peak queue sizes.
    pub fn reset_stats(&self) -> Result<()> {
        let mut inner = self.lock()?;
        inner.stats = DeliveryStats {
            current_queue_size: inner.stats.current_queue_size,
            peak_queue_size: inner.stats.peak_queue_size,
            ..Default::default()
        };
        info!("Message persistence statistics reset");
        Ok(())
    }

    /// Runs one processing pass: books outcomes deferred by an earlier pass,
    /// expires stale messages, then attempts every due message in priority
    /// order.
    ///
    /// A sink that panics is treated as a failed delivery.
    pub fn process_once(&self) -> Result<ProcessReport> {
        let mut report = ProcessReport::default();

        let (sink, attempts) = {
            let mut inner = self.lock()?;
            let now = self.clock.now_ms();

            // Book what an earlier pass could not, so no message stays in
            // `Sending` after its attempt is over.
            let stranded = std::mem::take(&mut *self.unrecorded.lock());
            for outcome in &stranded {
                inner.apply_outcome(outcome, now, &mut report);
            }

            let sink = inner.config.sink.clone().ok_or_else(|| {
                Error::InvalidState("no delivery callback configured".to_string())
            })?;

            let mut attempts = Vec::new();
            for index in inner.processing_order() {
                let Some(message) = inner.slots[index].as_mut() else {
                    continue;
                };
                if message.is_expired(now) {
                    inner.expire_slot(index);
                    report.expired += 1;
                    continue;
                }
                if !message.is_due(now) {
                    continue;
                }
                message.state = MessageState::Sending;
                message.last_attempt_at_ms = now;
                attempts.push(Attempt {
                    id: message.id,
                    topic: message.topic.clone(),
                    payload: message.payload.clone(),
                    qos: message.qos,
                    user_data: message.user_data.clone(),
                    created_at_ms: message.created_at_ms,
                    attempted_at_ms: now,
                });
            }
            (sink, attempts)
        };

        for attempt in attempts {
            debug!("Attempting delivery: ID={}", attempt.id);
            let delivered = panic::catch_unwind(AssertUnwindSafe(|| {
                sink.deliver(
                    &attempt.topic,
                    &attempt.payload,
                    attempt.qos,
                    attempt.user_data.as_ref(),
                )
            }))
            .unwrap_or_else(|_| {
                error!("Delivery callback panicked: ID={}", attempt.id);
                false
            });
            report.attempted += 1;
            self.record_attempt(attempt.outcome(delivered), &mut report);
        }

        if !report.is_empty() {
            debug!("Processing pass finished: {:?}", report);
        }
        Ok(report)
    }

    fn record_attempt(&self, outcome: Outcome, report: &mut ProcessReport) {
        match self.lock() {
            Ok(mut inner) => {
                let now = self.clock.now_ms();
                inner.apply_outcome(&outcome, now, report);
            }
            Err(e) => {
                warn!(
                    "Outcome of message {} deferred to the next pass: {}",
                    outcome.id, e
                );
                self.unrecorded.lock().push(outcome);
                report.deferred += 1;
            }
        }
    }

    /// Expires every message whose TTL has run out and returns how many
    /// were dropped.
    pub fn cleanup_expired(&self) -> Result<usize> {
        let mut inner = self.lock()?;
        let now = self.clock.now_ms();

        let stale: Vec<usize> = inner
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.as_ref().is_some_and(|m| m.is_expired(now)))
            .map(|(index, _)| index)
            .collect();

        let cleaned = stale
            .into_iter()
            .filter(|&index| inner.expire_slot(index))
            .count();
        if cleaned > 0 {
            info!("Cleaned up {} expired messages", cleaned);
        }
        Ok(cleaned)
    }
}

impl fmt::Debug for DeliveryQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryQueue")
            .field("lock_timeout", &self.lock_timeout)
            .finish_non_exhaustive()
    }
}
