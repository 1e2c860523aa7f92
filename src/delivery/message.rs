use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Opaque per-message value handed back to the delivery sink.
pub type UserData = Arc<dyn Any + Send + Sync>;

/// Message topics must be shorter than this many bytes.
pub const MAX_MESSAGE_TOPIC_LEN: usize = 128;
/// Message payloads must be shorter than this many bytes.
pub const MAX_MESSAGE_PAYLOAD_LEN: usize = 1024;
/// Highest QoS level a message may carry.
pub const MAX_QOS: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        };
        f.write_str(name)
    }
}

/// Lifecycle of a queued message.
///
/// `Delivered`, `Failed` and `Expired` are terminal: a message in one of them
/// no longer occupies a queue slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MessageState {
    #[default]
    Pending,
    Sending,
    Delivered,
    Failed,
    Expired,
}

impl MessageState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MessageState::Delivered | MessageState::Failed | MessageState::Expired
        )
    }
}

/// How often, and how far apart, failed deliveries are retried.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
    pub exponential_backoff: bool,
}

impl Default for RetryPolicy {
    /// 3 retries starting at 1s, doubling, capped at 30s.
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 30_000,
            exponential_backoff: true,
        }
    }
}

impl RetryPolicy {
    /// 5 retries starting at 500ms, growing by 1.5x, capped at 10s.
    pub fn critical() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 500,
            backoff_multiplier: 1.5,
            max_delay_ms: 10_000,
            exponential_backoff: true,
        }
    }

    /// Delay before the next attempt of a message that has already been
    /// retried `retry_count` times.
    pub fn backoff_delay_ms(&self, retry_count: u32) -> u64 {
        if !self.exponential_backoff || retry_count == 0 {
            return self.base_delay_ms;
        }
        let scaled = self.base_delay_ms as f64 * self.backoff_multiplier.powi(retry_count as i32);
        if scaled >= self.max_delay_ms as f64 {
            self.max_delay_ms
        } else {
            scaled as u64
        }
    }
}

/// A message held by the delivery queue.
#[derive(Debug, Clone)]
pub struct PersistentMessage {
    /// Assigned at enqueue; starts at 1 and is never reused.
    pub id: u32,
    pub topic: String,
    pub payload: String,
    pub priority: Priority,
    pub state: MessageState,
    pub qos: u8,
    pub retain: bool,
    pub retry_count: u32,
    pub created_at_ms: u64,
    pub last_attempt_at_ms: u64,
    /// 0 until the first failed attempt.
    pub next_retry_at_ms: u64,
    /// 0 means the message never expires.
    pub ttl_ms: u64,
    pub retry_policy: RetryPolicy,
    pub user_data: Option<UserData>,
}

impl PersistentMessage {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.ttl_ms != 0 && now_ms.saturating_sub(self.created_at_ms) >= self.ttl_ms
    }

    /// Pending, past its retry time and within its retry budget.
    pub fn is_due(&self, now_ms: u64) -> bool {
        self.state == MessageState::Pending
            && (self.next_retry_at_ms == 0 || now_ms >= self.next_retry_at_ms)
            && self.retry_count <= self.retry_policy.max_retries
    }
}

/// Parameters for `DeliveryQueue::enqueue`.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub topic: String,
    pub payload: String,
    pub qos: u8,
    pub retain: bool,
    pub priority: Priority,
    pub ttl_ms: u64,
    /// Falls back to the queue's default policy when `None`.
    pub retry_policy: Option<RetryPolicy>,
    pub user_data: Option<UserData>,
}

impl NewMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: 0,
            retain: false,
            priority: Priority::Normal,
            ttl_ms: 0,
            retry_policy: None,
            user_data: None,
        }
    }

    pub fn qos(mut self, qos: u8) -> Self {
        self.qos = qos;
        self
    }

    pub fn retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = ttl_ms;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn user_data(mut self, user_data: UserData) -> Self {
        self.user_data = Some(user_data);
        self
    }
}
