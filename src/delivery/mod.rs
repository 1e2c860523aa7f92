//! The `delivery` module is an in-memory outbound queue with per-message
//! priority, TTL and retry policy.
//!
//! Messages move `Pending -> Sending -> Delivered`, or back to `Pending` with
//! an exponential backoff after a failed attempt, or to `Failed` once their
//! retry budget is spent. Any message still in the queue becomes `Expired`
//! when its TTL runs out. A `DeliveryWorker` drains the queue through a
//! `DeliverySink` in the background.

pub mod message;
pub mod queue;
pub mod sink;
pub mod worker;

pub use message::{
    MAX_MESSAGE_PAYLOAD_LEN, MAX_MESSAGE_TOPIC_LEN, MessageState, NewMessage, PersistentMessage,
    Priority, RetryPolicy, UserData,
};
pub use queue::{
    DeliveryConfig, DeliveryQueue, DeliveryStats, MAX_QUEUED_MESSAGES, ProcessReport,
};
pub use sink::{ChannelSink, DeliverySink, OutboundMessage, sink_fn};
pub use worker::{DeliveryWorker, WorkerHandle};

#[cfg(test)]
mod tests;
