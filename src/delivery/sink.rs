use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;

use super::message::UserData;

/// The transport side of the delivery queue.
///
/// `deliver` must return promptly; `false` sends the message down the
/// retry path.
pub trait DeliverySink: Send + Sync {
    fn deliver(&self, topic: &str, payload: &str, qos: u8, user_data: Option<&UserData>) -> bool;
}

impl<F> DeliverySink for F
where
    F: Fn(&str, &str, u8, Option<&UserData>) -> bool + Send + Sync,
{
    fn deliver(&self, topic: &str, payload: &str, qos: u8, user_data: Option<&UserData>) -> bool {
        self(topic, payload, qos, user_data)
    }
}

/// Wraps a closure as a shareable sink.
pub fn sink_fn<F>(f: F) -> Arc<dyn DeliverySink>
where
    F: Fn(&str, &str, u8, Option<&UserData>) -> bool + Send + Sync + 'static,
{
    Arc::new(f)
}

/// A message handed to a `ChannelSink`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: String,
    pub qos: u8,
}

/// Forwards deliveries into an unbounded channel.
///
/// Reports failure once the receiving half has been dropped.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: UnboundedSender<OutboundMessage>,
}

impl ChannelSink {
    pub fn new(tx: UnboundedSender<OutboundMessage>) -> Self {
        Self { tx }
    }
}

impl DeliverySink for ChannelSink {
    fn deliver(&self, topic: &str, payload: &str, qos: u8, _user_data: Option<&UserData>) -> bool {
        let message = OutboundMessage {
            topic: topic.to_string(),
            payload: payload.to_string(),
            qos,
        };
        self.tx.send(message).is_ok()
    }
}
