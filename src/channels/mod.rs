//! Outbound delivery and the Telegram transport.

pub mod registry;
pub mod telegram;
pub mod update;

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use futures::future::join_all;

use crate::error::ChannelError;
use crate::flow::messages::OutboundMessage;

pub use registry::CourseChannelRegistry;
pub use telegram::TelegramClient;
pub use update::{MappedUpdate, Update, map_update};

/// Somewhere outbound messages can be sent.
#[async_trait]
pub trait MessageSink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, message: &OutboundMessage) -> Result<(), ChannelError>;
}

/// Deliver `messages`, keeping per-recipient order. Different recipients are
/// served concurrently. Failures are logged and counted, never retried.
pub async fn deliver_all(sink: &dyn MessageSink, messages: Vec<OutboundMessage>) -> usize {
    let mut queues: Vec<(i64, Vec<OutboundMessage>)> = Vec::new();
    for message in messages {
        match queues.iter_mut().find(|(id, _)| *id == message.recipient_id) {
            Some((_, queue)) => queue.push(message),
            None => queues.push((message.recipient_id, vec![message])),
        }
    }

    let runs = queues.into_iter().map(|(recipient, queue)| async move {
        let mut failed = 0;
        for message in &queue {
            if let Err(e) = sink.deliver(message).await {
                tracing::warn!(recipient, channel = sink.name(), "Delivery failed: {}", e);
                failed += 1;
            }
        }
        failed
    });
    join_all(runs).await.into_iter().sum()
}

/// Writes messages to the log. Used when no bot token is configured.
pub struct LogSink;

#[async_trait]
impl MessageSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, message: &OutboundMessage) -> Result<(), ChannelError> {
        tracing::info!(
            recipient = message.recipient_id,
            buttons = message.buttons.len(),
            "{}",
            message.text
        );
        Ok(())
    }
}

/// Keeps delivered messages in memory.
#[derive(Default)]
pub struct MemorySink {
    delivered: Mutex<Vec<OutboundMessage>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered(&self) -> Vec<OutboundMessage> {
        self.delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl MessageSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn deliver(&self, message: &OutboundMessage) -> Result<(), ChannelError> {
        self.delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingFor(i64);

    #[async_trait]
    impl MessageSink for FailingFor {
        fn name(&self) -> &str {
            "failing"
        }

        async fn deliver(&self, message: &OutboundMessage) -> Result<(), ChannelError> {
            if message.recipient_id == self.0 {
                return Err(ChannelError::SendFailed {
                    name: "failing".into(),
                    reason: "blocked".into(),
                });
            }
            Ok(())
        }
    }

    fn message(recipient_id: i64, text: &str) -> OutboundMessage {
        OutboundMessage {
            recipient_id,
            text: text.into(),
            buttons: Vec::new(),
        }
    }

    #[tokio::test]
    async fn keeps_order_per_recipient() {
        let sink = MemorySink::new();
        let failed = deliver_all(
            &sink,
            vec![message(1, "a"), message(2, "x"), message(1, "b"), message(1, "c")],
        )
        .await;
        assert_eq!(failed, 0);

        let to_one: Vec<String> = sink
            .delivered()
            .into_iter()
            .filter(|m| m.recipient_id == 1)
            .map(|m| m.text)
            .collect();
        assert_eq!(to_one, vec!["a", "b", "c"]);
        assert_eq!(sink.delivered().len(), 4);
    }

    #[tokio::test]
    async fn failures_are_counted_not_fatal() {
        let failed = deliver_all(
            &FailingFor(2),
            vec![message(1, "a"), message(2, "b"), message(2, "c")],
        )
        .await;
        assert_eq!(failed, 2);
    }
}
