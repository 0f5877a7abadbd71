use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::tools::ToolStatus;

/// Incremental progress pushed to observers of a conversation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    TurnStarted { turn: u32 },
    ToolStarted { tool: String },
    ToolFinished { tool: String, status: ToolStatus, elapsed_ms: u64 },
    AnswerDelta { text: String },
    Completed { outcome: String },
}

/// Best-effort event relay. Implementations swallow and log their own failures.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn publish_batch(&self, events: Vec<ProgressEvent>, channel_key: &str);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopNotificationChannel;

#[async_trait]
impl NotificationChannel for NoopNotificationChannel {
    async fn publish_batch(&self, _events: Vec<ProgressEvent>, _channel_key: &str) {}
}

/// Per-conversation handle that batches answer fragments before publishing.
pub struct NotificationSink {
    channel: Arc<dyn NotificationChannel>,
    channel_key: String,
    batch_size: usize,
    pending: Vec<ProgressEvent>,
}

impl NotificationSink {
    pub fn new(
        channel: Arc<dyn NotificationChannel>,
        channel_key: impl Into<String>,
        batch_size: usize,
    ) -> Self {
        Self {
            channel,
            channel_key: channel_key.into(),
            batch_size: batch_size.max(1),
            pending: Vec::new(),
        }
    }

    pub fn noop() -> Self {
        Self::new(Arc::new(NoopNotificationChannel), "noop", 1)
    }

    pub fn channel_key(&self) -> &str {
        &self.channel_key
    }

    pub async fn push_answer_delta(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.pending.push(ProgressEvent::AnswerDelta { text: text.to_string() });
        if self.pending.len() >= self.batch_size {
            self.flush().await;
        }
    }

    /// Publishes a lifecycle event right away, after anything already buffered.
    pub async fn publish(&mut self, event: ProgressEvent) {
        self.pending.push(event);
        self.flush().await;
    }

    pub async fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let events = std::mem::take(&mut self.pending);
        self.channel.publish_batch(events, &self.channel_key).await;
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::notify::{NotificationSink, ProgressEvent};
    use crate::testing::RecordingChannel;

    #[tokio::test]
    async fn answer_deltas_are_published_in_fixed_batches() {
        let channel = Arc::new(RecordingChannel::default());
        let mut sink = NotificationSink::new(channel.clone(), "thread-1", 3);

        for fragment in ["a", "b", "c", "d"] {
            sink.push_answer_delta(fragment).await;
        }
        assert_eq!(channel.batches().len(), 1, "threshold flush after three fragments");
        assert_eq!(sink.pending_len(), 1);

        sink.flush().await;
        let batches = channel.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].0, "thread-1");
        assert_eq!(batches[0].1.len(), 3);
        assert_eq!(batches[1].1, vec![ProgressEvent::AnswerDelta { text: "d".to_string() }]);
    }

    #[tokio::test]
    async fn lifecycle_events_flush_buffered_deltas_first() {
        let channel = Arc::new(RecordingChannel::default());
        let mut sink = NotificationSink::new(channel.clone(), "thread-2", 10);

        sink.push_answer_delta("partial").await;
        sink.publish(ProgressEvent::Completed { outcome: "completed".to_string() }).await;

        let batches = channel.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(
            batches[0].1,
            vec![
                ProgressEvent::AnswerDelta { text: "partial".to_string() },
                ProgressEvent::Completed { outcome: "completed".to_string() },
            ]
        );
    }

    #[tokio::test]
    async fn empty_fragments_are_ignored() {
        let channel = Arc::new(RecordingChannel::default());
        let mut sink = NotificationSink::new(channel.clone(), "thread-3", 1);
        sink.push_answer_delta("").await;
        sink.flush().await;
        assert!(channel.batches().is_empty());
    }
}
