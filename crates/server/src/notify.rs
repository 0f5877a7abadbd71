use std::time::Duration;

use async_trait::async_trait;
use huddle_agent::notify::{NotificationChannel, ProgressEvent};
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

const QUEUE_CAPACITY: usize = 256;

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

struct Delivery {
    channel_key: String,
    events: Vec<ProgressEvent>,
}

/// Relays progress batches as JSON POSTs from a background worker.
///
/// Publishing only enqueues, so a slow endpoint never holds up a
/// conversation. Batches are dropped when the queue is full; delivery
/// failures are logged only.
pub struct WebhookNotificationChannel {
    queue: mpsc::Sender<Delivery>,
}

impl WebhookNotificationChannel {
    /// Spawns the delivery worker, so it must be called inside a tokio runtime.
    pub fn new(http: reqwest::Client, url: impl Into<String>) -> Self {
        let (queue, receiver) = mpsc::channel(QUEUE_CAPACITY);
        tokio::spawn(deliver_batches(http, url.into(), receiver));
        Self { queue }
    }
}

#[async_trait]
impl NotificationChannel for WebhookNotificationChannel {
    async fn publish_batch(&self, events: Vec<ProgressEvent>, channel_key: &str) {
        let delivery = Delivery { channel_key: channel_key.to_string(), events };
        match self.queue.try_send(delivery) {
            Ok(()) => {}
            Err(TrySendError::Full(delivery)) => {
                warn!(
                    event_name = "server.notify.dropped",
                    correlation_id = %delivery.channel_key,
                    events = delivery.events.len(),
                    "progress queue full; batch dropped"
                );
            }
            Err(TrySendError::Closed(delivery)) => {
                warn!(
                    event_name = "server.notify.closed",
                    correlation_id = %delivery.channel_key,
                    "progress worker stopped; batch dropped"
                );
            }
        }
    }
}

/// Posts batches one at a time so observers see them in publish order.
async fn deliver_batches(
    http: reqwest::Client,
    url: String,
    mut receiver: mpsc::Receiver<Delivery>,
) {
    while let Some(delivery) = receiver.recv().await {
        post_batch(&http, &url, delivery).await;
    }
}

async fn post_batch(http: &reqwest::Client, url: &str, delivery: Delivery) {
    let count = delivery.events.len();
    let channel_key = delivery.channel_key.as_str();
    let payload = json!({ "channel": channel_key, "events": delivery.events });
    match http.post(url).timeout(DELIVERY_TIMEOUT).json(&payload).send().await {
        Ok(response) if response.status().is_success() => {
            debug!(
                event_name = "server.notify.published",
                correlation_id = channel_key,
                events = count,
                "progress batch delivered"
            );
        }
        Ok(response) => {
            warn!(
                event_name = "server.notify.rejected",
                correlation_id = channel_key,
                status = response.status().as_u16(),
                "progress webhook rejected batch"
            );
        }
        Err(error) => {
            warn!(
                event_name = "server.notify.failed",
                correlation_id = channel_key,
                error = %error,
                "progress webhook unreachable"
            );
        }
    }
}

/// Posts a finished `/chat` response to the caller-supplied URL without
/// holding up the HTTP reply.
pub fn spawn_result_delivery<T>(http: reqwest::Client, url: String, correlation_id: String, body: T)
where
    T: Serialize + Send + 'static,
{
    tokio::spawn(async move {
        let outcome = http.post(&url).json(&body).send().await;
        match outcome.and_then(|response| response.error_for_status()) {
            Ok(_) => debug!(
                event_name = "server.webhook.delivered",
                correlation_id = %correlation_id,
                "result webhook delivered"
            ),
            Err(error) => warn!(
                event_name = "server.webhook.failed",
                correlation_id = %correlation_id,
                error = %error,
                "result webhook delivery failed"
            ),
        }
    });
}
