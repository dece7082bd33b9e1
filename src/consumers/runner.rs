use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{BusError, DEAD_LETTER_TOPIC, Delivery, EventBus, Subscription};
use crate::model::{ChannelName, EventStatus};
use crate::observability::CONSUMER_OUTCOMES_TOTAL;
use crate::store::WebhookLog;

use super::{ConsumerOutcome, EventConsumer};

/// Pause after a failed bus read before trying again.
const READ_ERROR_PAUSE: Duration = Duration::from_secs(1);

/// Binds one consumer to one topic and applies its outcomes to the
/// webhook log. Ack happens only after the terminal status is durable.
pub struct ConsumerRunner {
    consumer: Arc<dyn EventConsumer>,
    log: Arc<WebhookLog>,
    bus: Arc<dyn EventBus>,
    topic: String,
    group: String,
    name: String,
}

impl ConsumerRunner {
    /// A runner for the consumer's category on `channel`.
    pub fn for_channel(
        channel: ChannelName,
        consumer: Arc<dyn EventConsumer>,
        log: Arc<WebhookLog>,
        bus: Arc<dyn EventBus>,
    ) -> Option<Self> {
        let category = consumer.category()?;
        Some(Self {
            topic: category.topic(channel),
            group: category.group(channel),
            name: format!("{}-{}", category.group(channel), std::process::id()),
            consumer,
            log,
            bus,
        })
    }

    /// A runner on the shared dead-letter topic.
    pub fn dead_letter(consumer: Arc<dyn EventConsumer>, log: Arc<WebhookLog>, bus: Arc<dyn EventBus>) -> Self {
        Self {
            topic: DEAD_LETTER_TOPIC.to_string(),
            group: DEAD_LETTER_TOPIC.to_string(),
            name: format!("dead-letter-{}", std::process::id()),
            consumer,
            log,
            bus,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    fn category_label(&self) -> &'static str {
        self.consumer
            .category()
            .map(|c| c.as_str())
            .unwrap_or("dead_letter")
    }

    /// Join the group, then consume on a background task until cancelled.
    /// Handling in progress when `cancel` fires is finished first.
    pub async fn start(self, cancel: CancellationToken) -> Result<JoinHandle<()>, BusError> {
        let mut sub = self.bus.subscribe(&self.topic, &self.group, &self.name).await?;
        info!(topic = %self.topic, group = %self.group, "consumer started");
        Ok(tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = sub.next() => next,
                };
                match next {
                    Ok(delivery) => {
                        if let Err(e) = self.process(sub.as_mut(), delivery).await {
                            warn!(topic = %self.topic, "bus error settling delivery: {e}");
                        }
                    }
                    Err(e) => {
                        warn!(topic = %self.topic, "bus read failed: {e}");
                        tokio::time::sleep(READ_ERROR_PAUSE).await;
                    }
                }
            }
            debug!(topic = %self.topic, "consumer stopped");
        }))
    }

    /// Handle one delivery and settle it on the bus.
    pub async fn process(&self, sub: &mut dyn Subscription, delivery: Delivery) -> Result<(), BusError> {
        let id = delivery.message.event_id;
        match self.log.get(id) {
            None => {
                warn!(event_id = %id, topic = %self.topic, "delivery for unknown event dropped");
                return sub.ack(&delivery).await;
            }
            // Terminal status written before a crash cut off the ack.
            Some(event) if event.status != EventStatus::Pending => {
                debug!(event_id = %id, status = ?event.status, "already settled");
                return sub.ack(&delivery).await;
            }
            Some(_) => {}
        }

        let handled = AssertUnwindSafe(self.consumer.handle(&delivery.message))
            .catch_unwind()
            .await;
        let outcome = handled.unwrap_or_else(|_| {
            error!(event_id = %id, topic = %self.topic, "consumer panicked");
            ConsumerOutcome::Failed("consumer panicked".into())
        });
        metrics::counter!(
            CONSUMER_OUTCOMES_TOTAL,
            "category" => self.category_label(),
            "outcome" => outcome.label()
        )
        .increment(1);

        let recorded = match &outcome {
            ConsumerOutcome::Processed => self.log.mark_processed(id).await,
            ConsumerOutcome::Failed(msg) => {
                warn!(event_id = %id, event_type = %delivery.message.event_type, "event failed: {msg}");
                self.log.mark_failed(id, msg).await
            }
            ConsumerOutcome::Retry(msg) => {
                debug!(event_id = %id, attempt = delivery.attempt, "event will be retried: {msg}");
                self.log.record_retry(id, msg).await
            }
        };

        match (recorded, outcome) {
            (Err(e), _) => {
                warn!(event_id = %id, "event log write failed, redelivering: {e}");
                sub.nack(delivery).await
            }
            (Ok(_), ConsumerOutcome::Retry(_)) => sub.nack(delivery).await,
            (Ok(_), _) => sub.ack(&delivery).await,
        }
    }
}
