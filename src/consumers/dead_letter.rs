use async_trait::async_trait;
use tracing::warn;

use crate::bus::{BusMessage, Category};

use super::{ConsumerOutcome, EventConsumer};

/// Marks whatever lands on the dead-letter topic as FAILED.
pub struct DeadLetterConsumer;

#[async_trait]
impl EventConsumer for DeadLetterConsumer {
    fn category(&self) -> Option<Category> {
        None
    }

    async fn handle(&self, message: &BusMessage) -> ConsumerOutcome {
        let reason = match Category::from_event_type(&message.event_type) {
            None => "unroutable event type",
            Some(_) => "delivery limit reached",
        };
        warn!(
            channel = %message.channel,
            event_id = %message.event_id,
            event_type = %message.event_type,
            "dead letter: {reason}"
        );
        ConsumerOutcome::Failed(reason.to_string())
    }
}
