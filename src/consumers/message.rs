use std::sync::Arc;

use async_trait::async_trait;

use crate::bus::{BusMessage, Category};

use super::{ConsumerContext, ConsumerOutcome, EventConsumer, InboundMessage, MessageSink};

/// `message.*` events are handed to the messaging collaborator as-is.
pub struct MessageConsumer {
    ctx: ConsumerContext,
    sink: Arc<dyn MessageSink>,
}

impl MessageConsumer {
    pub fn new(ctx: ConsumerContext, sink: Arc<dyn MessageSink>) -> Self {
        Self { ctx, sink }
    }
}

#[async_trait]
impl EventConsumer for MessageConsumer {
    fn category(&self) -> Option<Category> {
        Some(Category::Message)
    }

    async fn handle(&self, message: &BusMessage) -> ConsumerOutcome {
        let body = match ConsumerContext::parse(message) {
            Ok(b) => b,
            Err(outcome) => return outcome,
        };
        let mapping = match self.ctx.resolve(message, &body).await {
            Ok(m) => m,
            Err(outcome) => return outcome,
        };
        let inbound = InboundMessage {
            channel: message.channel,
            property_id: mapping.property_id,
            org_id: mapping.org_id,
            reservation_id: body.reservation_id,
            guest_name: body.guest_name,
            text: body.message.unwrap_or_default(),
        };
        match self.sink.message_received(&inbound).await {
            Ok(()) => ConsumerOutcome::Processed,
            Err(e) => ConsumerOutcome::Failed(e.to_string()),
        }
    }
}
