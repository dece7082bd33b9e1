use async_trait::async_trait;
use tracing::debug;

use crate::bus::{BusMessage, Category};

use super::{ConsumerContext, ConsumerOutcome, EventConsumer, engine_outcome};

/// `calendar.*` events: blocks, unblocks and rate changes made on the channel.
pub struct CalendarConsumer {
    ctx: ConsumerContext,
}

impl CalendarConsumer {
    pub fn new(ctx: ConsumerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl EventConsumer for CalendarConsumer {
    fn category(&self) -> Option<Category> {
        Some(Category::Calendar)
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
        let Some(range) = body.range() else {
            return ConsumerOutcome::Failed("from/to missing".into());
        };
        let source = message.channel.as_str();
        let engine = &self.ctx.engine;

        let result = match message.event_type.as_str() {
            "calendar.blocked" => {
                engine
                    .block(
                        mapping.property_id,
                        range,
                        mapping.org_id,
                        None,
                        body.reason.as_deref(),
                        source,
                    )
                    .await
            }
            "calendar.unblocked" => {
                engine
                    .unblock(mapping.property_id, range, mapping.org_id, source)
                    .await
            }
            "calendar.price_updated" | "calendar.rates_updated" => {
                let Some(price) = body.price() else {
                    return ConsumerOutcome::Failed("amount/currency missing".into());
                };
                engine
                    .update_price(mapping.property_id, range, price, mapping.org_id, source)
                    .await
            }
            other => {
                debug!(event_type = other, "calendar event type not handled");
                return ConsumerOutcome::Processed;
            }
        };

        match result {
            Ok(summary) => {
                debug!(
                    property_id = mapping.property_id,
                    written = summary.written,
                    skipped = summary.skipped,
                    "{} applied",
                    message.event_type
                );
                ConsumerOutcome::Processed
            }
            Err(e) => engine_outcome(message, e),
        }
    }
}
