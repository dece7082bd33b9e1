use async_trait::async_trait;
use tracing::{debug, info};

use crate::bus::{BusMessage, Category};
use crate::model::now_ms;

use super::{ConsumerContext, ConsumerOutcome, EventConsumer};

/// `listing.*` events change the mapping, never the ledger.
pub struct ListingConsumer {
    ctx: ConsumerContext,
}

impl ListingConsumer {
    pub fn new(ctx: ConsumerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl EventConsumer for ListingConsumer {
    fn category(&self) -> Option<Category> {
        Some(Category::Listing)
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

        let result = match message.event_type.as_str() {
            "listing.deleted" | "listing.unlisted" => {
                info!(
                    channel = %message.channel,
                    property_id = mapping.property_id,
                    listing = %mapping.external_listing_id,
                    "listing gone, sync disabled"
                );
                self.ctx.mappings.disable(mapping.id).await
            }
            "listing.updated" => self.ctx.mappings.touch_last_sync(mapping.id, now_ms()).await,
            other => {
                debug!(event_type = other, "listing event type not handled");
                return ConsumerOutcome::Processed;
            }
        };
        match result {
            Ok(()) => ConsumerOutcome::Processed,
            Err(e) => ConsumerOutcome::Failed(e.to_string()),
        }
    }
}
