use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::bus::{BusMessage, Category};
use crate::engine::EngineError;

use super::{
    ConsumerContext, ConsumerOutcome, EventConsumer, ReservationNotice, ReservationSink,
    engine_outcome,
};

/// Reason code on nights held by a channel reservation.
pub const RESERVATION_REASON: &str = "RESERVATION";

/// `reservation.*` events. A booking holds its nights in the ledger before
/// the reservation collaborator hears about it.
pub struct ReservationConsumer {
    ctx: ConsumerContext,
    sink: Arc<dyn ReservationSink>,
}

impl ReservationConsumer {
    pub fn new(ctx: ConsumerContext, sink: Arc<dyn ReservationSink>) -> Self {
        Self { ctx, sink }
    }
}

#[async_trait]
impl EventConsumer for ReservationConsumer {
    fn category(&self) -> Option<Category> {
        Some(Category::Reservation)
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
        let (Some(range), Some(reservation_id)) = (body.range(), body.reservation_id.clone()) else {
            return ConsumerOutcome::Failed("reservationId/from/to missing".into());
        };
        let notice = ReservationNotice {
            channel: message.channel,
            property_id: mapping.property_id,
            org_id: mapping.org_id,
            reservation_id,
            event_type: message.event_type.clone(),
            range,
            guest_name: body.guest_name.clone(),
            auto_create_intervention: mapping.auto_create_intervention,
        };
        let source = message.channel.as_str();
        let engine = &self.ctx.engine;

        let notified = match message.event_type.as_str() {
            "reservation.created" | "reservation.confirmed" | "reservation.modified" => {
                let held = engine
                    .block(
                        mapping.property_id,
                        range,
                        mapping.org_id,
                        Some(RESERVATION_REASON),
                        Some(&notice.reservation_id),
                        source,
                    )
                    .await;
                match held {
                    Ok(_) => self.sink.reservation_received(&notice).await,
                    Err(e @ EngineError::Conflict { .. }) => {
                        warn!(
                            channel = %message.channel,
                            property_id = mapping.property_id,
                            reservation = %notice.reservation_id,
                            "possible double booking"
                        );
                        return engine_outcome(message, e);
                    }
                    Err(e) => return engine_outcome(message, e),
                }
            }
            "reservation.cancelled" => {
                if let Err(e) = engine
                    .unblock(mapping.property_id, range, mapping.org_id, source)
                    .await
                {
                    return engine_outcome(message, e);
                }
                self.sink.reservation_cancelled(&notice).await
            }
            other => {
                debug!(event_type = other, "reservation event type not handled");
                return ConsumerOutcome::Processed;
            }
        };

        match notified {
            Ok(()) => ConsumerOutcome::Processed,
            Err(e) => ConsumerOutcome::Failed(e.to_string()),
        }
    }
}
