//! Category consumers: translate channel events into ledger calls.
//!
//! A consumer never touches the event log itself. It returns a
//! [`ConsumerOutcome`] and the [`ConsumerRunner`] records it.

mod calendar;
mod dead_letter;
mod listing;
mod message;
mod reservation;
mod runner;
mod sinks;

pub use calendar::CalendarConsumer;
pub use dead_letter::DeadLetterConsumer;
pub use listing::ListingConsumer;
pub use message::MessageConsumer;
pub use reservation::ReservationConsumer;
pub use runner::ConsumerRunner;
pub use sinks::{InboundMessage, LoggingSink, MessageSink, ReservationNotice, ReservationSink, SinkError};

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::bus::{BusMessage, Category};
use crate::engine::{Engine, EngineError};
use crate::model::ChannelMapping;
use crate::payload::EventBody;
use crate::store::MappingStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerOutcome {
    /// Done, including expected non-errors (unmapped listing, conflict).
    Processed,
    /// Transient; redeliver later. The event stays PENDING.
    Retry(String),
    /// Terminal failure, recorded for operators. Not retried.
    Failed(String),
}

impl ConsumerOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ConsumerOutcome::Processed => "processed",
            ConsumerOutcome::Retry(_) => "retry",
            ConsumerOutcome::Failed(_) => "failed",
        }
    }
}

#[async_trait]
pub trait EventConsumer: Send + Sync {
    /// `None` for the dead-letter consumer.
    fn category(&self) -> Option<Category>;

    async fn handle(&self, message: &BusMessage) -> ConsumerOutcome;
}

/// Classify an engine error for the event log.
pub(crate) fn engine_outcome(message: &BusMessage, err: EngineError) -> ConsumerOutcome {
    match err {
        EngineError::Conflict { .. } => {
            info!(
                channel = %message.channel,
                event_type = %message.event_type,
                "overlapping occupancy reported: {err}"
            );
            ConsumerOutcome::Processed
        }
        e if e.is_retryable() => ConsumerOutcome::Retry(e.to_string()),
        e => ConsumerOutcome::Failed(e.to_string()),
    }
}

/// What every translating consumer needs: the ledger and the listing lookup.
#[derive(Clone)]
pub struct ConsumerContext {
    pub engine: Arc<Engine>,
    pub mappings: Arc<dyn MappingStore>,
}

impl ConsumerContext {
    pub fn new(engine: Arc<Engine>, mappings: Arc<dyn MappingStore>) -> Self {
        Self { engine, mappings }
    }

    pub(crate) fn parse(message: &BusMessage) -> Result<EventBody, ConsumerOutcome> {
        serde_json::from_str(&message.payload)
            .map_err(|e| ConsumerOutcome::Failed(format!("unreadable payload: {e}")))
    }

    /// The active mapping for the event's listing. `Err(Processed)` when the
    /// listing is unknown here: such events are ignored, not failed.
    pub(crate) async fn resolve(
        &self,
        message: &BusMessage,
        body: &EventBody,
    ) -> Result<ChannelMapping, ConsumerOutcome> {
        let Some(listing) = body.listing_id.as_deref() else {
            return Err(ConsumerOutcome::Failed("listingId missing".into()));
        };
        match self.mappings.find_by_listing(message.channel, listing).await {
            Some(mapping) if mapping.sync_enabled => Ok(mapping),
            _ => {
                info!(channel = %message.channel, listing, "event for unmapped listing ignored");
                Err(ConsumerOutcome::Processed)
            }
        }
    }
}
