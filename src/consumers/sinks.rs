use async_trait::async_trait;
use tracing::info;

use crate::model::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkError(pub String);

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "collaborator error: {}", self.0)
    }
}

impl std::error::Error for SinkError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationNotice {
    pub channel: ChannelName,
    pub property_id: PropertyId,
    pub org_id: OrgId,
    pub reservation_id: String,
    pub event_type: String,
    pub range: DateRange,
    pub guest_name: Option<String>,
    /// Copied from the mapping; the collaborator decides what it means.
    pub auto_create_intervention: bool,
}

/// Reservation CRUD and intervention creation live outside this crate.
#[async_trait]
pub trait ReservationSink: Send + Sync {
    async fn reservation_received(&self, notice: &ReservationNotice) -> Result<(), SinkError>;

    async fn reservation_cancelled(&self, notice: &ReservationNotice) -> Result<(), SinkError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub channel: ChannelName,
    pub property_id: PropertyId,
    pub org_id: OrgId,
    pub reservation_id: Option<String>,
    pub guest_name: Option<String>,
    pub text: String,
}

/// Guest messaging lives outside this crate.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn message_received(&self, message: &InboundMessage) -> Result<(), SinkError>;
}

/// Default collaborator: logs and accepts.
pub struct LoggingSink;

#[async_trait]
impl ReservationSink for LoggingSink {
    async fn reservation_received(&self, notice: &ReservationNotice) -> Result<(), SinkError> {
        info!(
            channel = %notice.channel,
            property_id = notice.property_id,
            reservation = %notice.reservation_id,
            range = %notice.range,
            "reservation received"
        );
        Ok(())
    }

    async fn reservation_cancelled(&self, notice: &ReservationNotice) -> Result<(), SinkError> {
        info!(
            channel = %notice.channel,
            property_id = notice.property_id,
            reservation = %notice.reservation_id,
            "reservation cancelled"
        );
        Ok(())
    }
}

#[async_trait]
impl MessageSink for LoggingSink {
    async fn message_received(&self, message: &InboundMessage) -> Result<(), SinkError> {
        info!(
            channel = %message.channel,
            property_id = message.property_id,
            chars = message.text.len(),
            "guest message received"
        );
        Ok(())
    }
}
