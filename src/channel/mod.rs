//! Uniform contract for external distribution channels.

mod breaker;
mod direct;
mod http;
mod ota;
mod registry;

pub use breaker::{BreakerState, CircuitBreaker};
pub use direct::DirectConnector;
pub use http::HttpChannelApi;
pub use ota::{
    AvailabilityUpdate, ChannelApi, ChannelReservation, OtaConnector, RateUpdate,
    ReservationState,
};
pub use registry::{ConnectorRegistry, RegistryError};

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::engine::EngineError;
use crate::model::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectorError {
    /// The channel API answered with an error.
    Api(String),
    Timeout(Duration),
    /// The channel's breaker is open; the call was not attempted.
    CircuitOpen(ChannelName),
    MappingMissing {
        channel: ChannelName,
        property_id: PropertyId,
    },
    Engine(EngineError),
}

impl std::fmt::Display for ConnectorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectorError::Api(e) => write!(f, "channel API error: {e}"),
            ConnectorError::Timeout(after) => {
                write!(f, "channel API call timed out after {}ms", after.as_millis())
            }
            ConnectorError::CircuitOpen(channel) => write!(f, "circuit open for {channel}"),
            ConnectorError::MappingMissing {
                channel,
                property_id,
            } => write!(f, "property {property_id} has no active {channel} mapping"),
            ConnectorError::Engine(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ConnectorError {}

impl From<EngineError> for ConnectorError {
    fn from(e: EngineError) -> Self {
        ConnectorError::Engine(e)
    }
}

/// A change fetched by polling, shaped like a webhook body.
#[derive(Debug, Clone, PartialEq)]
pub struct PolledEvent {
    pub external_event_id: String,
    pub event_type: String,
    pub payload: Value,
    /// Channel-side id to acknowledge once the event is durably stored.
    pub ack_id: Option<String>,
}

/// One polling round. Listings that failed are reported next to the
/// events fetched from the others.
#[derive(Debug, Default)]
pub struct PollBatch {
    pub events: Vec<PolledEvent>,
    pub failed_listings: Vec<(String, ConnectorError)>,
}

impl PollBatch {
    pub fn is_complete(&self) -> bool {
        self.failed_listings.is_empty()
    }
}

#[async_trait]
pub trait ChannelConnector: Send + Sync {
    fn channel_name(&self) -> ChannelName;

    fn capabilities(&self) -> &[Capability];

    fn supports(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    async fn resolve_mapping(&self, property_id: PropertyId, org_id: OrgId) -> Option<ChannelMapping>;

    /// Push the ledger state of `range` to the channel.
    async fn push_calendar_update(
        &self,
        property_id: PropertyId,
        range: DateRange,
        org_id: OrgId,
    ) -> Result<SyncResult, ConnectorError>;

    async fn push_reservation_update(
        &self,
        _reservation_id: &str,
        _org_id: OrgId,
    ) -> Result<SyncResult, ConnectorError> {
        Ok(SyncResult::skipped("reservation push not supported"))
    }

    async fn check_health(&self, connection_id: Option<&str>) -> HealthStatus;

    /// Synchronous handling of an inbound event. Most channels leave this to
    /// the category consumers.
    async fn handle_inbound_event(
        &self,
        _event_type: &str,
        _payload: &Value,
        _org_id: OrgId,
    ) -> Result<(), ConnectorError> {
        Ok(())
    }

    /// Changes since `since` (unix ms), for channels that declare `Polling`.
    async fn poll_events(&self, _since: Ms) -> Result<PollBatch, ConnectorError> {
        Ok(PollBatch::default())
    }

    async fn acknowledge(&self, _event: &PolledEvent) -> Result<(), ConnectorError> {
        Ok(())
    }
}
