use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::engine::Engine;
use crate::limits::{DEFAULT_BREAKER_COOLDOWN, DEFAULT_BREAKER_THRESHOLD, DEFAULT_CONNECTOR_TIMEOUT};
use crate::model::*;
use crate::payload::EventBody;
use crate::store::MappingStore;

use super::{ChannelConnector, CircuitBreaker, ConnectorError, PollBatch, PolledEvent};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityUpdate {
    pub date: NaiveDate,
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_stay: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_stay: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateUpdate {
    pub date: NaiveDate,
    pub amount: i64,
    pub currency: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationState {
    Confirmed,
    Modified,
    Cancelled,
}

impl ReservationState {
    fn event_type(&self) -> &'static str {
        match self {
            ReservationState::Confirmed => "reservation.confirmed",
            ReservationState::Modified => "reservation.modified",
            ReservationState::Cancelled => "reservation.cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelReservation {
    pub id: String,
    pub listing_id: String,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub state: ReservationState,
    #[serde(default)]
    pub guest_name: Option<String>,
    /// Channel-side modification time, unix ms.
    pub updated_at: Ms,
}

/// Narrow client for one channel's partner API.
#[async_trait]
pub trait ChannelApi: Send + Sync {
    async fn get_availability(
        &self,
        listing_id: &str,
        range: DateRange,
    ) -> Result<Vec<AvailabilityUpdate>, ConnectorError>;

    /// Returns the number of nights the channel accepted.
    async fn update_availability(
        &self,
        listing_id: &str,
        updates: &[AvailabilityUpdate],
    ) -> Result<u32, ConnectorError>;

    async fn update_rates(&self, listing_id: &str, rates: &[RateUpdate]) -> Result<u32, ConnectorError>;

    async fn get_reservations(
        &self,
        listing_id: &str,
        since: Ms,
    ) -> Result<Vec<ChannelReservation>, ConnectorError>;

    async fn acknowledge_reservation(&self, reservation_id: &str) -> Result<(), ConnectorError>;
}

const DEFAULT_CAPABILITIES: &[Capability] = &[
    Capability::InboundCalendar,
    Capability::OutboundCalendar,
    Capability::InboundReservations,
    Capability::Webhooks,
];

/// Connector for a partner-API channel, parameterised by its [`ChannelApi`].
///
/// Every API call goes through the channel's breaker and a timeout.
pub struct OtaConnector {
    channel: ChannelName,
    capabilities: Vec<Capability>,
    api: Arc<dyn ChannelApi>,
    engine: Arc<Engine>,
    mappings: Arc<dyn MappingStore>,
    breaker: CircuitBreaker,
    timeout: Duration,
}

impl OtaConnector {
    pub fn new(
        channel: ChannelName,
        api: Arc<dyn ChannelApi>,
        engine: Arc<Engine>,
        mappings: Arc<dyn MappingStore>,
    ) -> Self {
        Self {
            channel,
            capabilities: DEFAULT_CAPABILITIES.to_vec(),
            api,
            engine,
            mappings,
            breaker: CircuitBreaker::new(channel, DEFAULT_BREAKER_THRESHOLD, DEFAULT_BREAKER_COOLDOWN),
            timeout: DEFAULT_CONNECTOR_TIMEOUT,
        }
    }

    pub fn with_capabilities(mut self, capabilities: &[Capability]) -> Self {
        self.capabilities = capabilities.to_vec();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_breaker(mut self, threshold: u32, cooldown: Duration) -> Self {
        self.breaker = CircuitBreaker::new(self.channel, threshold, cooldown);
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    async fn guarded<T, F>(&self, call: F) -> Result<T, ConnectorError>
    where
        F: Future<Output = Result<T, ConnectorError>>,
    {
        if !self.breaker.try_acquire() {
            return Err(ConnectorError::CircuitOpen(self.channel));
        }
        let result = match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ConnectorError::Timeout(self.timeout)),
        };
        match &result {
            Ok(_) => self.breaker.on_success(),
            Err(e) => {
                debug!(channel = %self.channel, "channel call failed: {e}");
                self.breaker.on_failure();
            }
        }
        result
    }
}

#[async_trait]
impl ChannelConnector for OtaConnector {
    fn channel_name(&self) -> ChannelName {
        self.channel
    }

    fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    async fn resolve_mapping(&self, property_id: PropertyId, org_id: OrgId) -> Option<ChannelMapping> {
        self.mappings.find(property_id, org_id, self.channel).await
    }

    async fn push_calendar_update(
        &self,
        property_id: PropertyId,
        range: DateRange,
        org_id: OrgId,
    ) -> Result<SyncResult, ConnectorError> {
        let started = Instant::now();
        let mapping = self
            .resolve_mapping(property_id, org_id)
            .await
            .ok_or(ConnectorError::MappingMissing {
                channel: self.channel,
                property_id,
            })?;
        let days = self.engine.days_in_range(property_id, range).await?;

        let updates: Vec<AvailabilityUpdate> = days
            .iter()
            .map(|day| AvailabilityUpdate {
                date: day.date,
                available: !day.is_blocked(),
                min_stay: day.min_stay,
                max_stay: day.max_stay,
            })
            .collect();
        let listing = mapping.external_listing_id.as_str();
        let mut items = self
            .guarded(self.api.update_availability(listing, &updates))
            .await?;

        if mapping.auto_push_pricing {
            let rates: Vec<RateUpdate> = days
                .iter()
                .filter_map(|day| {
                    let price = day.price.as_ref()?;
                    Some(RateUpdate {
                        date: day.date,
                        amount: price.amount_minor,
                        currency: price.currency.clone(),
                    })
                })
                .collect();
            if !rates.is_empty() {
                items += self.guarded(self.api.update_rates(listing, &rates)).await?;
            }
        }

        if let Err(e) = self.mappings.touch_last_sync(mapping.id, now_ms()).await {
            warn!(channel = %self.channel, property_id, "could not record last sync: {e}");
        }

        Ok(SyncResult::Success {
            items_processed: items,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn check_health(&self, _connection_id: Option<&str>) -> HealthStatus {
        self.breaker.health()
    }

    async fn poll_events(&self, since: Ms) -> Result<PollBatch, ConnectorError> {
        let mut batch = PollBatch::default();
        let mappings = self.mappings.active_for_channel(self.channel).await;
        for (i, mapping) in mappings.iter().enumerate() {
            let listing = mapping.external_listing_id.as_str();
            let reservations = match self.guarded(self.api.get_reservations(listing, since)).await {
                Ok(reservations) => reservations,
                Err(ConnectorError::CircuitOpen(channel)) => {
                    // Every remaining listing would fail fast the same way.
                    for rest in &mappings[i..] {
                        batch
                            .failed_listings
                            .push((rest.external_listing_id.clone(), ConnectorError::CircuitOpen(channel)));
                    }
                    break;
                }
                Err(e) => {
                    warn!(channel = %self.channel, listing, "reservation poll failed: {e}");
                    batch.failed_listings.push((listing.to_string(), e));
                    continue;
                }
            };
            for r in reservations {
                let event_type = r.state.event_type();
                let external_event_id = format!("poll:{}:{}:{}", r.id, event_type, r.updated_at);
                let body = EventBody {
                    listing_id: Some(r.listing_id.clone()),
                    from: Some(r.check_in),
                    to: Some(r.check_out),
                    reservation_id: Some(r.id.clone()),
                    guest_name: r.guest_name.clone(),
                    ..EventBody::new(external_event_id.clone(), event_type)
                };
                let payload =
                    serde_json::to_value(&body).map_err(|e| ConnectorError::Api(e.to_string()))?;
                batch.events.push(PolledEvent {
                    external_event_id,
                    event_type: event_type.to_string(),
                    payload,
                    ack_id: Some(r.id),
                });
            }
        }
        Ok(batch)
    }

    async fn acknowledge(&self, event: &PolledEvent) -> Result<(), ConnectorError> {
        let Some(id) = event.ack_id.as_deref() else {
            return Ok(());
        };
        self.guarded(self.api.acknowledge_reservation(id)).await
    }
}
