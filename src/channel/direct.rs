use std::sync::Arc;

use async_trait::async_trait;

use crate::model::*;
use crate::store::MappingStore;

use super::{ChannelConnector, ConnectorError};

const CAPABILITIES: &[Capability] = &[Capability::InboundCalendar, Capability::OutboundCalendar];

/// The property's own booking calendar. It reads the ledger directly, so an
/// outbound push has nothing to send.
pub struct DirectConnector {
    mappings: Arc<dyn MappingStore>,
}

impl DirectConnector {
    pub fn new(mappings: Arc<dyn MappingStore>) -> Self {
        Self { mappings }
    }
}

#[async_trait]
impl ChannelConnector for DirectConnector {
    fn channel_name(&self) -> ChannelName {
        ChannelName::Direct
    }

    fn capabilities(&self) -> &[Capability] {
        CAPABILITIES
    }

    async fn resolve_mapping(&self, property_id: PropertyId, org_id: OrgId) -> Option<ChannelMapping> {
        self.mappings
            .find(property_id, org_id, ChannelName::Direct)
            .await
    }

    async fn push_calendar_update(
        &self,
        _property_id: PropertyId,
        _range: DateRange,
        _org_id: OrgId,
    ) -> Result<SyncResult, ConnectorError> {
        Ok(SyncResult::Success {
            items_processed: 0,
            duration_ms: 0,
        })
    }

    async fn check_health(&self, _connection_id: Option<&str>) -> HealthStatus {
        HealthStatus::Healthy
    }
}
