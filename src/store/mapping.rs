use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::info;
use ulid::Ulid;

use crate::limits::MAX_EXTERNAL_ID_LEN;
use crate::model::*;

use super::StoreError;

/// Property ↔ channel listing links.
///
/// At most one active mapping per `(property, channel, org)`, and a listing
/// id is bound to at most one mapping within its channel.
#[async_trait]
pub trait MappingStore: Send + Sync {
    /// Insert, or update the flags of the mapping with the same id or the
    /// same `(property, channel, org, listing)`. Returns the stored row.
    async fn upsert(&self, mapping: ChannelMapping) -> Result<ChannelMapping, StoreError>;

    async fn get(&self, id: Ulid) -> Option<ChannelMapping>;

    async fn find_by_listing(
        &self,
        channel: ChannelName,
        external_listing_id: &str,
    ) -> Option<ChannelMapping>;

    /// The active mapping of one property on one channel.
    async fn find(
        &self,
        property_id: PropertyId,
        org_id: OrgId,
        channel: ChannelName,
    ) -> Option<ChannelMapping>;

    /// Every sync-enabled mapping of a property, ordered by channel.
    async fn active_for_property(&self, property_id: PropertyId, org_id: OrgId) -> Vec<ChannelMapping>;

    /// Every sync-enabled mapping on one channel.
    async fn active_for_channel(&self, channel: ChannelName) -> Vec<ChannelMapping>;

    async fn disable(&self, id: Ulid) -> Result<(), StoreError>;

    async fn remove(&self, id: Ulid) -> Result<ChannelMapping, StoreError>;

    async fn touch_last_sync(&self, id: Ulid, at: Ms) -> Result<(), StoreError>;

    /// The implicit direct-channel mapping of an enabled property.
    async fn ensure_direct(&self, property_id: PropertyId, org_id: OrgId) -> Result<ChannelMapping, StoreError>;
}

#[derive(Default)]
pub struct MemoryMappingStore {
    rows: RwLock<HashMap<Ulid, ChannelMapping>>,
}

impl MemoryMappingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn validate(mapping: &ChannelMapping) -> Result<(), StoreError> {
    let ext = mapping.external_listing_id.trim();
    if ext.is_empty() {
        return Err(StoreError::Invalid("external listing id is empty".into()));
    }
    if ext.len() > MAX_EXTERNAL_ID_LEN {
        return Err(StoreError::Invalid("external listing id too long".into()));
    }
    Ok(())
}

#[async_trait]
impl MappingStore for MemoryMappingStore {
    async fn upsert(&self, mut mapping: ChannelMapping) -> Result<ChannelMapping, StoreError> {
        validate(&mapping)?;
        let mut rows = self.rows.write().await;

        // Same link registered again: keep its id, take the new flags.
        if let Some(existing) = rows.values().find(|m| {
            m.id != mapping.id
                && m.channel == mapping.channel
                && m.property_id == mapping.property_id
                && m.org_id == mapping.org_id
                && m.external_listing_id == mapping.external_listing_id
        }) {
            mapping.id = existing.id;
            mapping.created_at = existing.created_at;
            mapping.last_sync_at = mapping.last_sync_at.or(existing.last_sync_at);
        }

        for other in rows.values().filter(|m| m.id != mapping.id && m.channel == mapping.channel) {
            if other.external_listing_id == mapping.external_listing_id {
                return Err(StoreError::Duplicate(format!(
                    "{} listing {} is already linked to property {}",
                    mapping.channel, mapping.external_listing_id, other.property_id
                )));
            }
            if mapping.sync_enabled
                && other.sync_enabled
                && other.property_id == mapping.property_id
                && other.org_id == mapping.org_id
            {
                return Err(StoreError::Duplicate(format!(
                    "property {} already has an active {} mapping",
                    mapping.property_id, mapping.channel
                )));
            }
        }

        info!(
            property_id = mapping.property_id,
            channel = %mapping.channel,
            listing = %mapping.external_listing_id,
            "mapping stored"
        );
        rows.insert(mapping.id, mapping.clone());
        Ok(mapping)
    }

    async fn get(&self, id: Ulid) -> Option<ChannelMapping> {
        self.rows.read().await.get(&id).cloned()
    }

    async fn find_by_listing(
        &self,
        channel: ChannelName,
        external_listing_id: &str,
    ) -> Option<ChannelMapping> {
        self.rows
            .read()
            .await
            .values()
            .find(|m| m.channel == channel && m.external_listing_id == external_listing_id)
            .cloned()
    }

    async fn find(
        &self,
        property_id: PropertyId,
        org_id: OrgId,
        channel: ChannelName,
    ) -> Option<ChannelMapping> {
        self.rows
            .read()
            .await
            .values()
            .find(|m| {
                m.sync_enabled
                    && m.channel == channel
                    && m.property_id == property_id
                    && m.org_id == org_id
            })
            .cloned()
    }

    async fn active_for_property(&self, property_id: PropertyId, org_id: OrgId) -> Vec<ChannelMapping> {
        let mut out: Vec<ChannelMapping> = self
            .rows
            .read()
            .await
            .values()
            .filter(|m| m.sync_enabled && m.property_id == property_id && m.org_id == org_id)
            .cloned()
            .collect();
        out.sort_by_key(|m| m.channel);
        out
    }

    async fn active_for_channel(&self, channel: ChannelName) -> Vec<ChannelMapping> {
        let mut out: Vec<ChannelMapping> = self
            .rows
            .read()
            .await
            .values()
            .filter(|m| m.sync_enabled && m.channel == channel)
            .cloned()
            .collect();
        out.sort_by_key(|m| m.property_id);
        out
    }

    async fn disable(&self, id: Ulid) -> Result<(), StoreError> {
        let mut rows = self.rows.write().await;
        let row = rows.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        row.sync_enabled = false;
        Ok(())
    }

    async fn remove(&self, id: Ulid) -> Result<ChannelMapping, StoreError> {
        self.rows
            .write()
            .await
            .remove(&id)
            .ok_or(StoreError::NotFound(id))
    }

    async fn touch_last_sync(&self, id: Ulid, at: Ms) -> Result<(), StoreError> {
        let mut rows = self.rows.write().await;
        let row = rows.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        row.last_sync_at = Some(at);
        Ok(())
    }

    async fn ensure_direct(&self, property_id: PropertyId, org_id: OrgId) -> Result<ChannelMapping, StoreError> {
        if let Some(existing) = self.find(property_id, org_id, ChannelName::Direct).await {
            return Ok(existing);
        }
        self.upsert(ChannelMapping::new(
            property_id,
            org_id,
            ChannelName::Direct,
            format!("direct-{property_id}"),
        ))
        .await
    }
}
