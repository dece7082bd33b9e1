use std::collections::BTreeMap;
use std::sync::Arc;

use crate::model::{Capability, ChannelName};

use super::ChannelConnector;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    Unregistered(ChannelName),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::Unregistered(channel) => {
                write!(f, "no connector registered for channel {channel}")
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// Connectors keyed by channel. Built once at startup and never mutated.
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    connectors: BTreeMap<ChannelName, Arc<dyn ChannelConnector>>,
}

impl ConnectorRegistry {
    /// Later entries for the same channel replace earlier ones.
    pub fn new(connectors: impl IntoIterator<Item = Arc<dyn ChannelConnector>>) -> Self {
        let connectors = connectors
            .into_iter()
            .map(|c| (c.channel_name(), c))
            .collect();
        Self { connectors }
    }

    pub fn get_connector(&self, channel: ChannelName) -> Option<Arc<dyn ChannelConnector>> {
        self.connectors.get(&channel).cloned()
    }

    pub fn get_required_connector(
        &self,
        channel: ChannelName,
    ) -> Result<Arc<dyn ChannelConnector>, RegistryError> {
        self.get_connector(channel)
            .ok_or(RegistryError::Unregistered(channel))
    }

    pub fn get_connectors_with_capability(&self, capability: Capability) -> Vec<Arc<dyn ChannelConnector>> {
        self.connectors
            .values()
            .filter(|c| c.supports(capability))
            .cloned()
            .collect()
    }

    pub fn channels(&self) -> impl Iterator<Item = ChannelName> + '_ {
        self.connectors.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }
}
