use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{CalendarChanged, PropertyId};

const CHANNEL_CAPACITY: usize = 1024;

/// Broadcast hub for local "calendar changed" signals.
///
/// Listeners either follow one property or the whole ledger.
pub struct NotifyHub {
    all: broadcast::Sender<CalendarChanged>,
    properties: DashMap<PropertyId, broadcast::Sender<CalendarChanged>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            all: broadcast::channel(CHANNEL_CAPACITY).0,
            properties: DashMap::new(),
        }
    }

    /// Subscribe to changes for one property. Creates the channel if needed.
    pub fn subscribe(&self, property_id: PropertyId) -> broadcast::Receiver<CalendarChanged> {
        let sender = self
            .properties
            .entry(property_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Subscribe to every change on every property.
    pub fn subscribe_all(&self) -> broadcast::Receiver<CalendarChanged> {
        self.all.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, change: &CalendarChanged) {
        let _ = self.all.send(change.clone());
        if let Some(sender) = self.properties.get(&change.property_id) {
            let _ = sender.send(change.clone());
        }
    }
}
