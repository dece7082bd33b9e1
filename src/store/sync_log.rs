use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::model::{PropertyId, SyncLog};

/// Append-only record of outbound push attempts.
#[async_trait]
pub trait SyncLogStore: Send + Sync {
    async fn append(&self, log: SyncLog);

    /// Rows for one property, oldest first.
    async fn for_property(&self, property_id: PropertyId) -> Vec<SyncLog>;

    async fn count(&self) -> usize;
}

#[derive(Default)]
pub struct MemorySyncLogStore {
    rows: RwLock<Vec<SyncLog>>,
}

impl MemorySyncLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SyncLogStore for MemorySyncLogStore {
    async fn append(&self, log: SyncLog) {
        self.rows.write().await.push(log);
    }

    async fn for_property(&self, property_id: PropertyId) -> Vec<SyncLog> {
        self.rows
            .read()
            .await
            .iter()
            .filter(|l| l.property_id == property_id)
            .cloned()
            .collect()
    }

    async fn count(&self) -> usize {
        self.rows.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChannelName, SyncResult, SyncStatus};

    #[test]
    fn rows_are_kept_per_property_in_order() {
        let store = MemorySyncLogStore::new();
        let failed = SyncResult::failed("timeout");
        let ok = SyncResult::Success {
            items_processed: 3,
            duration_ms: 12,
        };

        tokio_test::block_on(async {
            store.append(SyncLog::from_result(ChannelName::Airbnb, 1, 7, &failed, 5)).await;
            store.append(SyncLog::from_result(ChannelName::Vrbo, 2, 7, &ok, 12)).await;
            store.append(SyncLog::from_result(ChannelName::Booking, 1, 7, &ok, 9)).await;

            let rows = store.for_property(1).await;
            assert_eq!(rows.len(), 2);
            assert_eq!(rows[0].status, SyncStatus::Failed);
            assert_eq!(rows[0].message.as_deref(), Some("timeout"));
            assert_eq!(rows[1].channel, ChannelName::Booking);
            assert_eq!(store.count().await, 3);
        });
    }
}
