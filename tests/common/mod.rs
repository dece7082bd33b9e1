#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use ulid::Ulid;

use chansync::bus::MemoryBus;
use chansync::consumers::ConsumerContext;
use chansync::engine::Engine;
use chansync::ingest::IngestPipeline;
use chansync::lock::LocalLockService;
use chansync::model::*;
use chansync::notify::NotifyHub;
use chansync::store::{MappingStore, MemoryMappingStore, MemorySyncLogStore, SyncLogStore, WebhookLog};

pub const SECRET: &str = "test-secret";

pub fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

pub fn july(from: u32, to: u32) -> DateRange {
    DateRange::new(d(2025, 7, from), d(2025, 7, to))
}

pub fn test_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("chansync_it_{name}_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Everything in-process: local locks, memory bus, memory stores.
pub struct Harness {
    pub dir: PathBuf,
    pub locks: Arc<LocalLockService>,
    pub notify: Arc<NotifyHub>,
    pub engine: Arc<Engine>,
    pub log: Arc<WebhookLog>,
    pub bus: MemoryBus,
    pub mappings: Arc<dyn MappingStore>,
    pub sync_logs: Arc<dyn SyncLogStore>,
}

impl Harness {
    pub fn new(name: &str) -> Self {
        Self::with_lock_wait(name, Duration::from_secs(2))
    }

    pub fn with_lock_wait(name: &str, lock_wait: Duration) -> Self {
        let dir = test_dir(name);
        let locks = Arc::new(LocalLockService::new());
        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(
            Engine::new(dir.join("calendar.wal"), locks.clone(), lock_wait, notify.clone()).unwrap(),
        );
        let log = Arc::new(WebhookLog::open(dir.join("webhooks.wal")).unwrap());
        Self {
            dir,
            locks,
            notify,
            engine,
            log,
            bus: MemoryBus::new(),
            mappings: Arc::new(MemoryMappingStore::new()),
            sync_logs: Arc::new(MemorySyncLogStore::new()),
        }
    }

    /// Pipeline trusting `SECRET` for Airbnb and Booking.
    pub fn pipeline(&self) -> IngestPipeline {
        IngestPipeline::new(self.log.clone(), Arc::new(self.bus.clone()))
            .with_secret(ChannelName::Airbnb, SECRET)
            .with_secret(ChannelName::Booking, SECRET)
    }

    pub fn ctx(&self) -> ConsumerContext {
        ConsumerContext::new(self.engine.clone(), self.mappings.clone())
    }

    pub async fn map(&self, property_id: PropertyId, org_id: OrgId, channel: ChannelName, listing: &str) -> ChannelMapping {
        self.mappings
            .upsert(ChannelMapping::new(property_id, org_id, channel, listing))
            .await
            .unwrap()
    }
}
