mod conflict;
mod error;
mod mutations;
mod queries;

pub use error::EngineError;
pub use mutations::MutationSummary;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::lock::{LockError, LockService, LockToken};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::{Wal, WalWriter};

pub type SharedCalendar = Arc<RwLock<PropertyCalendar>>;

/// Authoritative availability/price ledger.
///
/// Every mutation runs under the property's advisory lock, validates and
/// writes the whole range as one WAL record, then applies it in memory.
/// A mutation either lands on every night of its range or on none.
pub struct Engine {
    pub(super) calendars: DashMap<PropertyId, SharedCalendar>,
    pub(super) wal: WalWriter<LedgerEvent>,
    pub(super) locks: Arc<dyn LockService>,
    pub(super) lock_wait: Duration,
    /// Mutations share it; compaction takes it exclusively so no write
    /// slips between the snapshot and the log swap.
    pub(super) compaction: RwLock<()>,
    pub notify: Arc<NotifyHub>,
}

/// Apply a ledger event directly to a calendar (caller holds the lock).
fn apply_to_calendar(cal: &mut PropertyCalendar, event: &LedgerEvent) {
    match event {
        LedgerEvent::DaysWritten { org_id, days, .. } => {
            cal.org_id = Some(*org_id);
            for day in days {
                cal.upsert(day.clone());
            }
        }
    }
}

fn event_property_id(event: &LedgerEvent) -> PropertyId {
    match event {
        LedgerEvent::DaysWritten { property_id, .. } => *property_id,
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        locks: Arc<dyn LockService>,
        lock_wait: Duration,
        notify: Arc<NotifyHub>,
    ) -> io::Result<Self> {
        let events = Wal::<LedgerEvent>::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;

        let calendars: DashMap<PropertyId, SharedCalendar> = DashMap::new();
        // Replay before anyone else can see the map, so try_write never contends.
        for event in &events {
            let property_id = event_property_id(event);
            let cal = calendars
                .entry(property_id)
                .or_insert_with(|| Arc::new(RwLock::new(PropertyCalendar::new(property_id))))
                .clone();
            if let Ok(mut guard) = cal.try_write() {
                apply_to_calendar(&mut guard, event);
            }
        }
        debug!(
            events = events.len(),
            properties = calendars.len(),
            "ledger replayed"
        );

        Ok(Self {
            calendars,
            wal: WalWriter::spawn(wal, "ledger"),
            locks,
            lock_wait,
            compaction: RwLock::new(()),
            notify,
        })
    }

    /// Lock-service key guarding one property's ledger rows.
    pub fn lock_key(property_id: PropertyId) -> String {
        format!("chansync:lock:property:{property_id}")
    }

    pub fn get_calendar(&self, property_id: PropertyId) -> Option<SharedCalendar> {
        self.calendars.get(&property_id).map(|e| e.value().clone())
    }

    pub fn property_count(&self) -> usize {
        self.calendars.len()
    }

    pub(super) fn calendar_or_default(&self, property_id: PropertyId) -> SharedCalendar {
        self.calendars
            .entry(property_id)
            .or_insert_with(|| Arc::new(RwLock::new(PropertyCalendar::new(property_id))))
            .clone()
    }

    pub(super) async fn lock_property(&self, property_id: PropertyId) -> Result<LockToken, EngineError> {
        let started = Instant::now();
        let result = self
            .locks
            .acquire(&Self::lock_key(property_id), self.lock_wait)
            .await;
        metrics::histogram!(crate::observability::LOCK_WAIT_SECONDS)
            .record(started.elapsed().as_secs_f64());
        match result {
            Ok(token) => Ok(token),
            Err(LockError::Timeout { waited, .. }) => {
                metrics::counter!(crate::observability::LOCK_TIMEOUTS_TOTAL).increment(1);
                warn!(property_id, waited_ms = waited.as_millis() as u64, "property lock timeout");
                Err(EngineError::LockTimeout {
                    property_id,
                    waited,
                })
            }
            Err(e) => Err(EngineError::Lock(e.to_string())),
        }
    }

    pub(super) async fn unlock_property(&self, token: LockToken) {
        let key = token.key().to_string();
        if let Err(e) = self.locks.release(token).await {
            warn!(key = %key, "failed to release property lock: {e}");
        }
    }

    /// WAL-append then apply. Nothing is applied if the append fails.
    pub(super) async fn persist_and_apply(
        &self,
        cal: &mut PropertyCalendar,
        event: LedgerEvent,
    ) -> Result<(), EngineError> {
        self.wal
            .append(event.clone())
            .await
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        apply_to_calendar(cal, &event);
        Ok(())
    }

    /// Rewrite the ledger WAL with one record per property.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.compaction.write().await;

        let calendars: Vec<SharedCalendar> = self.calendars.iter().map(|e| e.value().clone()).collect();
        let mut events = Vec::with_capacity(calendars.len());
        for cal in calendars {
            let guard = cal.read().await;
            let Some(org_id) = guard.org_id else { continue };
            events.push(LedgerEvent::DaysWritten {
                property_id: guard.property_id,
                org_id,
                days: guard.days.values().cloned().collect(),
            });
        }

        self.wal
            .compact(events)
            .await
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.wal.appends_since_compact().await
    }
}
