use std::io;
use std::path::PathBuf;

use dashmap::{DashMap, DashSet};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;
use ulid::Ulid;

use crate::model::*;
use crate::wal::{Wal, WalWriter};

use super::StoreError;

pub enum InsertOutcome<'a> {
    /// New row. The caller owns its publish.
    Inserted(WebhookEvent, PublishClaim<'a>),
    /// An event with the same `(channel, external_event_id)` already exists.
    /// The claim is present only when the row is still unpublished and no
    /// other delivery is publishing it.
    Duplicate(WebhookEvent, Option<PublishClaim<'a>>),
}

/// Exclusive right to publish one stored event. Released on drop.
pub struct PublishClaim<'a> {
    id: Ulid,
    in_flight: &'a DashSet<Ulid>,
}

impl PublishClaim<'_> {
    pub fn event_id(&self) -> Ulid {
        self.id
    }
}

impl Drop for PublishClaim<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.id);
    }
}

/// Durable log of inbound notifications, journaled to its own WAL.
///
/// `(channel, external_event_id)` is the dedup key; rows are never deleted.
pub struct WebhookLog {
    events: DashMap<Ulid, WebhookEvent>,
    by_external: DashMap<(ChannelName, String), Ulid>,
    wal: WalWriter<WebhookRecord>,
    /// Serialises dedup check + append + index insert + claim.
    insert_gate: Mutex<()>,
    /// Events some delivery is currently publishing.
    publishing: DashSet<Ulid>,
    /// Writes share it; compaction takes it exclusively so no record lands
    /// in the old file after the snapshot.
    compaction: RwLock<()>,
}

fn apply(events: &DashMap<Ulid, WebhookEvent>, record: &WebhookRecord) {
    match record {
        WebhookRecord::Received(event) => {
            events.insert(event.id, event.clone());
        }
        WebhookRecord::Published { id, at } => {
            if let Some(mut e) = events.get_mut(id) {
                e.published_at = Some(*at);
            }
        }
        WebhookRecord::StatusChanged {
            id,
            status,
            retry_count,
            error_message,
            processed_at,
        } => {
            if let Some(mut e) = events.get_mut(id) {
                e.status = *status;
                e.retry_count = *retry_count;
                e.error_message = error_message.clone();
                e.processed_at = *processed_at;
            }
        }
    }
}

impl WebhookLog {
    pub fn open(wal_path: PathBuf) -> io::Result<Self> {
        let records = Wal::<WebhookRecord>::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;

        let events = DashMap::new();
        for record in &records {
            apply(&events, record);
        }
        let by_external = DashMap::new();
        for e in events.iter() {
            by_external.insert((e.channel, e.external_event_id.clone()), e.id);
        }
        debug!(records = records.len(), events = events.len(), "webhook log replayed");

        Ok(Self {
            events,
            by_external,
            wal: WalWriter::spawn(wal, "webhooks"),
            insert_gate: Mutex::new(()),
            publishing: DashSet::new(),
            compaction: RwLock::new(()),
        })
    }

    pub fn get(&self, id: Ulid) -> Option<WebhookEvent> {
        self.events.get(&id).map(|e| e.value().clone())
    }

    pub fn find_by_external(&self, channel: ChannelName, external_event_id: &str) -> Option<WebhookEvent> {
        let id = *self
            .by_external
            .get(&(channel, external_event_id.to_string()))?
            .value();
        self.get(id)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Persist `event` unless its dedup key is already present.
    ///
    /// At most one publish claim per event exists at a time, and none once
    /// the event is marked published.
    pub async fn insert_if_absent(&self, event: WebhookEvent) -> Result<InsertOutcome<'_>, StoreError> {
        let _gate = self.insert_gate.lock().await;
        if let Some(existing) = self.find_by_external(event.channel, &event.external_event_id) {
            let claim = if existing.published_at.is_none() {
                self.claim(existing.id)
            } else {
                None
            };
            return Ok(InsertOutcome::Duplicate(existing, claim));
        }
        self.persist(WebhookRecord::Received(event.clone())).await?;
        self.by_external
            .insert((event.channel, event.external_event_id.clone()), event.id);
        self.publishing.insert(event.id);
        let claim = PublishClaim {
            id: event.id,
            in_flight: &self.publishing,
        };
        Ok(InsertOutcome::Inserted(event, claim))
    }

    fn claim(&self, id: Ulid) -> Option<PublishClaim<'_>> {
        self.publishing.insert(id).then(|| PublishClaim {
            id,
            in_flight: &self.publishing,
        })
    }

    /// Record the publish. Takes the claim so the row reads as published
    /// before any other delivery can claim it again.
    pub async fn mark_published(&self, claim: PublishClaim<'_>) -> Result<(), StoreError> {
        let id = claim.event_id();
        self.require(id)?;
        self.persist(WebhookRecord::Published { id, at: now_ms() }).await
    }

    pub async fn mark_processed(&self, id: Ulid) -> Result<WebhookEvent, StoreError> {
        let current = self.require(id)?;
        self.change_status(id, EventStatus::Processed, current.retry_count, None, Some(now_ms()))
            .await
    }

    /// Terminal failure: message stored, retry count bumped.
    pub async fn mark_failed(&self, id: Ulid, message: &str) -> Result<WebhookEvent, StoreError> {
        let current = self.require(id)?;
        self.change_status(
            id,
            EventStatus::Failed,
            current.retry_count + 1,
            Some(message.to_string()),
            Some(now_ms()),
        )
        .await
    }

    /// Transient failure: status stays as it is, retry count bumped.
    pub async fn record_retry(&self, id: Ulid, message: &str) -> Result<WebhookEvent, StoreError> {
        let current = self.require(id)?;
        self.change_status(
            id,
            current.status,
            current.retry_count + 1,
            Some(message.to_string()),
            current.processed_at,
        )
        .await
    }

    /// Rewrite the log with one `Received` record per event.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _gate = self.insert_gate.lock().await;
        let _exclusive = self.compaction.write().await;
        let mut snapshot: Vec<WebhookEvent> = self.events.iter().map(|e| e.value().clone()).collect();
        snapshot.sort_by_key(|e| e.id);
        self.wal
            .compact(snapshot.into_iter().map(WebhookRecord::Received).collect())
            .await
            .map_err(|e| StoreError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.wal.appends_since_compact().await
    }

    fn require(&self, id: Ulid) -> Result<WebhookEvent, StoreError> {
        self.get(id).ok_or(StoreError::NotFound(id))
    }

    async fn change_status(
        &self,
        id: Ulid,
        status: EventStatus,
        retry_count: u32,
        error_message: Option<String>,
        processed_at: Option<Ms>,
    ) -> Result<WebhookEvent, StoreError> {
        self.persist(WebhookRecord::StatusChanged {
            id,
            status,
            retry_count,
            error_message,
            processed_at,
        })
        .await?;
        self.require(id)
    }

    /// WAL-append then apply, both inside the shared compaction guard.
    async fn persist(&self, record: WebhookRecord) -> Result<(), StoreError> {
        let _shared = self.compaction.read().await;
        self.wal
            .append(record.clone())
            .await
            .map_err(|e| StoreError::WalError(e.to_string()))?;
        apply(&self.events, &record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("chansync_test_webhooks");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn event(external_id: &str) -> WebhookEvent {
        WebhookEvent {
            id: Ulid::new(),
            external_event_id: external_id.into(),
            channel: ChannelName::Airbnb,
            event_type: "calendar.blocked".into(),
            payload: "{}".into(),
            signature: None,
            status: EventStatus::Pending,
            retry_count: 0,
            error_message: None,
            received_at: now_ms(),
            processed_at: None,
            published_at: None,
        }
    }

    #[tokio::test]
    async fn duplicate_external_id_returns_existing() {
        let log = WebhookLog::open(test_wal_path("dedup.wal")).unwrap();
        let first = event("evt-1");
        let first_id = first.id;
        assert!(matches!(
            log.insert_if_absent(first).await.unwrap(),
            InsertOutcome::Inserted(..)
        ));

        match log.insert_if_absent(event("evt-1")).await.unwrap() {
            InsertOutcome::Duplicate(existing, _) => assert_eq!(existing.id, first_id),
            InsertOutcome::Inserted(..) => panic!("duplicate was inserted"),
        }
        assert_eq!(log.len(), 1);

        // Same external id on another channel is a different event.
        let mut other = event("evt-1");
        other.channel = ChannelName::Vrbo;
        assert!(matches!(
            log.insert_if_absent(other).await.unwrap(),
            InsertOutcome::Inserted(..)
        ));
    }

    #[tokio::test]
    async fn only_one_delivery_holds_the_publish_claim() {
        let log = WebhookLog::open(test_wal_path("claim.wal")).unwrap();
        let InsertOutcome::Inserted(stored, claim) = log.insert_if_absent(event("evt-c")).await.unwrap() else {
            panic!("first delivery should insert");
        };

        // Unpublished but in flight: the redelivery gets no claim.
        let InsertOutcome::Duplicate(_, second) = log.insert_if_absent(event("evt-c")).await.unwrap() else {
            panic!("redelivery should be a duplicate");
        };
        assert!(second.is_none());

        // A failed publish drops its claim; the next redelivery may retry.
        drop(claim);
        let InsertOutcome::Duplicate(_, retry) = log.insert_if_absent(event("evt-c")).await.unwrap() else {
            panic!("redelivery should be a duplicate");
        };
        let retry = retry.expect("released claim should be available again");
        assert_eq!(retry.event_id(), stored.id);
        log.mark_published(retry).await.unwrap();

        let InsertOutcome::Duplicate(published, none) = log.insert_if_absent(event("evt-c")).await.unwrap() else {
            panic!("redelivery should be a duplicate");
        };
        assert!(published.published_at.is_some());
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn status_transitions() {
        let log = WebhookLog::open(test_wal_path("status.wal")).unwrap();
        let e = event("evt-2");
        let id = e.id;
        log.insert_if_absent(e).await.unwrap();

        let retried = log.record_retry(id, "lock timeout").await.unwrap();
        assert_eq!(retried.status, EventStatus::Pending);
        assert_eq!(retried.retry_count, 1);

        let failed = log.mark_failed(id, "bad payload").await.unwrap();
        assert_eq!(failed.status, EventStatus::Failed);
        assert_eq!(failed.retry_count, 2);
        assert_eq!(failed.error_message.as_deref(), Some("bad payload"));

        assert!(matches!(
            log.mark_processed(Ulid::new()).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn replay_restores_events_and_index() {
        let path = test_wal_path("replay.wal");
        let id = {
            let log = WebhookLog::open(path.clone()).unwrap();
            let e = event("evt-3");
            let id = e.id;
            let InsertOutcome::Inserted(_, claim) = log.insert_if_absent(e).await.unwrap() else {
                panic!("fresh event should insert");
            };
            log.mark_published(claim).await.unwrap();
            log.mark_processed(id).await.unwrap();
            id
        };

        let log = WebhookLog::open(path).unwrap();
        let e = log.find_by_external(ChannelName::Airbnb, "evt-3").unwrap();
        assert_eq!(e.id, id);
        assert_eq!(e.status, EventStatus::Processed);
        assert!(e.published_at.is_some());
        assert!(e.processed_at.is_some());
    }

    #[tokio::test]
    async fn compaction_keeps_latest_state() {
        let path = test_wal_path("compact.wal");
        {
            let log = WebhookLog::open(path.clone()).unwrap();
            for i in 0..5 {
                let e = event(&format!("evt-{i}"));
                let id = e.id;
                log.insert_if_absent(e).await.unwrap();
                log.mark_failed(id, "boom").await.unwrap();
            }
            log.compact().await.unwrap();
            assert_eq!(log.wal_appends_since_compact().await, 0);
        }

        let log = WebhookLog::open(path).unwrap();
        assert_eq!(log.len(), 5);
        let e = log.find_by_external(ChannelName::Airbnb, "evt-4").unwrap();
        assert_eq!(e.status, EventStatus::Failed);
        assert_eq!(e.retry_count, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn status_writes_racing_compaction_survive_replay() {
        let path = test_wal_path("compact_race.wal");
        let ids: Vec<Ulid> = {
            let log = std::sync::Arc::new(WebhookLog::open(path.clone()).unwrap());
            let mut ids = Vec::new();
            for i in 0..100 {
                let e = event(&format!("evt-race-{i}"));
                ids.push(e.id);
                log.insert_if_absent(e).await.unwrap();
            }

            let mut tasks = Vec::new();
            for id in ids.clone() {
                let log = log.clone();
                tasks.push(tokio::spawn(async move {
                    log.mark_processed(id).await.unwrap();
                }));
            }
            for _ in 0..10 {
                let log = log.clone();
                tasks.push(tokio::spawn(async move {
                    log.compact().await.unwrap();
                }));
            }
            for task in tasks {
                task.await.unwrap();
            }
            ids
        };

        let log = WebhookLog::open(path).unwrap();
        assert_eq!(log.len(), ids.len());
        for id in ids {
            assert_eq!(log.get(id).unwrap().status, EventStatus::Processed, "{id}");
        }
    }
}
