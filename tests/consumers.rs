mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use chansync::bus::{BusMessage, Category, EventBus};
use chansync::consumers::*;
use chansync::engine::Engine;
use chansync::ingest::IngestPipeline;
use chansync::ingest::signature::sign;
use chansync::lock::LockService;
use chansync::model::*;
use chansync::store::WebhookLog;

use common::*;

async fn push(pipeline: &IngestPipeline, channel: ChannelName, body: Value) -> Ulid {
    let raw = body.to_string().into_bytes();
    let sig = sign(SECRET, &raw).unwrap();
    pipeline.ingest(channel, &raw, Some(&sig)).await.unwrap().event_id()
}

async fn wait_settled(log: &WebhookLog, id: Ulid) -> WebhookEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(event) = log.get(id).filter(|e| e.status != EventStatus::Pending) {
                return event;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("event was not settled in time")
}

fn calendar_event(event_id: &str, event_type: &str, listing: &str, from: &str, to: &str) -> Value {
    json!({
        "eventId": event_id,
        "eventType": event_type,
        "listingId": listing,
        "from": from,
        "to": to,
    })
}

async fn start(h: &Harness, channel: ChannelName, consumer: Arc<dyn EventConsumer>, cancel: &CancellationToken) {
    let bus: Arc<dyn EventBus> = Arc::new(h.bus.clone());
    ConsumerRunner::for_channel(channel, consumer, h.log.clone(), bus)
        .unwrap()
        .start(cancel.clone())
        .await
        .unwrap();
}

#[tokio::test]
async fn airbnb_block_then_unblock_round_trip() {
    let h = Harness::new("consumer_e2e");
    h.map(42, 10, ChannelName::Airbnb, "AIRBNB-123").await;
    let pipeline = h.pipeline();
    let cancel = CancellationToken::new();
    start(&h, ChannelName::Airbnb, Arc::new(CalendarConsumer::new(h.ctx())), &cancel).await;

    let blocked = push(
        &pipeline,
        ChannelName::Airbnb,
        calendar_event("evt-b", "calendar.blocked", "AIRBNB-123", "2025-07-01", "2025-07-10"),
    )
    .await;
    assert_eq!(wait_settled(&h.log, blocked).await.status, EventStatus::Processed);

    let days = h.engine.days_in_range(42, july(1, 10)).await.unwrap();
    assert_eq!(days.len(), 9);
    for day in &days {
        assert_eq!(day.availability, Availability::Blocked);
        assert_eq!(day.block_source.as_deref(), Some("AIRBNB"));
    }
    assert!(h.engine.is_available(42, july(10, 12)).await.unwrap());

    let unblocked = push(
        &pipeline,
        ChannelName::Airbnb,
        calendar_event("evt-u", "calendar.unblocked", "AIRBNB-123", "2025-07-01", "2025-07-10"),
    )
    .await;
    let event = wait_settled(&h.log, unblocked).await;
    assert_eq!(event.status, EventStatus::Processed);
    assert!(event.processed_at.is_some());
    assert!(h.engine.is_available(42, july(1, 10)).await.unwrap());

    cancel.cancel();
}

#[tokio::test]
async fn unmapped_listing_is_processed_without_writes() {
    let h = Harness::new("consumer_unmapped");
    let pipeline = h.pipeline();
    let cancel = CancellationToken::new();
    start(&h, ChannelName::Airbnb, Arc::new(CalendarConsumer::new(h.ctx())), &cancel).await;

    let id = push(
        &pipeline,
        ChannelName::Airbnb,
        calendar_event("evt-x", "calendar.blocked", "NOPE-1", "2025-07-01", "2025-07-03"),
    )
    .await;
    assert_eq!(wait_settled(&h.log, id).await.status, EventStatus::Processed);
    assert_eq!(h.engine.property_count(), 0);
    cancel.cancel();
}

#[tokio::test]
async fn conflicting_channel_block_writes_nothing() {
    let h = Harness::new("consumer_conflict");
    h.map(42, 10, ChannelName::Airbnb, "AIRBNB-123").await;
    h.engine.block(42, july(5, 6), 10, None, Some("owner"), "MANUAL").await.unwrap();
    let pipeline = h.pipeline();
    let cancel = CancellationToken::new();
    start(&h, ChannelName::Airbnb, Arc::new(CalendarConsumer::new(h.ctx())), &cancel).await;

    let id = push(
        &pipeline,
        ChannelName::Airbnb,
        calendar_event("evt-c", "calendar.blocked", "AIRBNB-123", "2025-07-01", "2025-07-10"),
    )
    .await;
    assert_eq!(wait_settled(&h.log, id).await.status, EventStatus::Processed);
    assert!(h.engine.is_available(42, july(1, 5)).await.unwrap());
    assert!(h.engine.is_available(42, july(6, 10)).await.unwrap());
    let held = h.engine.get_day(42, d(2025, 7, 5)).await.unwrap();
    assert_eq!(held.block_source.as_deref(), Some("MANUAL"));
    cancel.cancel();
}

#[tokio::test]
async fn missing_dates_fail_the_event() {
    let h = Harness::new("consumer_bad_body");
    h.map(42, 10, ChannelName::Airbnb, "AIRBNB-123").await;
    let pipeline = h.pipeline();
    let cancel = CancellationToken::new();
    start(&h, ChannelName::Airbnb, Arc::new(CalendarConsumer::new(h.ctx())), &cancel).await;

    let id = push(
        &pipeline,
        ChannelName::Airbnb,
        json!({ "eventId": "evt-m", "eventType": "calendar.blocked", "listingId": "AIRBNB-123" }),
    )
    .await;
    let event = wait_settled(&h.log, id).await;
    assert_eq!(event.status, EventStatus::Failed);
    assert_eq!(event.retry_count, 1);
    assert!(event.error_message.is_some());
    cancel.cancel();
}

#[tokio::test]
async fn lock_timeout_is_retried_until_the_lock_frees() {
    let h = Harness::with_lock_wait("consumer_lock_retry", Duration::from_millis(50));
    h.map(42, 10, ChannelName::Airbnb, "AIRBNB-123").await;
    let pipeline = h.pipeline();
    let id = push(
        &pipeline,
        ChannelName::Airbnb,
        calendar_event("evt-l", "calendar.blocked", "AIRBNB-123", "2025-07-01", "2025-07-03"),
    )
    .await;

    let bus: Arc<dyn EventBus> = Arc::new(h.bus.clone());
    let runner = ConsumerRunner::for_channel(
        ChannelName::Airbnb,
        Arc::new(CalendarConsumer::new(h.ctx())),
        h.log.clone(),
        bus.clone(),
    )
    .unwrap();
    let mut sub = bus
        .subscribe(runner.topic(), &Category::Calendar.group(ChannelName::Airbnb), "test")
        .await
        .unwrap();

    let held = h.locks.acquire(&Engine::lock_key(42), Duration::from_secs(1)).await.unwrap();
    let first = sub.next().await.unwrap();
    assert_eq!(first.attempt, 1);
    runner.process(sub.as_mut(), first).await.unwrap();

    let event = h.log.get(id).unwrap();
    assert_eq!(event.status, EventStatus::Pending);
    assert_eq!(event.retry_count, 1);
    assert!(h.engine.is_available(42, july(1, 3)).await.unwrap());

    h.locks.release(held).await.unwrap();
    let second = tokio::time::timeout(Duration::from_secs(5), sub.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.attempt, 2);
    runner.process(sub.as_mut(), second).await.unwrap();

    assert_eq!(h.log.get(id).unwrap().status, EventStatus::Processed);
    assert!(!h.engine.is_available(42, july(1, 3)).await.unwrap());
}

#[tokio::test]
async fn settled_event_is_not_handled_twice() {
    let h = Harness::new("consumer_settled");
    h.map(42, 10, ChannelName::Airbnb, "AIRBNB-123").await;
    let pipeline = h.pipeline();
    let id = push(
        &pipeline,
        ChannelName::Airbnb,
        calendar_event("evt-s", "calendar.blocked", "AIRBNB-123", "2025-07-01", "2025-07-03"),
    )
    .await;
    h.log.mark_processed(id).await.unwrap();

    let bus: Arc<dyn EventBus> = Arc::new(h.bus.clone());
    let runner = ConsumerRunner::for_channel(
        ChannelName::Airbnb,
        Arc::new(CalendarConsumer::new(h.ctx())),
        h.log.clone(),
        bus.clone(),
    )
    .unwrap();
    let mut sub = bus
        .subscribe(runner.topic(), &Category::Calendar.group(ChannelName::Airbnb), "test")
        .await
        .unwrap();
    let delivery = sub.next().await.unwrap();
    runner.process(sub.as_mut(), delivery).await.unwrap();

    assert!(h.engine.is_available(42, july(1, 3)).await.unwrap());
}

// ── Reservations, messages, listings ─────────────────────

#[derive(Default)]
struct RecordingSink {
    received: Mutex<Vec<ReservationNotice>>,
    cancelled: Mutex<Vec<ReservationNotice>>,
    messages: Mutex<Vec<InboundMessage>>,
}

#[async_trait]
impl ReservationSink for RecordingSink {
    async fn reservation_received(&self, notice: &ReservationNotice) -> Result<(), SinkError> {
        self.received.lock().unwrap().push(notice.clone());
        Ok(())
    }

    async fn reservation_cancelled(&self, notice: &ReservationNotice) -> Result<(), SinkError> {
        self.cancelled.lock().unwrap().push(notice.clone());
        Ok(())
    }
}

#[async_trait]
impl MessageSink for RecordingSink {
    async fn message_received(&self, message: &InboundMessage) -> Result<(), SinkError> {
        self.messages.lock().unwrap().push(message.clone());
        Ok(())
    }
}

fn reservation_event(event_id: &str, event_type: &str) -> Value {
    json!({
        "eventId": event_id,
        "eventType": event_type,
        "listingId": "BK-77",
        "from": "2025-07-01",
        "to": "2025-07-10",
        "reservationId": "R-1001",
        "guestName": "Ada",
    })
}

#[tokio::test]
async fn reservation_holds_nights_and_notifies() {
    let h = Harness::new("consumer_reservation");
    h.map(42, 10, ChannelName::Booking, "BK-77").await;
    let sink = Arc::new(RecordingSink::default());
    let pipeline = h.pipeline();
    let cancel = CancellationToken::new();
    start(
        &h,
        ChannelName::Booking,
        Arc::new(ReservationConsumer::new(h.ctx(), sink.clone())),
        &cancel,
    )
    .await;

    let id = push(&pipeline, ChannelName::Booking, reservation_event("evt-r1", "reservation.confirmed")).await;
    assert_eq!(wait_settled(&h.log, id).await.status, EventStatus::Processed);

    let day = h.engine.get_day(42, d(2025, 7, 4)).await.unwrap();
    assert_eq!(day.availability, Availability::Blocked);
    assert_eq!(day.reason_code.as_deref(), Some("RESERVATION"));
    assert_eq!(day.reason_text.as_deref(), Some("R-1001"));
    {
        let received = sink.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].property_id, 42);
        assert_eq!(received[0].guest_name.as_deref(), Some("Ada"));
    }

    let id = push(&pipeline, ChannelName::Booking, reservation_event("evt-r2", "reservation.cancelled")).await;
    assert_eq!(wait_settled(&h.log, id).await.status, EventStatus::Processed);
    assert!(h.engine.is_available(42, july(1, 10)).await.unwrap());
    assert_eq!(sink.cancelled.lock().unwrap().len(), 1);
    cancel.cancel();
}

#[tokio::test]
async fn guest_message_is_forwarded() {
    let h = Harness::new("consumer_message");
    h.map(42, 10, ChannelName::Airbnb, "AIRBNB-123").await;
    let sink = Arc::new(RecordingSink::default());
    let pipeline = h.pipeline();
    let cancel = CancellationToken::new();
    start(&h, ChannelName::Airbnb, Arc::new(MessageConsumer::new(h.ctx(), sink.clone())), &cancel).await;

    let id = push(
        &pipeline,
        ChannelName::Airbnb,
        json!({
            "eventId": "evt-msg",
            "eventType": "message.received",
            "listingId": "AIRBNB-123",
            "message": "Is early check-in possible?",
        }),
    )
    .await;
    assert_eq!(wait_settled(&h.log, id).await.status, EventStatus::Processed);
    let messages = sink.messages.lock().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].text, "Is early check-in possible?");
    assert_eq!(messages[0].org_id, 10);
    cancel.cancel();
}

#[tokio::test]
async fn deleted_listing_disables_the_mapping() {
    let h = Harness::new("consumer_listing");
    let mapping = h.map(42, 10, ChannelName::Airbnb, "AIRBNB-123").await;
    let pipeline = h.pipeline();
    let cancel = CancellationToken::new();
    start(&h, ChannelName::Airbnb, Arc::new(ListingConsumer::new(h.ctx())), &cancel).await;

    let id = push(
        &pipeline,
        ChannelName::Airbnb,
        json!({ "eventId": "evt-del", "eventType": "listing.deleted", "listingId": "AIRBNB-123" }),
    )
    .await;
    assert_eq!(wait_settled(&h.log, id).await.status, EventStatus::Processed);
    assert!(!h.mappings.get(mapping.id).await.unwrap().sync_enabled);
    assert!(h.mappings.active_for_property(42, 10).await.is_empty());
    cancel.cancel();
}

#[tokio::test]
async fn unroutable_event_type_is_dead_lettered() {
    let h = Harness::new("consumer_dead_letter");
    let pipeline = h.pipeline();
    let cancel = CancellationToken::new();
    let bus: Arc<dyn EventBus> = Arc::new(h.bus.clone());
    ConsumerRunner::dead_letter(Arc::new(DeadLetterConsumer), h.log.clone(), bus)
        .start(cancel.clone())
        .await
        .unwrap();

    let id = push(
        &pipeline,
        ChannelName::Airbnb,
        json!({ "eventId": "evt-pay", "eventType": "payout.sent" }),
    )
    .await;
    let event = wait_settled(&h.log, id).await;
    assert_eq!(event.status, EventStatus::Failed);
    assert_eq!(event.error_message.as_deref(), Some("unroutable event type"));
    cancel.cancel();
}

struct PanickingConsumer;

#[async_trait]
impl EventConsumer for PanickingConsumer {
    fn category(&self) -> Option<Category> {
        Some(Category::Calendar)
    }

    async fn handle(&self, _message: &BusMessage) -> ConsumerOutcome {
        panic!("consumer bug")
    }
}

#[tokio::test]
async fn panicking_consumer_fails_the_event_and_keeps_running() {
    let h = Harness::new("consumer_panic");
    let pipeline = h.pipeline();
    let cancel = CancellationToken::new();
    start(&h, ChannelName::Airbnb, Arc::new(PanickingConsumer), &cancel).await;

    for n in 0..2 {
        let id = push(
            &pipeline,
            ChannelName::Airbnb,
            calendar_event(&format!("evt-p{n}"), "calendar.blocked", "AIRBNB-123", "2025-07-01", "2025-07-03"),
        )
        .await;
        let event = wait_settled(&h.log, id).await;
        assert_eq!(event.status, EventStatus::Failed);
        assert_eq!(event.error_message.as_deref(), Some("consumer panicked"));
    }
    cancel.cancel();
}
