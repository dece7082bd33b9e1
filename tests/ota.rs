mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use chansync::channel::*;
use chansync::model::*;
use chansync::scheduler::{Scheduler, SchedulerConfig, SchedulerError, poll_channel};
use chansync::sync::SyncOrchestrator;

use common::*;

#[derive(Default)]
struct StubApi {
    fail: bool,
    delay: Option<Duration>,
    availability: Mutex<Vec<(String, Vec<AvailabilityUpdate>)>>,
    rates: Mutex<Vec<RateUpdate>>,
    reservations: Vec<ChannelReservation>,
    fail_listings: Vec<&'static str>,
    acknowledged: Mutex<Vec<String>>,
    calls: Mutex<u32>,
}

impl StubApi {
    async fn call(&self) -> Result<(), ConnectorError> {
        *self.calls.lock().unwrap() += 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(ConnectorError::Api("partner returned 502".into()));
        }
        Ok(())
    }

    fn calls(&self) -> u32 {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl ChannelApi for StubApi {
    async fn get_availability(&self, _listing_id: &str, _range: DateRange) -> Result<Vec<AvailabilityUpdate>, ConnectorError> {
        self.call().await?;
        Ok(Vec::new())
    }

    async fn update_availability(&self, listing_id: &str, updates: &[AvailabilityUpdate]) -> Result<u32, ConnectorError> {
        self.call().await?;
        self.availability
            .lock()
            .unwrap()
            .push((listing_id.to_string(), updates.to_vec()));
        Ok(updates.len() as u32)
    }

    async fn update_rates(&self, _listing_id: &str, rates: &[RateUpdate]) -> Result<u32, ConnectorError> {
        self.call().await?;
        self.rates.lock().unwrap().extend_from_slice(rates);
        Ok(rates.len() as u32)
    }

    async fn get_reservations(&self, listing_id: &str, _since: Ms) -> Result<Vec<ChannelReservation>, ConnectorError> {
        self.call().await?;
        if self.fail_listings.iter().any(|l| *l == listing_id) {
            return Err(ConnectorError::Api(format!("listing {listing_id} not found")));
        }
        Ok(self
            .reservations
            .iter()
            .filter(|r| r.listing_id == listing_id)
            .cloned()
            .collect())
    }

    async fn acknowledge_reservation(&self, reservation_id: &str) -> Result<(), ConnectorError> {
        self.call().await?;
        self.acknowledged.lock().unwrap().push(reservation_id.to_string());
        Ok(())
    }
}

fn connector(h: &Harness, api: Arc<StubApi>) -> OtaConnector {
    OtaConnector::new(ChannelName::Booking, api, h.engine.clone(), h.mappings.clone())
}

#[tokio::test]
async fn push_sends_ledger_state_and_records_last_sync() {
    let h = Harness::new("ota_push");
    let mapping = h.map(42, 10, ChannelName::Booking, "BK-77").await;
    h.engine.block(42, july(2, 4), 10, None, None, "AIRBNB").await.unwrap();
    let api = Arc::new(StubApi::default());
    let ota = connector(&h, api.clone());

    let result = ota.push_calendar_update(42, july(1, 6), 10).await.unwrap();
    assert!(matches!(result, SyncResult::Success { items_processed: 5, .. }), "{result:?}");

    let pushed = api.availability.lock().unwrap();
    let (listing, updates) = &pushed[0];
    assert_eq!(listing, "BK-77");
    let closed: Vec<_> = updates.iter().filter(|u| !u.available).map(|u| u.date).collect();
    assert_eq!(closed, vec![d(2025, 7, 2), d(2025, 7, 3)]);
    assert!(api.rates.lock().unwrap().is_empty());

    assert!(h.mappings.get(mapping.id).await.unwrap().last_sync_at.is_some());
}

#[tokio::test]
async fn rates_follow_availability_when_auto_push_pricing() {
    let h = Harness::new("ota_rates");
    h.mappings
        .upsert(ChannelMapping::new(42, 10, ChannelName::Booking, "BK-77").with_auto_push_pricing(true))
        .await
        .unwrap();
    h.engine
        .update_price(42, july(1, 3), Price::new(12_500, "EUR"), 10, "MANUAL")
        .await
        .unwrap();
    let api = Arc::new(StubApi::default());
    let ota = connector(&h, api.clone());

    let result = ota.push_calendar_update(42, july(1, 4), 10).await.unwrap();
    assert!(matches!(result, SyncResult::Success { items_processed: 5, .. }), "{result:?}");
    let rates = api.rates.lock().unwrap();
    assert_eq!(rates.len(), 2);
    assert!(rates.iter().all(|r| r.amount == 12_500 && r.currency == "EUR"));
}

#[tokio::test]
async fn push_without_mapping_is_an_error() {
    let h = Harness::new("ota_unmapped");
    let ota = connector(&h, Arc::new(StubApi::default()));
    let err = ota.push_calendar_update(42, july(1, 3), 10).await.unwrap_err();
    assert!(matches!(err, ConnectorError::MappingMissing { property_id: 42, .. }));
}

#[tokio::test]
async fn breaker_opens_after_repeated_failures() {
    let h = Harness::new("ota_breaker");
    h.map(42, 10, ChannelName::Booking, "BK-77").await;
    let api = Arc::new(StubApi {
        fail: true,
        ..Default::default()
    });
    let ota = connector(&h, api.clone()).with_breaker(2, Duration::from_secs(60));
    assert_eq!(ota.check_health(None).await, HealthStatus::Unknown);

    for _ in 0..2 {
        let err = ota.push_calendar_update(42, july(1, 3), 10).await.unwrap_err();
        assert!(matches!(err, ConnectorError::Api(_)));
    }
    let err = ota.push_calendar_update(42, july(1, 3), 10).await.unwrap_err();
    assert_eq!(err, ConnectorError::CircuitOpen(ChannelName::Booking));
    assert_eq!(api.calls(), 2);
    assert_eq!(ota.check_health(None).await, HealthStatus::Unhealthy);
}

#[tokio::test]
async fn slow_partner_times_out() {
    let h = Harness::new("ota_timeout");
    h.map(42, 10, ChannelName::Booking, "BK-77").await;
    let api = Arc::new(StubApi {
        delay: Some(Duration::from_millis(500)),
        ..Default::default()
    });
    let ota = connector(&h, api).with_timeout(Duration::from_millis(20));

    let err = ota.push_calendar_update(42, july(1, 3), 10).await.unwrap_err();
    assert_eq!(err, ConnectorError::Timeout(Duration::from_millis(20)));
}

fn reservation(id: &str, listing: &str) -> ChannelReservation {
    ChannelReservation {
        id: id.into(),
        listing_id: listing.into(),
        check_in: d(2025, 7, 1),
        check_out: d(2025, 7, 5),
        state: ReservationState::Confirmed,
        guest_name: Some("Grace".into()),
        updated_at: 1_751_000_000_000,
    }
}

#[tokio::test]
async fn polled_reservations_are_ingested_once_and_acknowledged() {
    let h = Harness::new("ota_poll");
    h.map(42, 10, ChannelName::Booking, "BK-77").await;
    let api = Arc::new(StubApi {
        reservations: vec![reservation("R-1", "BK-77"), reservation("R-2", "OTHER")],
        ..Default::default()
    });
    let ota = connector(&h, api.clone()).with_capabilities(&[Capability::OutboundCalendar, Capability::Polling]);
    let pipeline = h.pipeline();

    let next = poll_channel(&ota, &pipeline, 0).await;
    assert!(next > 0);
    let stored = h
        .log
        .find_by_external(ChannelName::Booking, "poll:R-1:reservation.confirmed:1751000000000")
        .unwrap();
    assert_eq!(stored.event_type, "reservation.confirmed");
    assert_eq!(h.log.len(), 1);
    assert_eq!(*api.acknowledged.lock().unwrap(), vec!["R-1".to_string()]);
    assert_eq!(h.bus.published("booking.reservations").len(), 1);

    poll_channel(&ota, &pipeline, next).await;
    assert_eq!(h.log.len(), 1);
    assert_eq!(h.bus.published("booking.reservations").len(), 1);
}

#[tokio::test]
async fn failed_poll_keeps_the_window() {
    let h = Harness::new("ota_poll_fail");
    h.map(42, 10, ChannelName::Booking, "BK-77").await;
    let api = Arc::new(StubApi {
        fail: true,
        ..Default::default()
    });
    let ota = connector(&h, api);
    let pipeline = h.pipeline();

    assert_eq!(poll_channel(&ota, &pipeline, 1234).await, 1234);
    assert!(h.log.is_empty());
}

#[tokio::test]
async fn one_failing_listing_does_not_stop_the_others() {
    let h = Harness::new("ota_poll_partial");
    h.map(42, 10, ChannelName::Booking, "BK-77").await;
    h.map(43, 10, ChannelName::Booking, "BK-88").await;
    let api = Arc::new(StubApi {
        reservations: vec![reservation("R-1", "BK-77"), reservation("R-2", "BK-88")],
        fail_listings: vec!["BK-77"],
        ..Default::default()
    });
    let ota = connector(&h, api.clone());

    let batch = ota.poll_events(0).await.unwrap();
    assert!(!batch.is_complete());
    assert_eq!(batch.events.len(), 1);
    assert_eq!(batch.failed_listings.len(), 1);
    assert_eq!(batch.failed_listings[0].0, "BK-77");

    // The good listing is ingested, but the window stays for the failed one.
    let pipeline = h.pipeline();
    assert_eq!(poll_channel(&ota, &pipeline, 1234).await, 1234);
    assert!(
        h.log
            .find_by_external(ChannelName::Booking, "poll:R-2:reservation.confirmed:1751000000000")
            .is_some()
    );
    assert_eq!(h.log.len(), 1);
    assert_eq!(*api.acknowledged.lock().unwrap(), vec!["R-2".to_string()]);
}

#[tokio::test]
async fn scheduler_polls_until_stopped() {
    let h = Harness::new("ota_scheduler");
    h.map(42, 10, ChannelName::Booking, "BK-77").await;
    let api = Arc::new(StubApi {
        reservations: vec![reservation("R-9", "BK-77")],
        ..Default::default()
    });
    let ota = connector(&h, api.clone()).with_capabilities(&[Capability::Polling]);
    let orchestrator = Arc::new(SyncOrchestrator::new(
        ConnectorRegistry::new([Arc::new(ota) as Arc<dyn ChannelConnector>]),
        h.mappings.clone(),
        h.sync_logs.clone(),
    ));
    let scheduler = Scheduler::new(
        orchestrator,
        Arc::new(h.pipeline()),
        h.engine.clone(),
        h.log.clone(),
        SchedulerConfig {
            poll_interval: Duration::from_secs(60),
            ..SchedulerConfig::default()
        },
    );

    scheduler.start().await.unwrap();
    assert_eq!(scheduler.start().await, Err(SchedulerError::AlreadyRunning));

    // The first tick fires immediately.
    tokio::time::timeout(Duration::from_secs(5), async {
        while h.log.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("poller never ran");

    scheduler.stop().await.unwrap();
    assert!(!scheduler.is_running().await);
    assert_eq!(scheduler.stop().await, Err(SchedulerError::NotRunning));
    assert_eq!(*api.acknowledged.lock().unwrap(), vec!["R-9".to_string()]);
}

#[tokio::test]
async fn direct_connector_always_succeeds() {
    let h = Harness::new("ota_direct");
    let direct = DirectConnector::new(h.mappings.clone());
    h.mappings.ensure_direct(42, 10).await.unwrap();

    assert!(direct.resolve_mapping(42, 10).await.is_some());
    let result = direct.push_calendar_update(42, july(1, 3), 10).await.unwrap();
    assert!(matches!(result, SyncResult::Success { items_processed: 0, .. }));
    assert_eq!(direct.check_health(None).await, HealthStatus::Healthy);
}
