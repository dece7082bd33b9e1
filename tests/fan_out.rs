mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use chansync::channel::{ChannelConnector, ConnectorError, ConnectorRegistry};
use chansync::model::*;
use chansync::sync::SyncOrchestrator;

use common::*;

#[derive(Clone, Copy)]
enum Behavior {
    Succeed,
    Fail,
    Panic,
}

struct StubConnector {
    channel: ChannelName,
    behavior: Behavior,
    capabilities: Vec<Capability>,
    pushes: AtomicU32,
}

impl StubConnector {
    fn new(channel: ChannelName, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            channel,
            behavior,
            capabilities: vec![Capability::OutboundCalendar],
            pushes: AtomicU32::new(0),
        })
    }

    fn inbound_only(channel: ChannelName) -> Arc<Self> {
        Arc::new(Self {
            channel,
            behavior: Behavior::Succeed,
            capabilities: vec![Capability::InboundCalendar],
            pushes: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl ChannelConnector for StubConnector {
    fn channel_name(&self) -> ChannelName {
        self.channel
    }

    fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    async fn resolve_mapping(&self, _property_id: PropertyId, _org_id: OrgId) -> Option<ChannelMapping> {
        None
    }

    async fn push_calendar_update(
        &self,
        _property_id: PropertyId,
        range: DateRange,
        _org_id: OrgId,
    ) -> Result<SyncResult, ConnectorError> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            Behavior::Succeed => Ok(SyncResult::Success {
                items_processed: range.nights() as u32,
                duration_ms: 1,
            }),
            Behavior::Fail => Err(ConnectorError::Api("503 from partner".into())),
            Behavior::Panic => panic!("connector bug"),
        }
    }

    async fn check_health(&self, _connection_id: Option<&str>) -> HealthStatus {
        HealthStatus::Healthy
    }
}

async fn mapped_harness(name: &str) -> Harness {
    let h = Harness::new(name);
    h.map(42, 10, ChannelName::Airbnb, "AIRBNB-123").await;
    h.map(42, 10, ChannelName::Booking, "BK-77").await;
    h.map(42, 10, ChannelName::Vrbo, "VR-9").await;
    h
}

fn orchestrator(h: &Harness, connectors: Vec<Arc<StubConnector>>) -> SyncOrchestrator {
    let connectors = connectors.into_iter().map(|c| c as Arc<dyn ChannelConnector>);
    SyncOrchestrator::new(
        ConnectorRegistry::new(connectors),
        h.mappings.clone(),
        h.sync_logs.clone(),
    )
}

#[tokio::test]
async fn panicking_connector_does_not_affect_the_others() {
    let h = mapped_harness("fan_out_panic").await;
    let orch = orchestrator(
        &h,
        vec![
            StubConnector::new(ChannelName::Airbnb, Behavior::Panic),
            StubConnector::new(ChannelName::Booking, Behavior::Succeed),
            StubConnector::new(ChannelName::Vrbo, Behavior::Succeed),
        ],
    );

    let results = orch.sync_property(42, july(1, 10), 10).await;
    assert_eq!(results.len(), 3);
    assert!(matches!(results[&ChannelName::Airbnb], SyncResult::Failed { .. }));
    assert!(results[&ChannelName::Booking].is_success());
    assert!(results[&ChannelName::Vrbo].is_success());

    let logs = h.sync_logs.for_property(42).await;
    assert_eq!(logs.len(), 3);
    let failed: Vec<_> = logs.iter().filter(|l| l.status == SyncStatus::Failed).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].channel, ChannelName::Airbnb);
    assert_eq!(logs.iter().filter(|l| l.status == SyncStatus::Success).count(), 2);
}

#[tokio::test]
async fn connector_error_becomes_failed_result() {
    let h = mapped_harness("fan_out_error").await;
    let orch = orchestrator(
        &h,
        vec![
            StubConnector::new(ChannelName::Airbnb, Behavior::Succeed),
            StubConnector::new(ChannelName::Booking, Behavior::Fail),
            StubConnector::new(ChannelName::Vrbo, Behavior::Succeed),
        ],
    );

    let results = orch.sync_property(42, july(1, 4), 10).await;
    match &results[&ChannelName::Booking] {
        SyncResult::Failed { message } => assert!(message.contains("503"), "{message}"),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(
        results[&ChannelName::Airbnb],
        SyncResult::Success {
            items_processed: 3,
            duration_ms: 1
        }
    );
}

#[tokio::test]
async fn no_echo_to_the_originating_channel() {
    let h = mapped_harness("fan_out_echo").await;
    let airbnb = StubConnector::new(ChannelName::Airbnb, Behavior::Succeed);
    let orch = orchestrator(
        &h,
        vec![
            airbnb.clone(),
            StubConnector::new(ChannelName::Booking, Behavior::Succeed),
            StubConnector::new(ChannelName::Vrbo, Behavior::Succeed),
        ],
    );

    let from_airbnb = CalendarChanged {
        property_id: 42,
        org_id: 10,
        range: july(1, 10),
        source: "AIRBNB".into(),
    };
    let results = orch.on_calendar_changed(&from_airbnb).await;
    assert!(!results.contains_key(&ChannelName::Airbnb));
    assert_eq!(results.len(), 2);
    assert_eq!(airbnb.pushes.load(Ordering::SeqCst), 0);

    let manual = CalendarChanged {
        source: "MANUAL".into(),
        ..from_airbnb
    };
    let results = orch.on_calendar_changed(&manual).await;
    assert_eq!(results.len(), 3);
    assert_eq!(airbnb.pushes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn connector_without_outbound_calendar_is_skipped_without_a_log() {
    let h = mapped_harness("fan_out_skip").await;
    let orch = orchestrator(
        &h,
        vec![
            StubConnector::inbound_only(ChannelName::Airbnb),
            StubConnector::new(ChannelName::Booking, Behavior::Succeed),
            StubConnector::new(ChannelName::Vrbo, Behavior::Succeed),
        ],
    );

    let results = orch.sync_property(42, july(1, 3), 10).await;
    assert!(matches!(results[&ChannelName::Airbnb], SyncResult::Skipped { .. }));
    let logs = h.sync_logs.for_property(42).await;
    assert_eq!(logs.len(), 2);
    assert!(logs.iter().all(|l| l.channel != ChannelName::Airbnb));
}

#[tokio::test]
async fn mapping_without_registered_connector_fails() {
    let h = mapped_harness("fan_out_unregistered").await;
    let orch = orchestrator(
        &h,
        vec![
            StubConnector::new(ChannelName::Booking, Behavior::Succeed),
            StubConnector::new(ChannelName::Vrbo, Behavior::Succeed),
        ],
    );

    let results = orch.sync_property(42, july(1, 3), 10).await;
    assert!(matches!(results[&ChannelName::Airbnb], SyncResult::Failed { .. }));
    assert_eq!(h.sync_logs.for_property(42).await.len(), 3);
}

#[tokio::test]
async fn disabled_mapping_is_not_pushed() {
    let h = Harness::new("fan_out_disabled");
    let m = h.map(42, 10, ChannelName::Airbnb, "AIRBNB-123").await;
    h.mappings.disable(m.id).await.unwrap();
    let airbnb = StubConnector::new(ChannelName::Airbnb, Behavior::Succeed);
    let orch = orchestrator(&h, vec![airbnb.clone()]);

    let results = orch.sync_property(42, july(1, 3), 10).await;
    assert!(results.is_empty());
    assert_eq!(airbnb.pushes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn ledger_change_drives_fan_out() {
    let h = mapped_harness("fan_out_listener").await;
    let orch = Arc::new(orchestrator(
        &h,
        vec![
            StubConnector::new(ChannelName::Airbnb, Behavior::Succeed),
            StubConnector::new(ChannelName::Booking, Behavior::Succeed),
            StubConnector::new(ChannelName::Vrbo, Behavior::Succeed),
        ],
    ));
    let cancel = CancellationToken::new();
    let listener = orch.clone().spawn_listener(&h.notify, cancel.clone());

    h.engine
        .block(42, july(3, 6), 10, None, Some("owner stay"), "BOOKING")
        .await
        .unwrap();

    let logs = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let logs = h.sync_logs.for_property(42).await;
            if logs.len() >= 2 {
                return logs;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("fan-out did not run");

    // Booking made the change, so only the other two hear about it.
    assert_eq!(logs.len(), 2);
    assert!(logs.iter().all(|l| l.channel != ChannelName::Booking));

    cancel.cancel();
    listener.await.unwrap();
}
