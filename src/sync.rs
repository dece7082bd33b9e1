//! Outbound fan-out of ledger changes to every linked channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::ConnectorRegistry;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::store::{MappingStore, SyncLogStore};

pub struct SyncOrchestrator {
    registry: ConnectorRegistry,
    mappings: Arc<dyn MappingStore>,
    sync_logs: Arc<dyn SyncLogStore>,
}

enum Attempt {
    /// Connector lacks outbound calendar support: no push, no log row.
    CapabilitySkip,
    Pushed(JoinHandle<SyncResult>, Instant),
    Unregistered,
}

impl SyncOrchestrator {
    pub fn new(
        registry: ConnectorRegistry,
        mappings: Arc<dyn MappingStore>,
        sync_logs: Arc<dyn SyncLogStore>,
    ) -> Self {
        Self {
            registry,
            mappings,
            sync_logs,
        }
    }

    pub fn registry(&self) -> &ConnectorRegistry {
        &self.registry
    }

    pub fn mappings(&self) -> &Arc<dyn MappingStore> {
        &self.mappings
    }

    /// Operator "sync now": push `range` to every active mapping.
    pub async fn sync_property(
        &self,
        property_id: PropertyId,
        range: DateRange,
        org_id: OrgId,
    ) -> HashMap<ChannelName, SyncResult> {
        self.fan_out(property_id, range, org_id, None).await
    }

    /// Fan out a ledger change. A change written by a channel is not echoed back to it.
    pub async fn on_calendar_changed(&self, change: &CalendarChanged) -> HashMap<ChannelName, SyncResult> {
        let origin = change.source.parse::<ChannelName>().ok();
        self.fan_out(change.property_id, change.range, change.org_id, origin)
            .await
    }

    /// One push per mapping, each on its own task. No channel's outcome
    /// affects another's.
    async fn fan_out(
        &self,
        property_id: PropertyId,
        range: DateRange,
        org_id: OrgId,
        exclude: Option<ChannelName>,
    ) -> HashMap<ChannelName, SyncResult> {
        let mappings = self.mappings.active_for_property(property_id, org_id).await;

        let mut attempts = Vec::with_capacity(mappings.len());
        for mapping in mappings {
            let channel = mapping.channel;
            if Some(channel) == exclude {
                continue;
            }
            let attempt = match self.registry.get_connector(channel) {
                None => Attempt::Unregistered,
                Some(c) if !c.supports(Capability::OutboundCalendar) => Attempt::CapabilitySkip,
                Some(connector) => {
                    let started = Instant::now();
                    let handle = tokio::spawn(async move {
                        match connector.push_calendar_update(property_id, range, org_id).await {
                            Ok(result) => result,
                            Err(e) => SyncResult::failed(e.to_string()),
                        }
                    });
                    Attempt::Pushed(handle, started)
                }
            };
            attempts.push((channel, attempt));
        }

        let mut results = HashMap::with_capacity(attempts.len());
        for (channel, attempt) in attempts {
            let (result, elapsed) = match attempt {
                Attempt::CapabilitySkip => {
                    debug!(channel = %channel, property_id, "connector has no outbound calendar");
                    results.insert(channel, SyncResult::skipped("outbound calendar not supported"));
                    continue;
                }
                Attempt::Unregistered => (
                    SyncResult::failed(format!("no connector registered for {channel}")),
                    0.0,
                ),
                Attempt::Pushed(handle, started) => {
                    let result = match handle.await {
                        Ok(result) => result,
                        Err(e) => SyncResult::failed(format!("connector task failed: {e}")),
                    };
                    (result, started.elapsed().as_secs_f64())
                }
            };

            match &result {
                SyncResult::Failed { message } => {
                    observability::record_sync_failure(channel, elapsed);
                    warn!(channel = %channel, property_id, %range, "push failed: {message}");
                }
                _ => {
                    observability::record_sync_success(channel, elapsed);
                    debug!(channel = %channel, property_id, %range, "push done");
                }
            }
            self.sync_logs
                .append(SyncLog::from_result(
                    channel,
                    property_id,
                    org_id,
                    &result,
                    (elapsed * 1000.0) as u64,
                ))
                .await;
            results.insert(channel, result);
        }

        let failed = results
            .values()
            .filter(|r| matches!(r, SyncResult::Failed { .. }))
            .count();
        info!(property_id, %range, channels = results.len(), failed, "fan-out complete");
        results
    }

    /// Drive fan-out from the ledger's change signal until cancelled.
    pub fn spawn_listener(self: Arc<Self>, notify: &NotifyHub, cancel: CancellationToken) -> JoinHandle<()> {
        let mut rx = notify.subscribe_all();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Ok(change) => {
                            self.on_calendar_changed(&change).await;
                        }
                        Err(RecvError::Lagged(n)) => {
                            warn!(skipped = n, "fan-out listener lagged; changes dropped");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            debug!("fan-out listener stopped");
        })
    }
}
