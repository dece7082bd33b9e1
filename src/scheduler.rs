use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::ChannelConnector;
use crate::engine::Engine;
use crate::ingest::IngestPipeline;
use crate::model::{Capability, Ms, now_ms};
use crate::store::WebhookLog;
use crate::sync::SyncOrchestrator;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    /// How often the compactor checks the WAL append counters.
    pub compact_check_interval: Duration,
    /// Appends since the last compaction that trigger a rewrite.
    pub compact_threshold: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(300),
            compact_check_interval: Duration::from_secs(30),
            compact_threshold: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    AlreadyRunning,
    NotRunning,
}

impl std::fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerError::AlreadyRunning => write!(f, "scheduler is already running"),
            SchedulerError::NotRunning => write!(f, "scheduler is not running"),
        }
    }
}

impl std::error::Error for SchedulerError {}

struct Running {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Owns the periodic background work: one poller per polling connector and
/// the WAL compactor. Nothing runs until [`Scheduler::start`].
pub struct Scheduler {
    orchestrator: Arc<SyncOrchestrator>,
    pipeline: Arc<IngestPipeline>,
    engine: Arc<Engine>,
    log: Arc<WebhookLog>,
    config: SchedulerConfig,
    running: Mutex<Option<Running>>,
}

impl Scheduler {
    pub fn new(
        orchestrator: Arc<SyncOrchestrator>,
        pipeline: Arc<IngestPipeline>,
        engine: Arc<Engine>,
        log: Arc<WebhookLog>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            orchestrator,
            pipeline,
            engine,
            log,
            config,
            running: Mutex::new(None),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub async fn start(&self) -> Result<(), SchedulerError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(SchedulerError::AlreadyRunning);
        }
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        for connector in self.orchestrator.registry().get_connectors_with_capability(Capability::Polling) {
            info!(channel = %connector.channel_name(), interval = ?self.config.poll_interval, "poller started");
            tasks.push(tokio::spawn(poll_loop(
                connector,
                self.pipeline.clone(),
                self.config.poll_interval,
                cancel.clone(),
            )));
        }
        tasks.push(tokio::spawn(compact_loop(
            self.engine.clone(),
            self.log.clone(),
            self.config.clone(),
            cancel.clone(),
        )));

        *running = Some(Running { cancel, tasks });
        Ok(())
    }

    /// Cancel every task and wait for them. A poll in progress finishes first.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        let Some(Running { cancel, tasks }) = self.running.lock().await.take() else {
            return Err(SchedulerError::NotRunning);
        };
        cancel.cancel();
        for task in tasks {
            if let Err(e) = task.await {
                error!("scheduler task ended abnormally: {e}");
            }
        }
        info!("scheduler stopped");
        Ok(())
    }
}

/// One polling round: fetch changes since `since`, ingest each through the
/// trusted path, acknowledge the stored ones. Returns the next `since`.
pub async fn poll_channel(connector: &dyn ChannelConnector, pipeline: &IngestPipeline, since: Ms) -> Ms {
    let channel = connector.channel_name();
    let started = now_ms();
    let batch = match connector.poll_events(since).await {
        Ok(batch) => batch,
        Err(e) => {
            warn!(channel = %channel, "poll failed: {e}");
            return since;
        }
    };
    if !batch.events.is_empty() {
        debug!(channel = %channel, count = batch.events.len(), "polled events");
    }
    for event in &batch.events {
        match pipeline.ingest_trusted(channel, &event.payload).await {
            Ok(_) => {
                if let Err(e) = connector.acknowledge(event).await {
                    warn!(channel = %channel, event = %event.external_event_id, "acknowledge failed: {e}");
                }
            }
            Err(e) => {
                warn!(channel = %channel, event = %event.external_event_id, "polled event not stored: {e}");
                // Retry the whole window next round; dedup absorbs repeats.
                return since;
            }
        }
    }
    if !batch.is_complete() {
        warn!(
            channel = %channel,
            failed = batch.failed_listings.len(),
            "some listings were not polled, keeping the window"
        );
        return since;
    }
    started
}

async fn poll_loop(
    connector: Arc<dyn ChannelConnector>,
    pipeline: Arc<IngestPipeline>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut since = now_ms() - interval.as_millis() as Ms;
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                since = poll_channel(connector.as_ref(), &pipeline, since).await;
            }
        }
    }
    debug!(channel = %connector.channel_name(), "poller stopped");
}

async fn compact_loop(engine: Arc<Engine>, log: Arc<WebhookLog>, config: SchedulerConfig, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(config.compact_check_interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if engine.wal_appends_since_compact().await >= config.compact_threshold {
                    match engine.compact_wal().await {
                        Ok(()) => info!("ledger WAL compacted"),
                        Err(e) => error!("ledger WAL compaction failed: {e}"),
                    }
                }
                if log.wal_appends_since_compact().await >= config.compact_threshold {
                    match log.compact().await {
                        Ok(()) => info!("webhook WAL compacted"),
                        Err(e) => error!("webhook WAL compaction failed: {e}"),
                    }
                }
            }
        }
    }
}
