use std::sync::Arc;
use std::time::Duration;

use deadpool_redis::{Config as RedisConfig, Runtime};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use chansync::bus::{EventBus, MemoryBus, RedisStreamBus};
use chansync::channel::{ChannelConnector, ConnectorRegistry, DirectConnector, HttpChannelApi, OtaConnector};
use chansync::config::Config;
use chansync::consumers::{
    CalendarConsumer, ConsumerContext, ConsumerRunner, DeadLetterConsumer, EventConsumer, ListingConsumer,
    LoggingSink, MessageConsumer, ReservationConsumer,
};
use chansync::engine::Engine;
use chansync::ingest::IngestPipeline;
use chansync::lock::{LocalLockService, LockService, RedisLockService, acquire_ledger_lease};
use chansync::model::ChannelName;
use chansync::notify::NotifyHub;
use chansync::scheduler::{Scheduler, SchedulerConfig};
use chansync::store::{MappingStore, MemoryMappingStore, MemorySyncLogStore, WebhookLog};
use chansync::sync::SyncOrchestrator;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    chansync::observability::init(config.metrics_port);
    std::fs::create_dir_all(&config.data_dir)?;

    let (locks, bus): (Arc<dyn LockService>, Arc<dyn EventBus>) = match &config.redis_url {
        Some(url) => {
            let pool = RedisConfig::from_url(url.clone()).create_pool(Some(Runtime::Tokio1))?;
            (
                Arc::new(RedisLockService::new(pool.clone(), config.lock_ttl)),
                Arc::new(RedisStreamBus::new(pool)),
            )
        }
        None => (Arc::new(LocalLockService::new()), Arc::new(MemoryBus::new())),
    };
    // The ledger lives in this process's data_dir; Redis only shares locks
    // and the bus, so exactly one instance may own it at a time.
    let ledger_lease = if config.redis_url.is_some() {
        Some(acquire_ledger_lease(locks.as_ref(), config.lock_wait).await?)
    } else {
        None
    };

    let notify = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::new(
        config.data_dir.join("calendar.wal"),
        locks.clone(),
        config.lock_wait,
        notify.clone(),
    )?);
    let log = Arc::new(WebhookLog::open(config.data_dir.join("webhooks.wal"))?);
    let mappings: Arc<dyn MappingStore> = Arc::new(MemoryMappingStore::new());
    let sync_logs = Arc::new(MemorySyncLogStore::new());

    let mut connectors: Vec<Arc<dyn ChannelConnector>> = vec![Arc::new(DirectConnector::new(mappings.clone()))];
    for (channel, endpoint) in &config.endpoints {
        if *channel == ChannelName::Direct {
            continue;
        }
        let mut api = HttpChannelApi::new(endpoint.base_url.clone(), config.connector_timeout)?;
        if let Some(token) = &endpoint.token {
            api = api.with_token(token.clone());
        }
        let connector = OtaConnector::new(*channel, Arc::new(api), engine.clone(), mappings.clone())
            .with_timeout(config.connector_timeout)
            .with_breaker(config.breaker_threshold, config.breaker_cooldown);
        connectors.push(Arc::new(connector));
    }
    let registry = ConnectorRegistry::new(connectors);
    let channels: Vec<ChannelName> = registry.channels().collect();

    let orchestrator = Arc::new(SyncOrchestrator::new(registry, mappings.clone(), sync_logs));
    let pipeline = Arc::new(
        IngestPipeline::new(log.clone(), bus.clone())
            .with_secrets(config.webhook_secrets.clone())
            .with_max_payload_bytes(config.max_payload_bytes),
    );

    let cancel = CancellationToken::new();
    let mut tasks = vec![orchestrator.clone().spawn_listener(&notify, cancel.clone())];

    let ctx = ConsumerContext::new(engine.clone(), mappings.clone());
    let sink = Arc::new(LoggingSink);
    let consumers: Vec<Arc<dyn EventConsumer>> = vec![
        Arc::new(CalendarConsumer::new(ctx.clone())),
        Arc::new(ReservationConsumer::new(ctx.clone(), sink.clone())),
        Arc::new(MessageConsumer::new(ctx.clone(), sink)),
        Arc::new(ListingConsumer::new(ctx)),
    ];
    for channel in &channels {
        for consumer in &consumers {
            if let Some(runner) = ConsumerRunner::for_channel(*channel, consumer.clone(), log.clone(), bus.clone()) {
                tasks.push(runner.start(cancel.clone()).await?);
            }
        }
    }
    let dead_letter = ConsumerRunner::dead_letter(Arc::new(DeadLetterConsumer), log.clone(), bus.clone());
    tasks.push(dead_letter.start(cancel.clone()).await?);

    let scheduler = Scheduler::new(
        orchestrator.clone(),
        pipeline.clone(),
        engine.clone(),
        log.clone(),
        SchedulerConfig {
            poll_interval: config.poll_interval,
            compact_threshold: config.compact_threshold,
            ..SchedulerConfig::default()
        },
    );
    scheduler.start().await?;

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("chansync listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  channels: {}", channels.iter().map(|c| c.as_str()).collect::<Vec<_>>().join(", "));
    info!("  backend: {}", if config.redis_url.is_some() { "redis" } else { "in-process" });
    info!("  properties replayed: {}", engine.property_count());

    let app = chansync::ingest::http::router(pipeline, orchestrator);
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    info!("shutdown signal received, stopping background tasks");
    cancel.cancel();
    scheduler.stop().await?;
    let drain = futures::future::join_all(tasks);
    if tokio::time::timeout(Duration::from_secs(10), drain).await.is_err() {
        tracing::warn!("drain timeout, some consumers still busy");
    }

    if let Some(lease) = ledger_lease {
        locks.release(lease).await?;
    }
    info!("chansync stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
