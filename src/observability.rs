use std::net::SocketAddr;

use crate::model::ChannelName;

// ── Outbound sync ───────────────────────────────────────────────

/// Counter: outbound push attempts. Labels: channel, status.
pub const SYNC_TOTAL: &str = "chansync_sync_total";

/// Histogram: outbound push latency in seconds. Labels: channel.
pub const SYNC_DURATION_SECONDS: &str = "chansync_sync_duration_seconds";

/// Counter: circuit breaker transitions to open. Labels: channel.
pub const BREAKER_OPENED_TOTAL: &str = "chansync_breaker_opened_total";

// ── Calendar engine ─────────────────────────────────────────────

/// Counter: ledger mutations. Labels: op, status.
pub const MUTATIONS_TOTAL: &str = "chansync_mutations_total";

/// Histogram: time spent waiting for a property lock, in seconds.
pub const LOCK_WAIT_SECONDS: &str = "chansync_lock_wait_seconds";

/// Counter: lock acquisitions that hit the bounded wait.
pub const LOCK_TIMEOUTS_TOTAL: &str = "chansync_lock_timeouts_total";

/// Counter: block requests rejected because another source holds a night.
pub const CONFLICTS_TOTAL: &str = "chansync_conflicts_total";

// ── Ingestion ───────────────────────────────────────────────────

/// Counter: inbound webhooks. Labels: channel, outcome.
pub const WEBHOOKS_TOTAL: &str = "chansync_webhooks_total";

/// Counter: consumer outcomes. Labels: category, outcome.
pub const CONSUMER_OUTCOMES_TOTAL: &str = "chansync_consumer_outcomes_total";

// ── Storage ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds. Labels: log.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "chansync_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush). Labels: log.
pub const WAL_FLUSH_BATCH_SIZE: &str = "chansync_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus metrics exporter: {e}"),
    }
}

pub fn record_sync_success(channel: ChannelName, elapsed_secs: f64) {
    metrics::counter!(SYNC_TOTAL, "channel" => channel.as_str(), "status" => "success").increment(1);
    metrics::histogram!(SYNC_DURATION_SECONDS, "channel" => channel.as_str()).record(elapsed_secs);
}

pub fn record_sync_failure(channel: ChannelName, elapsed_secs: f64) {
    metrics::counter!(SYNC_TOTAL, "channel" => channel.as_str(), "status" => "failed").increment(1);
    metrics::histogram!(SYNC_DURATION_SECONDS, "channel" => channel.as_str()).record(elapsed_secs);
}
