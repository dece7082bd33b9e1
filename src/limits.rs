use std::time::Duration;

/// Longest range a single ledger mutation may touch (ten years of nights).
pub const MAX_RANGE_NIGHTS: u64 = 3660;

pub const MAX_SOURCE_LABEL_LEN: usize = 64;
pub const MAX_REASON_LEN: usize = 1024;
pub const MAX_EXTERNAL_ID_LEN: usize = 256;

pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(5);
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30);

pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 256 * 1024;

pub const DEFAULT_CONNECTOR_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_BREAKER_THRESHOLD: u32 = 5;
pub const DEFAULT_BREAKER_COOLDOWN: Duration = Duration::from_secs(60);

/// Deliveries of one bus message before it is routed to the dead-letter topic.
pub const MAX_DELIVERIES: u32 = 5;
pub const REDELIVERY_BASE_DELAY: Duration = Duration::from_millis(500);
