use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::limits::*;
use crate::model::ChannelName;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Invalid { var: String, value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { var, value } => write!(f, "invalid value for {var}: {value:?}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Per-channel outbound API settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEndpoint {
    pub base_url: String,
    pub token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub redis_url: Option<String>,
    pub lock_wait: Duration,
    pub lock_ttl: Duration,
    pub poll_interval: Duration,
    pub connector_timeout: Duration,
    pub breaker_threshold: u32,
    pub breaker_cooldown: Duration,
    pub max_payload_bytes: usize,
    pub compact_threshold: u64,
    pub webhook_secrets: HashMap<ChannelName, String>,
    pub endpoints: HashMap<ChannelName, ChannelEndpoint>,
}

impl Config {
    /// Read `CHANSYNC_*` from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let parse = |var: &str| -> Result<Option<u64>, ConfigError> { parsed(&get, var) };
        let millis = |var: &str, default: Duration| -> Result<Duration, ConfigError> {
            Ok(parse(var)?.map(Duration::from_millis).unwrap_or(default))
        };
        let secs = |var: &str, default: Duration| -> Result<Duration, ConfigError> {
            Ok(parse(var)?.map(Duration::from_secs).unwrap_or(default))
        };

        let mut webhook_secrets = HashMap::new();
        let mut endpoints = HashMap::new();
        for channel in ChannelName::ALL {
            let name = channel.as_str();
            if let Some(secret) = get(&format!("CHANSYNC_WEBHOOK_SECRET_{name}")).filter(|s| !s.is_empty()) {
                webhook_secrets.insert(channel, secret);
            }
            if let Some(base_url) = get(&format!("CHANSYNC_CHANNEL_URL_{name}")).filter(|s| !s.is_empty()) {
                let token = get(&format!("CHANSYNC_CHANNEL_TOKEN_{name}")).filter(|s| !s.is_empty());
                endpoints.insert(channel, ChannelEndpoint { base_url, token });
            }
        }

        Ok(Self {
            bind: get("CHANSYNC_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parsed(&get, "CHANSYNC_PORT")?.unwrap_or(8080),
            data_dir: PathBuf::from(get("CHANSYNC_DATA_DIR").unwrap_or_else(|| "./data".into())),
            metrics_port: parsed(&get, "CHANSYNC_METRICS_PORT")?,
            redis_url: get("CHANSYNC_REDIS_URL").filter(|s| !s.is_empty()),
            lock_wait: millis("CHANSYNC_LOCK_WAIT_MS", DEFAULT_LOCK_WAIT)?,
            lock_ttl: millis("CHANSYNC_LOCK_TTL_MS", DEFAULT_LOCK_TTL)?,
            poll_interval: secs("CHANSYNC_POLL_INTERVAL_SECS", Duration::from_secs(300))?,
            connector_timeout: millis("CHANSYNC_CONNECTOR_TIMEOUT_MS", DEFAULT_CONNECTOR_TIMEOUT)?,
            breaker_threshold: parsed(&get, "CHANSYNC_BREAKER_THRESHOLD")?.unwrap_or(DEFAULT_BREAKER_THRESHOLD),
            breaker_cooldown: secs("CHANSYNC_BREAKER_COOLDOWN_SECS", DEFAULT_BREAKER_COOLDOWN)?,
            max_payload_bytes: parsed(&get, "CHANSYNC_MAX_PAYLOAD_BYTES")?.unwrap_or(DEFAULT_MAX_PAYLOAD_BYTES),
            compact_threshold: parse("CHANSYNC_COMPACT_THRESHOLD")?.unwrap_or(1000),
            webhook_secrets,
            endpoints,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parsed<T: FromStr>(get: &impl Fn(&str) -> Option<String>, var: &str) -> Result<Option<T>, ConfigError> {
    match get(var) {
        None => Ok(None),
        Some(value) if value.trim().is_empty() => Ok(None),
        Some(value) => value.trim().parse().map(Some).map_err(|_| ConfigError::Invalid {
            var: var.to_string(),
            value,
        }),
    }
}
