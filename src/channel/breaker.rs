use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::model::{ChannelName, HealthStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    /// Cooldown elapsed; one probe call is allowed through.
    HalfOpen,
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    ever_called: bool,
}

/// Per-channel call guard.
///
/// Opens after `threshold` consecutive failures and rejects calls until
/// `cooldown` has passed. The first call after that is a probe: success
/// closes the breaker, failure reopens it.
pub struct CircuitBreaker {
    channel: ChannelName,
    threshold: u32,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(channel: ChannelName, threshold: u32, cooldown: Duration) -> Self {
        Self {
            channel,
            threshold: threshold.max(1),
            cooldown,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
                ever_called: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// May a call go out now? Moves Open to HalfOpen once the cooldown is over.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let cooled = inner.opened_at.is_none_or(|at| at.elapsed() >= self.cooldown);
                if cooled {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    info!(channel = %self.channel, "breaker half-open, probing");
                }
                cooled
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.lock();
        inner.ever_called = true;
        inner.consecutive_failures = 0;
        inner.probe_in_flight = false;
        if inner.state != BreakerState::Closed {
            info!(channel = %self.channel, "breaker closed");
        }
        inner.state = BreakerState::Closed;
        inner.opened_at = None;
    }

    pub fn on_failure(&self) {
        let mut inner = self.lock();
        inner.ever_called = true;
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.probe_in_flight = false;
        let trip = match inner.state {
            BreakerState::HalfOpen => true,
            BreakerState::Closed => inner.consecutive_failures >= self.threshold,
            BreakerState::Open => false,
        };
        if trip {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
            metrics::counter!(crate::observability::BREAKER_OPENED_TOTAL, "channel" => self.channel.as_str())
                .increment(1);
            warn!(
                channel = %self.channel,
                failures = inner.consecutive_failures,
                "breaker opened"
            );
        }
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn health(&self) -> HealthStatus {
        let inner = self.lock();
        if !inner.ever_called {
            return HealthStatus::Unknown;
        }
        match inner.state {
            BreakerState::Closed => HealthStatus::Healthy,
            BreakerState::HalfOpen => HealthStatus::Degraded,
            BreakerState::Open => HealthStatus::Unhealthy,
        }
    }
}
