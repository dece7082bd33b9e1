//! Durable at-least-once event bus between ingestion and the category consumers.

mod memory;
mod redis;
pub mod topics;

pub use memory::MemoryBus;
pub use redis::RedisStreamBus;
pub use topics::{Category, DEAD_LETTER_TOPIC};

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::REDELIVERY_BASE_DELAY;
use crate::model::ChannelName;

/// What travels on the bus: a pointer to the stored webhook event plus its body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusMessage {
    pub event_id: Ulid,
    pub channel: ChannelName,
    pub event_type: String,
    /// Raw JSON body as received.
    pub payload: String,
}

/// One handed-out copy of a message. `attempt` starts at 1.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: String,
    pub message: BusMessage,
    pub attempt: u32,
    /// Backend-specific handle (the stream entry id for Redis).
    pub receipt: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    Backend(String),
    Codec(String),
}

impl std::fmt::Display for BusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BusError::Backend(e) => write!(f, "bus backend error: {e}"),
            BusError::Codec(e) => write!(f, "bus message codec error: {e}"),
        }
    }
}

impl std::error::Error for BusError {}

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, topic: &str, message: &BusMessage) -> Result<(), BusError>;

    /// Join consumer group `group` on `topic`. Members of one group compete
    /// for messages; every group sees every message.
    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Box<dyn Subscription>, BusError>;
}

#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next delivery.
    async fn next(&mut self) -> Result<Delivery, BusError>;

    /// The delivery is done with; it will not be handed out again.
    async fn ack(&mut self, delivery: &Delivery) -> Result<(), BusError>;

    /// Hand the delivery back for a later attempt. After the bus's delivery
    /// limit it goes to the dead-letter topic instead.
    async fn nack(&mut self, delivery: Delivery) -> Result<(), BusError>;
}

/// Exponential redelivery delay, capped at 32× the base.
pub fn redelivery_backoff(attempt: u32) -> Duration {
    REDELIVERY_BASE_DELAY * (1u32 << attempt.saturating_sub(1).min(5))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(redelivery_backoff(1), REDELIVERY_BASE_DELAY);
        assert_eq!(redelivery_backoff(2), REDELIVERY_BASE_DELAY * 2);
        assert_eq!(redelivery_backoff(6), REDELIVERY_BASE_DELAY * 32);
        assert_eq!(redelivery_backoff(40), REDELIVERY_BASE_DELAY * 32);
    }
}
