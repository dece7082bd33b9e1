use std::collections::VecDeque;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use deadpool_redis::Pool;
use deadpool_redis::redis::cmd;
use deadpool_redis::redis::streams::{StreamId, StreamReadReply};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::MAX_DELIVERIES;

use super::{BusError, BusMessage, DEAD_LETTER_TOPIC, Delivery, EventBus, Subscription, redelivery_backoff};

/// Approximate stream length cap passed to XADD.
const STREAM_MAX_LEN: usize = 10_000;

/// Pending entries idle this long are claimed from their (presumed dead) consumer.
const PENDING_IDLE: Duration = Duration::from_secs(30);

const READ_BLOCK_MS: u64 = 2000;
const READ_COUNT: usize = 10;

fn backend(e: impl std::fmt::Display) -> BusError {
    BusError::Backend(e.to_string())
}

/// Redis Streams bus: XADD to publish, consumer groups with XREADGROUP,
/// XACK on completion, XAUTOCLAIM to recover entries of dead consumers.
#[derive(Clone)]
pub struct RedisStreamBus {
    pool: Pool,
    max_deliveries: u32,
}

impl RedisStreamBus {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            max_deliveries: MAX_DELIVERIES,
        }
    }

    async fn xadd(&self, topic: &str, message: &BusMessage, attempt: u32) -> Result<String, BusError> {
        let mut conn = self.pool.get().await.map_err(backend)?;
        let id: String = cmd("XADD")
            .arg(topic)
            .arg("MAXLEN")
            .arg("~")
            .arg(STREAM_MAX_LEN)
            .arg("*")
            .arg("eventId")
            .arg(message.event_id.to_string())
            .arg("channel")
            .arg(message.channel.as_str())
            .arg("eventType")
            .arg(&message.event_type)
            .arg("payload")
            .arg(&message.payload)
            .arg("attempt")
            .arg(attempt)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(id)
    }
}

fn parse_entry(topic: &str, entry: &StreamId) -> Result<Delivery, BusError> {
    let field = |key: &str| -> Result<String, BusError> {
        entry
            .get::<String>(key)
            .ok_or_else(|| BusError::Codec(format!("entry {} missing {key}", entry.id)))
    };
    let event_id = field("eventId")?
        .parse::<Ulid>()
        .map_err(|e| BusError::Codec(e.to_string()))?;
    let channel = field("channel")?.parse().map_err(BusError::Codec)?;
    let attempt = entry.get::<u32>("attempt").unwrap_or(1);
    Ok(Delivery {
        topic: topic.to_string(),
        message: BusMessage {
            event_id,
            channel,
            event_type: field("eventType")?,
            payload: field("payload")?,
        },
        attempt,
        receipt: entry.id.clone(),
    })
}

#[async_trait]
impl EventBus for RedisStreamBus {
    async fn publish(&self, topic: &str, message: &BusMessage) -> Result<(), BusError> {
        let id = self.xadd(topic, message, 1).await?;
        debug!(topic, stream_id = %id, event_id = %message.event_id, "published");
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Box<dyn Subscription>, BusError> {
        let mut conn = self.pool.get().await.map_err(backend)?;
        let created: Result<(), _> = cmd("XGROUP")
            .arg("CREATE")
            .arg(topic)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match created {
            Ok(()) => info!(topic, group, "created consumer group"),
            Err(e) if e.to_string().contains("BUSYGROUP") => {}
            Err(e) => return Err(backend(e)),
        }
        Ok(Box::new(RedisSubscription {
            bus: self.clone(),
            topic: topic.to_string(),
            group: group.to_string(),
            consumer: consumer.to_string(),
            buffer: VecDeque::new(),
            next_recovery: Instant::now(),
        }))
    }
}

struct RedisSubscription {
    bus: RedisStreamBus,
    topic: String,
    group: String,
    consumer: String,
    buffer: VecDeque<Delivery>,
    next_recovery: Instant,
}

impl RedisSubscription {
    /// Claim idle entries of other consumers, then read this consumer's own
    /// pending list (entries delivered but never acked).
    async fn recover_pending(&mut self) -> Result<(), BusError> {
        let mut conn = self.bus.pool.get().await.map_err(backend)?;
        let claimed: Result<deadpool_redis::redis::Value, _> = cmd("XAUTOCLAIM")
            .arg(&self.topic)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(PENDING_IDLE.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(READ_COUNT)
            .arg("JUSTID")
            .query_async(&mut conn)
            .await;
        if let Err(e) = claimed {
            debug!(topic = %self.topic, "XAUTOCLAIM failed, skipping recovery: {e}");
        }

        let reply: Option<StreamReadReply> = cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(READ_COUNT)
            .arg("STREAMS")
            .arg(&self.topic)
            .arg("0")
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        let recovered = self.buffer_reply(reply);
        if recovered > 0 {
            info!(topic = %self.topic, group = %self.group, recovered, "recovered pending entries");
        }
        Ok(())
    }

    async fn read_new(&mut self) -> Result<(), BusError> {
        let mut conn = self.bus.pool.get().await.map_err(backend)?;
        let reply: Option<StreamReadReply> = cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(READ_COUNT)
            .arg("BLOCK")
            .arg(READ_BLOCK_MS)
            .arg("STREAMS")
            .arg(&self.topic)
            .arg(">")
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        self.buffer_reply(reply);
        Ok(())
    }

    fn buffer_reply(&mut self, reply: Option<StreamReadReply>) -> usize {
        let mut added = 0;
        for key in reply.map(|r| r.keys).unwrap_or_default() {
            for entry in key.ids {
                match parse_entry(&self.topic, &entry) {
                    Ok(delivery) => {
                        self.buffer.push_back(delivery);
                        added += 1;
                    }
                    Err(e) => {
                        // Unparseable entries would otherwise be reclaimed forever.
                        warn!(topic = %self.topic, stream_id = %entry.id, "dropping entry: {e}");
                        let receipt = entry.id.clone();
                        let bus = self.bus.clone();
                        let (topic, group) = (self.topic.clone(), self.group.clone());
                        tokio::spawn(async move {
                            if let Ok(mut conn) = bus.pool.get().await {
                                let _: Result<i64, _> = cmd("XACK")
                                    .arg(&topic)
                                    .arg(&group)
                                    .arg(&receipt)
                                    .query_async(&mut conn)
                                    .await;
                            }
                        });
                    }
                }
            }
        }
        added
    }

    async fn xack(&self, receipt: &str) -> Result<(), BusError> {
        let mut conn = self.bus.pool.get().await.map_err(backend)?;
        let _: i64 = cmd("XACK")
            .arg(&self.topic)
            .arg(&self.group)
            .arg(receipt)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(())
    }
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn next(&mut self) -> Result<Delivery, BusError> {
        loop {
            if let Some(delivery) = self.buffer.pop_front() {
                return Ok(delivery);
            }
            if Instant::now() >= self.next_recovery {
                self.next_recovery = Instant::now() + PENDING_IDLE;
                self.recover_pending().await?;
                continue;
            }
            self.read_new().await?;
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), BusError> {
        self.xack(&delivery.receipt).await
    }

    /// Re-adds a copy with the next attempt number after the backoff, then
    /// acks the original entry.
    async fn nack(&mut self, delivery: Delivery) -> Result<(), BusError> {
        if delivery.attempt >= self.bus.max_deliveries {
            warn!(
                topic = %self.topic,
                event_id = %delivery.message.event_id,
                attempts = delivery.attempt,
                "delivery limit reached, dead-lettering"
            );
            self.bus
                .xadd(DEAD_LETTER_TOPIC, &delivery.message, delivery.attempt)
                .await?;
        } else {
            tokio::time::sleep(redelivery_backoff(delivery.attempt)).await;
            self.bus
                .xadd(&self.topic, &delivery.message, delivery.attempt + 1)
                .await?;
        }
        self.xack(&delivery.receipt).await
    }
}
