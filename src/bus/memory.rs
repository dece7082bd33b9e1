use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::limits::MAX_DELIVERIES;

use super::{BusError, BusMessage, DEAD_LETTER_TOPIC, Delivery, EventBus, Subscription, redelivery_backoff};

/// Messages kept per topic for groups that join later.
const TOPIC_MAX_LEN: usize = 10_000;

struct Envelope {
    message: BusMessage,
    attempt: u32,
}

struct Group {
    tx: mpsc::UnboundedSender<Envelope>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Envelope>>>,
}

#[derive(Default)]
struct Topic {
    log: VecDeque<BusMessage>,
    groups: HashMap<String, Group>,
}

#[derive(Default)]
struct Inner {
    topics: Mutex<HashMap<String, Topic>>,
    max_deliveries: u32,
}

/// In-process bus with the same group semantics as a Redis stream.
///
/// A group joining a topic first receives the topic's retained messages.
/// Deliveries lost to a crash are not recovered.
#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<Inner>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::with_max_deliveries(MAX_DELIVERIES)
    }

    pub fn with_max_deliveries(max_deliveries: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                topics: Mutex::new(HashMap::new()),
                max_deliveries: max_deliveries.max(1),
            }),
        }
    }

    /// Every message published to `topic` so far (up to the retention cap).
    pub fn published(&self, topic: &str) -> Vec<BusMessage> {
        let topics = self.inner.lock_topics();
        topics
            .get(topic)
            .map(|t| t.log.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn send(&self, topic: &str, message: &BusMessage) {
        let mut topics = self.inner.lock_topics();
        let t = topics.entry(topic.to_string()).or_default();
        if t.log.len() == TOPIC_MAX_LEN {
            t.log.pop_front();
        }
        t.log.push_back(message.clone());
        for group in t.groups.values() {
            let _ = group.tx.send(Envelope {
                message: message.clone(),
                attempt: 1,
            });
        }
    }
}

impl Inner {
    fn lock_topics(&self) -> std::sync::MutexGuard<'_, HashMap<String, Topic>> {
        self.topics.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn publish(&self, topic: &str, message: &BusMessage) -> Result<(), BusError> {
        self.send(topic, message);
        debug!(topic, event_id = %message.event_id, "published");
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        _consumer: &str,
    ) -> Result<Box<dyn Subscription>, BusError> {
        let mut topics = self.inner.lock_topics();
        let t = topics.entry(topic.to_string()).or_default();
        let g = t.groups.entry(group.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            for message in &t.log {
                let _ = tx.send(Envelope {
                    message: message.clone(),
                    attempt: 1,
                });
            }
            Group {
                tx,
                rx: Arc::new(tokio::sync::Mutex::new(rx)),
            }
        });
        Ok(Box::new(MemorySubscription {
            bus: self.clone(),
            topic: topic.to_string(),
            tx: g.tx.clone(),
            rx: g.rx.clone(),
        }))
    }
}

struct MemorySubscription {
    bus: MemoryBus,
    topic: String,
    tx: mpsc::UnboundedSender<Envelope>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Envelope>>>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Result<Delivery, BusError> {
        let envelope = self
            .rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| BusError::Backend(format!("topic {} closed", self.topic)))?;
        Ok(Delivery {
            topic: self.topic.clone(),
            message: envelope.message,
            attempt: envelope.attempt,
            receipt: String::new(),
        })
    }

    async fn ack(&mut self, _delivery: &Delivery) -> Result<(), BusError> {
        Ok(())
    }

    async fn nack(&mut self, delivery: Delivery) -> Result<(), BusError> {
        if delivery.attempt >= self.bus.inner.max_deliveries {
            warn!(
                topic = %self.topic,
                event_id = %delivery.message.event_id,
                attempts = delivery.attempt,
                "delivery limit reached, dead-lettering"
            );
            self.bus.send(DEAD_LETTER_TOPIC, &delivery.message);
            return Ok(());
        }
        let tx = self.tx.clone();
        let delay = redelivery_backoff(delivery.attempt);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Envelope {
                message: delivery.message,
                attempt: delivery.attempt + 1,
            });
        });
        Ok(())
    }
}
