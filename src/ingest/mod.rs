//! Inbound webhook pipeline: verify, dedup, persist, publish.
//!
//! A rejected event leaves no trace. An accepted event is stored as PENDING
//! before it is published; the sender gets a success only once both have
//! happened. Processing is asynchronous from there.

pub mod http;
pub mod signature;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::bus::{BusError, BusMessage, EventBus, topics::topic_for};
use crate::limits::{DEFAULT_MAX_PAYLOAD_BYTES, MAX_EXTERNAL_ID_LEN};
use crate::model::*;
use crate::payload::EventBody;
use crate::store::{InsertOutcome, PublishClaim, StoreError, WebhookLog};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestError {
    /// Signature absent or wrong.
    Signature,
    /// No shared secret configured for the channel; every event is refused.
    MissingSecret(ChannelName),
    PayloadTooLarge { size: usize, limit: usize },
    Malformed(String),
    Store(StoreError),
    Bus(BusError),
}

impl IngestError {
    fn outcome_label(&self) -> &'static str {
        match self {
            IngestError::Signature | IngestError::MissingSecret(_) => "rejected_signature",
            IngestError::PayloadTooLarge { .. } => "rejected_size",
            IngestError::Malformed(_) => "rejected_malformed",
            IngestError::Store(_) | IngestError::Bus(_) => "error",
        }
    }
}

impl std::fmt::Display for IngestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IngestError::Signature => write!(f, "signature verification failed"),
            IngestError::MissingSecret(channel) => {
                write!(f, "no webhook secret configured for {channel}")
            }
            IngestError::PayloadTooLarge { size, limit } => {
                write!(f, "payload of {size} bytes exceeds limit of {limit}")
            }
            IngestError::Malformed(msg) => write!(f, "malformed event: {msg}"),
            IngestError::Store(e) => write!(f, "{e}"),
            IngestError::Bus(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for IngestError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// New event stored and published.
    Accepted(Ulid),
    /// Already seen; the stored event's id.
    Duplicate(Ulid),
}

impl IngestOutcome {
    pub fn event_id(&self) -> Ulid {
        match self {
            IngestOutcome::Accepted(id) | IngestOutcome::Duplicate(id) => *id,
        }
    }
}

pub struct IngestPipeline {
    log: Arc<WebhookLog>,
    bus: Arc<dyn EventBus>,
    secrets: HashMap<ChannelName, String>,
    max_payload_bytes: usize,
}

impl IngestPipeline {
    pub fn new(log: Arc<WebhookLog>, bus: Arc<dyn EventBus>) -> Self {
        Self {
            log,
            bus,
            secrets: HashMap::new(),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }

    pub fn with_secret(mut self, channel: ChannelName, secret: impl Into<String>) -> Self {
        self.secrets.insert(channel, secret.into());
        self
    }

    pub fn with_secrets(mut self, secrets: HashMap<ChannelName, String>) -> Self {
        self.secrets.extend(secrets);
        self
    }

    pub fn with_max_payload_bytes(mut self, limit: usize) -> Self {
        self.max_payload_bytes = limit;
        self
    }

    pub fn max_payload_bytes(&self) -> usize {
        self.max_payload_bytes
    }

    pub fn log(&self) -> &Arc<WebhookLog> {
        &self.log
    }

    /// Entry point for signed webhook deliveries.
    pub async fn ingest(
        &self,
        channel: ChannelName,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<IngestOutcome, IngestError> {
        let result = self.ingest_signed(channel, body, signature).await;
        record(channel, &result);
        match &result {
            Ok(IngestOutcome::Accepted(id)) => info!(channel = %channel, event_id = %id, "webhook accepted"),
            Ok(IngestOutcome::Duplicate(id)) => debug!(channel = %channel, event_id = %id, "duplicate webhook"),
            Err(e) => warn!(channel = %channel, "webhook rejected: {e}"),
        }
        result
    }

    async fn ingest_signed(
        &self,
        channel: ChannelName,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<IngestOutcome, IngestError> {
        if body.len() > self.max_payload_bytes {
            return Err(IngestError::PayloadTooLarge {
                size: body.len(),
                limit: self.max_payload_bytes,
            });
        }
        let secret = self
            .secrets
            .get(&channel)
            .filter(|s| !s.is_empty())
            .ok_or(IngestError::MissingSecret(channel))?;
        let signature = signature.ok_or(IngestError::Signature)?;
        signature::verify(secret, signature, body)?;

        let raw = std::str::from_utf8(body)
            .map_err(|_| IngestError::Malformed("body is not UTF-8".into()))?;
        let parsed: EventBody =
            serde_json::from_str(raw).map_err(|e| IngestError::Malformed(e.to_string()))?;
        self.store_and_publish(channel, raw.to_string(), parsed, Some(signature.to_string()))
            .await
    }

    /// Entry point for events the process fetched itself (polling). No
    /// signature; same dedup, persistence and publish.
    pub async fn ingest_trusted(&self, channel: ChannelName, body: &Value) -> Result<IngestOutcome, IngestError> {
        let result = async {
            let parsed: EventBody = serde_json::from_value(body.clone())
                .map_err(|e| IngestError::Malformed(e.to_string()))?;
            let raw = body.to_string();
            self.store_and_publish(channel, raw, parsed, None).await
        }
        .await;
        record(channel, &result);
        result
    }

    async fn store_and_publish(
        &self,
        channel: ChannelName,
        raw: String,
        parsed: EventBody,
        signature: Option<String>,
    ) -> Result<IngestOutcome, IngestError> {
        let external_event_id = parsed.event_id.trim();
        if external_event_id.is_empty() || external_event_id.len() > MAX_EXTERNAL_ID_LEN {
            return Err(IngestError::Malformed("eventId missing or too long".into()));
        }
        if parsed.event_type.trim().is_empty() {
            return Err(IngestError::Malformed("eventType missing".into()));
        }

        let event = WebhookEvent {
            id: Ulid::new(),
            external_event_id: external_event_id.to_string(),
            channel,
            event_type: parsed.event_type.clone(),
            payload: raw,
            signature,
            status: EventStatus::Pending,
            retry_count: 0,
            error_message: None,
            received_at: now_ms(),
            processed_at: None,
            published_at: None,
        };

        match self
            .log
            .insert_if_absent(event)
            .await
            .map_err(IngestError::Store)?
        {
            InsertOutcome::Inserted(event, claim) => {
                self.publish(&event, claim).await?;
                Ok(IngestOutcome::Accepted(event.id))
            }
            InsertOutcome::Duplicate(existing, claim) => {
                // A previous attempt stored the event but never got it onto the bus.
                // Without a claim it is either published or being published right now.
                if let Some(claim) = claim {
                    info!(channel = %channel, event_id = %existing.id, "republishing stored event");
                    self.publish(&existing, claim).await?;
                }
                Ok(IngestOutcome::Duplicate(existing.id))
            }
        }
    }

    async fn publish(&self, event: &WebhookEvent, claim: PublishClaim<'_>) -> Result<(), IngestError> {
        let topic = topic_for(event.channel, &event.event_type);
        let message = BusMessage {
            event_id: event.id,
            channel: event.channel,
            event_type: event.event_type.clone(),
            payload: event.payload.clone(),
        };
        self.bus
            .publish(&topic, &message)
            .await
            .map_err(IngestError::Bus)?;
        self.log
            .mark_published(claim)
            .await
            .map_err(IngestError::Store)
    }
}

fn record(channel: ChannelName, result: &Result<IngestOutcome, IngestError>) {
    let outcome = match result {
        Ok(IngestOutcome::Accepted(_)) => "accepted",
        Ok(IngestOutcome::Duplicate(_)) => "duplicate",
        Err(e) => e.outcome_label(),
    };
    metrics::counter!(crate::observability::WEBHOOKS_TOTAL, "channel" => channel.as_str(), "outcome" => outcome)
        .increment(1);
}
