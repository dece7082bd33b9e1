use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, used for every audit timestamp.
pub type Ms = i64;

pub type PropertyId = i64;
pub type OrgId = i64;

pub fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

// ── Channels ─────────────────────────────────────────────────────

/// Identity of an external distribution channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelName {
    Airbnb,
    Booking,
    Vrbo,
    Expedia,
    /// Pseudo-channel for the property's own direct-booking calendar.
    Direct,
}

impl ChannelName {
    pub const ALL: [ChannelName; 5] = [
        ChannelName::Airbnb,
        ChannelName::Booking,
        ChannelName::Vrbo,
        ChannelName::Expedia,
        ChannelName::Direct,
    ];

    /// Upper-case label used as the calendar block source.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelName::Airbnb => "AIRBNB",
            ChannelName::Booking => "BOOKING",
            ChannelName::Vrbo => "VRBO",
            ChannelName::Expedia => "EXPEDIA",
            ChannelName::Direct => "DIRECT",
        }
    }

    /// Lower-case form used in URLs and bus topic names.
    pub fn slug(&self) -> &'static str {
        match self {
            ChannelName::Airbnb => "airbnb",
            ChannelName::Booking => "booking",
            ChannelName::Vrbo => "vrbo",
            ChannelName::Expedia => "expedia",
            ChannelName::Direct => "direct",
        }
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "airbnb" => Ok(ChannelName::Airbnb),
            "booking" | "booking.com" | "booking_com" => Ok(ChannelName::Booking),
            "vrbo" => Ok(ChannelName::Vrbo),
            "expedia" => Ok(ChannelName::Expedia),
            "direct" => Ok(ChannelName::Direct),
            other => Err(format!("unknown channel: {other}")),
        }
    }
}

/// What a connector declares it can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Capability {
    InboundCalendar,
    OutboundCalendar,
    InboundReservations,
    OutboundReservations,
    Webhooks,
    Polling,
    Oauth,
    Messaging,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

/// Outcome of one outbound push. Failures are values, not errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncResult {
    Success { items_processed: u32, duration_ms: u64 },
    Failed { message: String },
    Skipped { reason: String },
}

impl SyncResult {
    pub fn failed(message: impl Into<String>) -> Self {
        SyncResult::Failed { message: message.into() }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        SyncResult::Skipped { reason: reason.into() }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SyncResult::Success { .. })
    }

    pub fn status(&self) -> SyncStatus {
        match self {
            SyncResult::Success { .. } => SyncStatus::Success,
            SyncResult::Failed { .. } => SyncStatus::Failed,
            SyncResult::Skipped { .. } => SyncStatus::Skipped,
        }
    }
}

// ── Mappings ─────────────────────────────────────────────────────

/// Links an internal property to one channel listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMapping {
    pub id: Ulid,
    pub property_id: PropertyId,
    pub org_id: OrgId,
    pub channel: ChannelName,
    pub external_listing_id: String,
    pub sync_enabled: bool,
    pub auto_push_pricing: bool,
    /// Read by the intervention collaborator; not interpreted here.
    pub auto_create_intervention: bool,
    pub last_sync_at: Option<Ms>,
    pub created_at: Ms,
}

impl ChannelMapping {
    pub fn new(
        property_id: PropertyId,
        org_id: OrgId,
        channel: ChannelName,
        external_listing_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Ulid::new(),
            property_id,
            org_id,
            channel,
            external_listing_id: external_listing_id.into(),
            sync_enabled: true,
            auto_push_pricing: false,
            auto_create_intervention: false,
            last_sync_at: None,
            created_at: now_ms(),
        }
    }

    pub fn with_auto_push_pricing(mut self, enabled: bool) -> Self {
        self.auto_push_pricing = enabled;
        self
    }

    pub fn with_sync_enabled(mut self, enabled: bool) -> Self {
        self.sync_enabled = enabled;
        self
    }
}

// ── Calendar ledger ──────────────────────────────────────────────

/// Half-open night range `[from, to)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateRange {
    pub fn new(from: NaiveDate, to: NaiveDate) -> Self {
        Self { from, to }
    }

    pub fn is_empty(&self) -> bool {
        self.from >= self.to
    }

    pub fn nights(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            (self.to - self.from).num_days() as u64
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.from <= date && date < self.to
    }

    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.from < other.to && other.from < self.to
    }

    /// Every night in the range, in order.
    pub fn iter(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        let to = self.to;
        std::iter::successors(Some(self.from), |d| d.checked_add_days(Days::new(1)))
            .take_while(move |d| *d < to)
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.from, self.to)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Availability {
    Open,
    Blocked,
}

/// Nightly price in minor units (cents) with an ISO currency code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Price {
    pub amount_minor: i64,
    pub currency: String,
}

impl Price {
    pub fn new(amount_minor: i64, currency: impl Into<String>) -> Self {
        Self {
            amount_minor,
            currency: currency.into(),
        }
    }
}

/// One night of one property. Written only by the calendar engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarDay {
    pub property_id: PropertyId,
    pub date: NaiveDate,
    pub availability: Availability,
    pub price: Option<Price>,
    pub min_stay: Option<u32>,
    pub max_stay: Option<u32>,
    /// Source holding the block (channel label or "MANUAL"). `None` while open.
    pub block_source: Option<String>,
    pub reason_code: Option<String>,
    pub reason_text: Option<String>,
    pub updated_by: String,
    pub updated_at: Ms,
}

impl CalendarDay {
    pub fn open(property_id: PropertyId, date: NaiveDate) -> Self {
        Self {
            property_id,
            date,
            availability: Availability::Open,
            price: None,
            min_stay: None,
            max_stay: None,
            block_source: None,
            reason_code: None,
            reason_text: None,
            updated_by: String::new(),
            updated_at: 0,
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.availability == Availability::Blocked
    }
}

/// In-memory ledger for one property, keyed by night.
#[derive(Debug, Clone)]
pub struct PropertyCalendar {
    pub property_id: PropertyId,
    /// Recorded on the first write; later writes must name the same org.
    pub org_id: Option<OrgId>,
    pub days: BTreeMap<NaiveDate, CalendarDay>,
}

impl PropertyCalendar {
    pub fn new(property_id: PropertyId) -> Self {
        Self {
            property_id,
            org_id: None,
            days: BTreeMap::new(),
        }
    }

    pub fn get(&self, date: &NaiveDate) -> Option<&CalendarDay> {
        self.days.get(date)
    }

    /// Stored rows inside the range. Nights never written are absent.
    pub fn in_range(&self, range: &DateRange) -> impl Iterator<Item = &CalendarDay> {
        self.days.range(range.from..range.to).map(|(_, d)| d)
    }

    pub fn upsert(&mut self, day: CalendarDay) {
        self.days.insert(day.date, day);
    }
}

/// The ledger WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEvent {
    DaysWritten {
        property_id: PropertyId,
        org_id: OrgId,
        days: Vec<CalendarDay>,
    },
}

/// Broadcast after every ledger write that changed something.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarChanged {
    pub property_id: PropertyId,
    pub org_id: OrgId,
    pub range: DateRange,
    pub source: String,
}

// ── Webhook event log ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Pending,
    Processed,
    Failed,
}

/// Durable record of one inbound notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: Ulid,
    pub external_event_id: String,
    pub channel: ChannelName,
    pub event_type: String,
    /// Raw body exactly as received.
    pub payload: String,
    pub signature: Option<String>,
    pub status: EventStatus,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub received_at: Ms,
    pub processed_at: Option<Ms>,
    pub published_at: Option<Ms>,
}

/// The webhook log WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WebhookRecord {
    Received(WebhookEvent),
    Published {
        id: Ulid,
        at: Ms,
    },
    StatusChanged {
        id: Ulid,
        status: EventStatus,
        retry_count: u32,
        error_message: Option<String>,
        processed_at: Option<Ms>,
    },
}

// ── Sync log ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Success,
    Failed,
    Skipped,
}

/// One row per attempted outbound push. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncLog {
    pub id: Ulid,
    pub channel: ChannelName,
    pub property_id: PropertyId,
    pub org_id: OrgId,
    pub status: SyncStatus,
    pub items_processed: u32,
    pub duration_ms: u64,
    pub message: Option<String>,
    pub created_at: Ms,
}

impl SyncLog {
    pub fn from_result(
        channel: ChannelName,
        property_id: PropertyId,
        org_id: OrgId,
        result: &SyncResult,
        elapsed_ms: u64,
    ) -> Self {
        let (items_processed, duration_ms, message) = match result {
            SyncResult::Success {
                items_processed,
                duration_ms,
            } => (*items_processed, *duration_ms, None),
            SyncResult::Failed { message } => (0, elapsed_ms, Some(message.clone())),
            SyncResult::Skipped { reason } => (0, elapsed_ms, Some(reason.clone())),
        };
        Self {
            id: Ulid::new(),
            channel,
            property_id,
            org_id,
            status: result.status(),
            items_processed,
            duration_ms,
            message,
            created_at: now_ms(),
        }
    }
}
