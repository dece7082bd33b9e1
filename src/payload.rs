//! JSON body shared by webhooks, polled events and bus messages.
//!
//! ```json
//! {"eventId": "evt-1", "eventType": "calendar.blocked", "listingId": "AIRBNB-123",
//!  "from": "2025-07-01", "to": "2025-07-10"}
//! ```
//!
//! Only `eventId` and `eventType` are required at ingestion; the category
//! consumers check the rest.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::model::{DateRange, Price};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventBody {
    pub event_id: String,
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listing_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<NaiveDate>,
    /// Nightly price in minor units.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl EventBody {
    pub fn new(event_id: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            event_type: event_type.into(),
            ..Default::default()
        }
    }

    pub fn range(&self) -> Option<DateRange> {
        Some(DateRange::new(self.from?, self.to?))
    }

    pub fn price(&self) -> Option<Price> {
        Some(Price::new(self.amount?, self.currency.clone()?))
    }
}
