use std::time::Duration;

use chrono::NaiveDate;

use crate::model::PropertyId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Malformed input. Raised before any lock is taken.
    Validation(String),
    /// Another source already holds at least one night of the range.
    Conflict {
        property_id: PropertyId,
        holder: String,
        dates: Vec<NaiveDate>,
    },
    /// The property lock was not acquired within the bounded wait.
    LockTimeout {
        property_id: PropertyId,
        waited: Duration,
    },
    Lock(String),
    WalError(String),
}

impl EngineError {
    /// Transient errors worth redelivering.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::LockTimeout { .. })
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid request: {msg}"),
            EngineError::Conflict {
                property_id,
                holder,
                dates,
            } => {
                let first = dates.first().map(|d| d.to_string()).unwrap_or_default();
                write!(
                    f,
                    "property {property_id}: {} night(s) from {first} already blocked by {holder}",
                    dates.len()
                )
            }
            EngineError::LockTimeout {
                property_id,
                waited,
            } => write!(
                f,
                "property {property_id}: lock not acquired within {}ms",
                waited.as_millis()
            ),
            EngineError::Lock(e) => write!(f, "lock error: {e}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
