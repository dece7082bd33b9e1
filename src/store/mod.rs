//! State the sync core reads and writes besides the calendar ledger.

mod mapping;
mod sync_log;
mod webhook;

pub use mapping::{MappingStore, MemoryMappingStore};
pub use sync_log::{MemorySyncLogStore, SyncLogStore};
pub use webhook::{InsertOutcome, PublishClaim, WebhookLog};

use ulid::Ulid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A uniqueness rule would be broken.
    Duplicate(String),
    NotFound(Ulid),
    Invalid(String),
    WalError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Duplicate(msg) => write!(f, "duplicate: {msg}"),
            StoreError::NotFound(id) => write!(f, "not found: {id}"),
            StoreError::Invalid(msg) => write!(f, "invalid: {msg}"),
            StoreError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}
