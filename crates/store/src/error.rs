use thiserror::Error;

use crate::{SagaId, Version};

/// Errors that can occur when interacting with the store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A conditional saga write found a different version than expected.
    #[error(
        "Concurrency conflict for saga {saga_id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        saga_id: SagaId,
        expected: Version,
        actual: Version,
    },

    /// The saga was not found in the store.
    #[error("Saga not found: {0}")]
    SagaNotFound(SagaId),

    /// A uniqueness constraint was violated.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// A business row read in a unit of work changed before the unit committed.
    #[error("Row {table}/{key} changed since it was read")]
    RowConflict { table: String, key: String },

    /// A stored row could not be mapped back into a record.
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// The store refused the operation (used by the in-memory store to simulate outages).
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Returns true if the error means another writer got there first.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::ConcurrencyConflict { .. })
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
