//! Outbox error types.

use store::StoreError;
use thiserror::Error;

use crate::transport::TransportError;

/// Errors that can occur while recording or dispatching outbox events.
#[derive(Debug, Error)]
pub enum OutboxError {
    /// Store error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The event payload could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The transport rejected a message.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Convenience type alias for outbox results.
pub type Result<T> = std::result::Result<T, OutboxError>;
