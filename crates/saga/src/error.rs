//! Saga error types.

use common::{SagaId, SagaStatus};
use outbox::OutboxError;
use store::StoreError;
use thiserror::Error;

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// A saga step failed.
    #[error("Saga step '{step}' failed: {reason}")]
    StepFailed { step: String, reason: String },

    /// A compensation step failed.
    #[error("Compensation step '{step}' failed: {reason}")]
    CompensationFailed { step: String, reason: String },

    /// A step did not finish within the configured timeout.
    #[error("Saga step '{step}' timed out after {after_ms}ms")]
    Timeout { step: String, after_ms: u128 },

    /// The requested status change is not on the saga state machine.
    #[error("Invalid saga transition from {from} to {to}")]
    InvalidTransition { from: SagaStatus, to: SagaStatus },

    /// The supplied steps do not match the persisted step names.
    #[error("Step list mismatch: persisted {persisted:?}, supplied {supplied:?}")]
    StepMismatch {
        persisted: Vec<String>,
        supplied: Vec<String>,
    },

    /// No live implementation is registered under a step name.
    #[error("Unknown saga step: {0}")]
    UnknownStep(String),

    /// A step with the same name is already registered.
    #[error("Duplicate saga step: {0}")]
    DuplicateStep(String),

    /// No saga definition exists for a saga type.
    #[error("Unknown saga type: {0}")]
    UnknownSagaType(String),

    /// The persisted context was written by a newer schema.
    #[error("Unsupported context schema version {found} (supported up to {supported})")]
    UnsupportedContextVersion { found: u64, supported: u64 },

    /// The persisted context is not a valid snapshot.
    #[error("Invalid saga context: {0}")]
    InvalidContext(String),

    /// The saga is already being driven by this orchestrator.
    #[error("Saga {0} is already running")]
    InProgress(SagaId),

    /// Saga not found.
    #[error("Saga not found: {0}")]
    NotFound(SagaId),

    /// Store error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Outbox error.
    #[error("Outbox error: {0}")]
    Outbox(#[from] OutboxError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SagaError {
    /// Returns true if the error means another writer owns or advanced the
    /// saga first.
    pub fn is_conflict(&self) -> bool {
        match self {
            SagaError::InProgress(_) => true,
            SagaError::Store(e) => e.is_conflict(),
            _ => false,
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
