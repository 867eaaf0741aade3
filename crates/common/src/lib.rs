//! Shared identifiers and persisted status types.

pub mod status;
pub mod types;

pub use status::{OutboxStatus, ParseStatusError, SagaStatus};
pub use types::SagaId;
