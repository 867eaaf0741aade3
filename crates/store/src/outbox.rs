use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::OutboxStatus;

/// An outgoing event to be written in the same unit of work as the
/// business change it announces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOutboxRecord {
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    /// Opaque payload bytes; the store never looks inside.
    pub payload: Vec<u8>,
}

impl NewOutboxRecord {
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            event_type: event_type.into(),
            payload: payload.into(),
        }
    }
}

/// A persisted outbox row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxRecord {
    /// Monotonic id; dispatch order is ascending id.
    pub id: i64,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub status: OutboxStatus,
    /// Failed publish attempts so far.
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    /// Transport routing key: `aggregateType.aggregateId`.
    pub fn routing_key(&self) -> String {
        format!("{}.{}", self.aggregate_type, self.aggregate_id)
    }

    /// Stable message identifier carried as a transport header.
    pub fn message_id(&self) -> String {
        self.id.to_string()
    }
}
