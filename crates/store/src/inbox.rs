use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Marker that a message id has been consumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxRecord {
    pub message_id: String,
    pub processed_at: DateTime<Utc>,
}
