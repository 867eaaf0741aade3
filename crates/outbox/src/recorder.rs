use serde::Serialize;
use store::{NewOutboxRecord, UnitOfWork};

use crate::Result;

/// Writes outgoing events into the outbox.
///
/// The recorder only ever writes through a caller-supplied unit of work, so
/// the event commits or rolls back together with the business change the
/// caller stages in that same unit.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutboxRecorder;

impl OutboxRecorder {
    pub fn new() -> Self {
        Self
    }

    /// Stages a `NEW` outbox row and returns its id.
    #[tracing::instrument(skip(self, uow, payload))]
    pub async fn record<U: UnitOfWork>(
        &self,
        uow: &mut U,
        aggregate_type: &str,
        aggregate_id: &str,
        event_type: &str,
        payload: impl Into<Vec<u8>> + Send,
    ) -> Result<i64> {
        let id = uow
            .insert_outbox(NewOutboxRecord::new(
                aggregate_type,
                aggregate_id,
                event_type,
                payload,
            ))
            .await?;

        metrics::counter!("outbox_recorded_total", "event_type" => event_type.to_string())
            .increment(1);
        tracing::debug!(outbox_id = id, "outbox event staged");
        Ok(id)
    }

    /// Serializes `payload` as JSON and stages it.
    pub async fn record_json<U: UnitOfWork, T: Serialize + Sync>(
        &self,
        uow: &mut U,
        aggregate_type: &str,
        aggregate_id: &str,
        event_type: &str,
        payload: &T,
    ) -> Result<i64> {
        let bytes = serde_json::to_vec(payload)?;
        self.record(uow, aggregate_type, aggregate_id, event_type, bytes)
            .await
    }
}
