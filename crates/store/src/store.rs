use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    InboxRecord, NewOutboxRecord, OutboxRecord, OutboxStatus, Result, SagaId, SagaStatus,
    SagaTransaction, Version,
};

/// Persistence for saga transactions.
///
/// All mutations after insert are conditional on the row version the caller
/// last observed, so two writers can never both apply a transition.
#[async_trait]
pub trait SagaRepository: Send + Sync {
    /// Inserts a new saga row.
    ///
    /// Fails with `DuplicateKey` if a row with the same id exists.
    async fn insert_saga(&self, saga: &SagaTransaction) -> Result<()>;

    /// Loads a saga by id.
    async fn load_saga(&self, id: SagaId) -> Result<Option<SagaTransaction>>;

    /// Loads the most recent saga for a business correlation key.
    async fn find_by_business_id(&self, business_id: &str) -> Result<Option<SagaTransaction>>;

    /// Writes `saga` if the stored row is still at `saga.version`.
    ///
    /// Returns the new version. Fails with `ConcurrencyConflict` if another
    /// writer advanced the row first, or `SagaNotFound` if it was deleted.
    async fn update_saga(&self, saga: &SagaTransaction) -> Result<Version>;

    /// Takes ownership of a stale row for recovery.
    ///
    /// Bumps the version and touches `updated_at` only if the row is still at
    /// `expected_version` and `expected_status`. Returns `None` when another
    /// sweep claimed or advanced it first.
    async fn claim_saga(
        &self,
        id: SagaId,
        expected_version: Version,
        expected_status: SagaStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<Version>>;

    /// Returns rows in `statuses` not updated since `updated_before`, oldest first.
    async fn find_stale(
        &self,
        statuses: &[SagaStatus],
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SagaTransaction>>;

    /// Deletes up to `limit` rows in `statuses` last updated before `before`.
    async fn delete_sagas_before(
        &self,
        statuses: &[SagaStatus],
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<u64>;

    /// Counts rows per status.
    async fn count_sagas_by_status(&self) -> Result<HashMap<SagaStatus, u64>>;
}

/// Dispatcher-side access to the outbox table.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Returns up to `limit` unsent rows ordered by ascending id.
    async fn fetch_unsent(&self, limit: usize) -> Result<Vec<OutboxRecord>>;

    /// Marks a row sent. Returns false if it was not `New` anymore.
    async fn mark_sent(&self, id: i64, sent_at: DateTime<Utc>) -> Result<bool>;

    /// Records a failed publish attempt; the row stays `New`.
    async fn record_failure(&self, id: i64, error: &str) -> Result<()>;

    async fn load_outbox(&self, id: i64) -> Result<Option<OutboxRecord>>;

    /// Deletes sent rows created before `before`.
    async fn delete_sent_before(&self, before: DateTime<Utc>) -> Result<u64>;

    async fn count_outbox_by_status(&self) -> Result<HashMap<OutboxStatus, u64>>;
}

/// Maintenance access to the inbox table.
#[async_trait]
pub trait InboxStore: Send + Sync {
    async fn load_inbox(&self, message_id: &str) -> Result<Option<InboxRecord>>;

    /// Deletes dedup keys processed before `before`.
    async fn delete_processed_before(&self, before: DateTime<Utc>) -> Result<u64>;
}

/// An explicit atomic unit of work.
///
/// Nothing written through a unit is visible until [`UnitOfWork::commit`]
/// succeeds; dropping a unit without committing discards every write.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Stages an outbox row and returns its id.
    async fn insert_outbox(&mut self, record: NewOutboxRecord) -> Result<i64>;

    /// Stages an inbox dedup key.
    ///
    /// Returns false if the key is already present (a duplicate delivery).
    async fn insert_inbox(&mut self, message_id: &str, processed_at: DateTime<Utc>)
    -> Result<bool>;

    /// Makes every staged write durable at once.
    async fn commit(self) -> Result<()>;

    /// Discards every staged write.
    async fn rollback(self) -> Result<()>;
}

/// A store that can open units of work.
#[async_trait]
pub trait TransactionalStore: Send + Sync {
    type Unit: UnitOfWork;

    async fn begin(&self) -> Result<Self::Unit>;
}
