use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use crate::{
    InboxRecord, NewOutboxRecord, OutboxRecord, OutboxStatus, Result, SagaId, SagaStatus,
    SagaTransaction, StoreError, Version,
    store::{InboxStore, OutboxStore, SagaRepository, TransactionalStore, UnitOfWork},
};

const SAGA_COLUMNS: &str = "id, saga_type, business_id, status, steps, current_step, context, \
     error_message, failed_compensations, version, created_at, updated_at, completed_at";

const OUTBOX_COLUMNS: &str = "id, aggregate_type, aggregate_id, event_type, payload, status, \
     attempts, last_error, created_at, sent_at";

/// PostgreSQL-backed store implementation.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Creates a new PostgreSQL store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_saga(row: PgRow) -> Result<SagaTransaction> {
        let status: String = row.try_get("status")?;
        let current_step: i32 = row.try_get("current_step")?;

        Ok(SagaTransaction {
            id: SagaId::from_uuid(row.try_get::<Uuid, _>("id")?),
            saga_type: row.try_get("saga_type")?,
            business_id: row.try_get("business_id")?,
            status: status
                .parse()
                .map_err(|e| StoreError::InvalidRecord(format!("{e}")))?,
            steps: row.try_get("steps")?,
            current_step: usize::try_from(current_step).map_err(|_| {
                StoreError::InvalidRecord(format!("negative current_step {current_step}"))
            })?,
            context: row.try_get("context")?,
            error_message: row.try_get("error_message")?,
            failed_compensations: row.try_get("failed_compensations")?,
            version: Version::new(row.try_get("version")?),
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn row_to_outbox(row: PgRow) -> Result<OutboxRecord> {
        let status: String = row.try_get("status")?;

        Ok(OutboxRecord {
            id: row.try_get("id")?,
            aggregate_type: row.try_get("aggregate_type")?,
            aggregate_id: row.try_get("aggregate_id")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            status: status
                .parse()
                .map_err(|e| StoreError::InvalidRecord(format!("{e}")))?,
            attempts: row.try_get("attempts")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            sent_at: row.try_get("sent_at")?,
        })
    }
}

fn status_names(statuses: &[SagaStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

fn step_to_i32(step: usize) -> Result<i32> {
    i32::try_from(step).map_err(|_| StoreError::InvalidRecord(format!("step {step} out of range")))
}

/// A database transaction used as a unit of work.
///
/// Business writes go through [`PgUnitOfWork::connection`] so they share the
/// transaction with the outbox and inbox rows.
pub struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

impl PgUnitOfWork {
    /// Borrows the transaction's connection for business statements.
    pub fn connection(&mut self) -> &mut PgConnection {
        &mut *self.tx
    }
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn insert_outbox(&mut self, record: NewOutboxRecord) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO outbox (aggregate_type, aggregate_id, event_type, payload, status)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(&record.aggregate_type)
        .bind(&record.aggregate_id)
        .bind(&record.event_type)
        .bind(&record.payload)
        .bind(OutboxStatus::New.as_str())
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(id)
    }

    async fn insert_inbox(
        &mut self,
        message_id: &str,
        processed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO inbox (message_id, processed_at)
            VALUES ($1, $2)
            ON CONFLICT (message_id) DO NOTHING
            "#,
        )
        .bind(message_id)
        .bind(processed_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl TransactionalStore for PostgresStore {
    type Unit = PgUnitOfWork;

    async fn begin(&self) -> Result<PgUnitOfWork> {
        Ok(PgUnitOfWork {
            tx: self.pool.begin().await?,
        })
    }
}

#[async_trait]
impl SagaRepository for PostgresStore {
    #[tracing::instrument(skip(self, saga), fields(saga_id = %saga.id))]
    async fn insert_saga(&self, saga: &SagaTransaction) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO saga_transactions (id, saga_type, business_id, status, steps, current_step,
                context, error_message, failed_compensations, version, created_at, updated_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(saga.id.as_uuid())
        .bind(&saga.saga_type)
        .bind(&saga.business_id)
        .bind(saga.status.as_str())
        .bind(&saga.steps)
        .bind(step_to_i32(saga.current_step)?)
        .bind(&saga.context)
        .bind(&saga.error_message)
        .bind(&saga.failed_compensations)
        .bind(saga.version.as_i64())
        .bind(saga.created_at)
        .bind(saga.updated_at)
        .bind(saga.completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.is_unique_violation()
            {
                return StoreError::DuplicateKey(format!("saga id {}", saga.id));
            }
            StoreError::Database(e)
        })?;

        Ok(())
    }

    async fn load_saga(&self, id: SagaId) -> Result<Option<SagaTransaction>> {
        let row = sqlx::query(&format!(
            "SELECT {SAGA_COLUMNS} FROM saga_transactions WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_saga).transpose()
    }

    async fn find_by_business_id(&self, business_id: &str) -> Result<Option<SagaTransaction>> {
        let row = sqlx::query(&format!(
            "SELECT {SAGA_COLUMNS} FROM saga_transactions WHERE business_id = $1 \
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(business_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_saga).transpose()
    }

    #[tracing::instrument(skip(self, saga), fields(saga_id = %saga.id, version = %saga.version))]
    async fn update_saga(&self, saga: &SagaTransaction) -> Result<Version> {
        let new_version: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE saga_transactions
            SET status = $3, current_step = $4, context = $5, error_message = $6,
                failed_compensations = $7, updated_at = $8, completed_at = $9,
                version = version + 1
            WHERE id = $1 AND version = $2
            RETURNING version
            "#,
        )
        .bind(saga.id.as_uuid())
        .bind(saga.version.as_i64())
        .bind(saga.status.as_str())
        .bind(step_to_i32(saga.current_step)?)
        .bind(&saga.context)
        .bind(&saga.error_message)
        .bind(&saga.failed_compensations)
        .bind(saga.updated_at)
        .bind(saga.completed_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(version) = new_version {
            return Ok(Version::new(version));
        }

        // Nothing matched: either the row moved on or it is gone
        let actual: Option<i64> =
            sqlx::query_scalar("SELECT version FROM saga_transactions WHERE id = $1")
                .bind(saga.id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;

        match actual {
            Some(actual) => Err(StoreError::ConcurrencyConflict {
                saga_id: saga.id,
                expected: saga.version,
                actual: Version::new(actual),
            }),
            None => Err(StoreError::SagaNotFound(saga.id)),
        }
    }

    #[tracing::instrument(skip(self))]
    async fn claim_saga(
        &self,
        id: SagaId,
        expected_version: Version,
        expected_status: SagaStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<Version>> {
        let version: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE saga_transactions
            SET updated_at = $4, version = version + 1
            WHERE id = $1 AND version = $2 AND status = $3
            RETURNING version
            "#,
        )
        .bind(id.as_uuid())
        .bind(expected_version.as_i64())
        .bind(expected_status.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(version.map(Version::new))
    }

    async fn find_stale(
        &self,
        statuses: &[SagaStatus],
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SagaTransaction>> {
        let rows = sqlx::query(&format!(
            "SELECT {SAGA_COLUMNS} FROM saga_transactions \
             WHERE status = ANY($1) AND updated_at < $2 \
             ORDER BY updated_at ASC LIMIT $3"
        ))
        .bind(status_names(statuses))
        .bind(updated_before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_saga).collect()
    }

    async fn delete_sagas_before(
        &self,
        statuses: &[SagaStatus],
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM saga_transactions
            WHERE id IN (
                SELECT id FROM saga_transactions
                WHERE status = ANY($1) AND updated_at < $2
                LIMIT $3
            )
            "#,
        )
        .bind(status_names(statuses))
        .bind(before)
        .bind(limit as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn count_sagas_by_status(&self) -> Result<HashMap<SagaStatus, u64>> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS count FROM saga_transactions GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = HashMap::new();
        for row in rows {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("count")?;
            let status: SagaStatus = status
                .parse()
                .map_err(|e| StoreError::InvalidRecord(format!("{e}")))?;
            counts.insert(status, count as u64);
        }
        Ok(counts)
    }
}

#[async_trait]
impl OutboxStore for PostgresStore {
    async fn fetch_unsent(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox WHERE status = $1 ORDER BY id ASC LIMIT $2"
        ))
        .bind(OutboxStatus::New.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_outbox).collect()
    }

    async fn mark_sent(&self, id: i64, sent_at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE outbox SET status = $2, sent_at = $3 WHERE id = $1 AND status = $4",
        )
        .bind(id)
        .bind(OutboxStatus::Sent.as_str())
        .bind(sent_at)
        .bind(OutboxStatus::New.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_failure(&self, id: i64, error: &str) -> Result<()> {
        sqlx::query("UPDATE outbox SET attempts = attempts + 1, last_error = $2 WHERE id = $1")
            .bind(id)
            .bind(error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_outbox(&self, id: i64) -> Result<Option<OutboxRecord>> {
        let row = sqlx::query(&format!("SELECT {OUTBOX_COLUMNS} FROM outbox WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_outbox).transpose()
    }

    async fn delete_sent_before(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM outbox WHERE status = $1 AND created_at < $2")
            .bind(OutboxStatus::Sent.as_str())
            .bind(before)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn count_outbox_by_status(&self) -> Result<HashMap<OutboxStatus, u64>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM outbox GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = HashMap::new();
        for row in rows {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("count")?;
            let status: OutboxStatus = status
                .parse()
                .map_err(|e| StoreError::InvalidRecord(format!("{e}")))?;
            counts.insert(status, count as u64);
        }
        Ok(counts)
    }
}

#[async_trait]
impl InboxStore for PostgresStore {
    async fn load_inbox(&self, message_id: &str) -> Result<Option<InboxRecord>> {
        let row = sqlx::query("SELECT message_id, processed_at FROM inbox WHERE message_id = $1")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| -> Result<InboxRecord> {
            Ok(InboxRecord {
                message_id: row.try_get("message_id")?,
                processed_at: row.try_get("processed_at")?,
            })
        })
        .transpose()
    }

    async fn delete_processed_before(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM inbox WHERE processed_at < $1")
            .bind(before)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
