use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::{
    InboxRecord, NewOutboxRecord, OutboxRecord, OutboxStatus, Result, SagaId, SagaStatus,
    SagaTransaction, StoreError, Version,
    store::{InboxStore, OutboxStore, SagaRepository, TransactionalStore, UnitOfWork},
};

#[derive(Debug, Default)]
struct MemoryState {
    sagas: HashMap<SagaId, SagaTransaction>,
    outbox: BTreeMap<i64, OutboxRecord>,
    inbox: HashMap<String, InboxRecord>,
    /// Business rows keyed by table then primary key.
    tables: HashMap<String, BTreeMap<String, serde_json::Value>>,
}

#[derive(Debug, Default)]
struct Faults {
    fail_on_commit: AtomicBool,
    fail_on_saga_write: AtomicBool,
    fail_next_saga_write: AtomicBool,
}

/// In-memory store implementation for testing.
///
/// Provides the same interface and atomicity guarantees as the PostgreSQL
/// implementation, plus a small keyed table space for business rows so that
/// business changes can share a unit of work with outbox and inbox writes.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<MemoryState>>,
    next_outbox_id: Arc<AtomicI64>,
    faults: Arc<Faults>,
}

impl InMemoryStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent commit fail until reset.
    pub fn set_fail_on_commit(&self, fail: bool) {
        self.faults.fail_on_commit.store(fail, Ordering::SeqCst);
    }

    /// Makes every subsequent saga insert/update fail until reset.
    pub fn set_fail_on_saga_write(&self, fail: bool) {
        self.faults.fail_on_saga_write.store(fail, Ordering::SeqCst);
    }

    /// Makes only the next saga insert/update fail.
    pub fn fail_next_saga_write(&self) {
        self.faults.fail_next_saga_write.store(true, Ordering::SeqCst);
    }

    /// Returns a committed business row.
    pub async fn get_row(&self, table: &str, key: &str) -> Option<serde_json::Value> {
        let state = self.state.read().await;
        state.tables.get(table).and_then(|rows| rows.get(key)).cloned()
    }

    /// Returns the number of committed rows in a business table.
    pub async fn row_count(&self, table: &str) -> usize {
        let state = self.state.read().await;
        state.tables.get(table).map_or(0, BTreeMap::len)
    }

    /// Returns every outbox row, ordered by id.
    pub async fn outbox_records(&self) -> Vec<OutboxRecord> {
        self.state.read().await.outbox.values().cloned().collect()
    }

    /// Returns the total number of saga rows.
    pub async fn saga_count(&self) -> usize {
        self.state.read().await.sagas.len()
    }

    fn check_saga_write(&self) -> Result<()> {
        if self.faults.fail_on_saga_write.load(Ordering::SeqCst)
            || self.faults.fail_next_saga_write.swap(false, Ordering::SeqCst)
        {
            return Err(StoreError::Unavailable("saga write rejected".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug)]
enum RowWrite {
    Put {
        table: String,
        key: String,
        value: serde_json::Value,
    },
    Delete {
        table: String,
        key: String,
    },
}

#[derive(Debug)]
struct RowRead {
    table: String,
    key: String,
    value: Option<serde_json::Value>,
}

/// A unit of work against [`InMemoryStore`].
///
/// Writes are buffered and applied under a single write lock on commit.
/// Business rows read through the unit are validated on commit: if any of
/// them changed in the meantime the commit fails with `RowConflict`, so a
/// read-modify-write never overwrites a concurrent update.
#[derive(Debug)]
pub struct MemoryUnitOfWork {
    store: InMemoryStore,
    outbox: Vec<OutboxRecord>,
    inbox: Vec<InboxRecord>,
    reads: Vec<RowRead>,
    writes: Vec<RowWrite>,
}

impl MemoryUnitOfWork {
    /// Stages an insert or replace of a business row.
    pub fn put_row(
        &mut self,
        table: impl Into<String>,
        key: impl Into<String>,
        value: serde_json::Value,
    ) {
        self.writes.push(RowWrite::Put {
            table: table.into(),
            key: key.into(),
            value,
        });
    }

    /// Stages a delete of a business row.
    pub fn delete_row(&mut self, table: impl Into<String>, key: impl Into<String>) {
        self.writes.push(RowWrite::Delete {
            table: table.into(),
            key: key.into(),
        });
    }

    /// Reads a business row, seeing this unit's own staged writes.
    pub async fn get_row(&mut self, table: &str, key: &str) -> Option<serde_json::Value> {
        for write in self.writes.iter().rev() {
            match write {
                RowWrite::Put {
                    table: t,
                    key: k,
                    value,
                } if t == table && k == key => return Some(value.clone()),
                RowWrite::Delete { table: t, key: k } if t == table && k == key => return None,
                _ => {}
            }
        }
        if let Some(read) = self
            .reads
            .iter()
            .find(|r| r.table == table && r.key == key)
        {
            return read.value.clone();
        }

        let value = self.store.get_row(table, key).await;
        self.reads.push(RowRead {
            table: table.to_string(),
            key: key.to_string(),
            value: value.clone(),
        });
        value
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn insert_outbox(&mut self, record: NewOutboxRecord) -> Result<i64> {
        let id = self.store.next_outbox_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.outbox.push(OutboxRecord {
            id,
            aggregate_type: record.aggregate_type,
            aggregate_id: record.aggregate_id,
            event_type: record.event_type,
            payload: record.payload,
            status: OutboxStatus::New,
            attempts: 0,
            last_error: None,
            created_at: Utc::now(),
            sent_at: None,
        });
        Ok(id)
    }

    async fn insert_inbox(
        &mut self,
        message_id: &str,
        processed_at: DateTime<Utc>,
    ) -> Result<bool> {
        if self.inbox.iter().any(|r| r.message_id == message_id) {
            return Ok(false);
        }
        if self.store.state.read().await.inbox.contains_key(message_id) {
            return Ok(false);
        }
        self.inbox.push(InboxRecord {
            message_id: message_id.to_string(),
            processed_at,
        });
        Ok(true)
    }

    async fn commit(self) -> Result<()> {
        if self.store.faults.fail_on_commit.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("commit rejected".to_string()));
        }

        let mut state = self.store.state.write().await;

        // Another unit may have committed the same key since we staged it
        if let Some(dup) = self
            .inbox
            .iter()
            .find(|r| state.inbox.contains_key(&r.message_id))
        {
            return Err(StoreError::DuplicateKey(format!(
                "inbox message_id {}",
                dup.message_id
            )));
        }

        if let Some(stale) = self.reads.iter().find(|r| {
            state.tables.get(&r.table).and_then(|rows| rows.get(&r.key)) != r.value.as_ref()
        }) {
            return Err(StoreError::RowConflict {
                table: stale.table.clone(),
                key: stale.key.clone(),
            });
        }

        for record in self.inbox {
            state.inbox.insert(record.message_id.clone(), record);
        }
        for record in self.outbox {
            state.outbox.insert(record.id, record);
        }
        for write in self.writes {
            match write {
                RowWrite::Put { table, key, value } => {
                    state.tables.entry(table).or_default().insert(key, value);
                }
                RowWrite::Delete { table, key } => {
                    if let Some(rows) = state.tables.get_mut(&table) {
                        rows.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl TransactionalStore for InMemoryStore {
    type Unit = MemoryUnitOfWork;

    async fn begin(&self) -> Result<MemoryUnitOfWork> {
        Ok(MemoryUnitOfWork {
            store: self.clone(),
            outbox: Vec::new(),
            inbox: Vec::new(),
            reads: Vec::new(),
            writes: Vec::new(),
        })
    }
}

#[async_trait]
impl SagaRepository for InMemoryStore {
    async fn insert_saga(&self, saga: &SagaTransaction) -> Result<()> {
        self.check_saga_write()?;
        let mut state = self.state.write().await;
        if state.sagas.contains_key(&saga.id) {
            return Err(StoreError::DuplicateKey(format!("saga id {}", saga.id)));
        }
        state.sagas.insert(saga.id, saga.clone());
        Ok(())
    }

    async fn load_saga(&self, id: SagaId) -> Result<Option<SagaTransaction>> {
        Ok(self.state.read().await.sagas.get(&id).cloned())
    }

    async fn find_by_business_id(&self, business_id: &str) -> Result<Option<SagaTransaction>> {
        let state = self.state.read().await;
        Ok(state
            .sagas
            .values()
            .filter(|s| s.business_id == business_id)
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn update_saga(&self, saga: &SagaTransaction) -> Result<Version> {
        self.check_saga_write()?;
        let mut state = self.state.write().await;
        let stored = state
            .sagas
            .get_mut(&saga.id)
            .ok_or(StoreError::SagaNotFound(saga.id))?;

        if stored.version != saga.version {
            return Err(StoreError::ConcurrencyConflict {
                saga_id: saga.id,
                expected: saga.version,
                actual: stored.version,
            });
        }

        let next = saga.version.next();
        *stored = SagaTransaction {
            version: next,
            ..saga.clone()
        };
        Ok(next)
    }

    async fn claim_saga(
        &self,
        id: SagaId,
        expected_version: Version,
        expected_status: SagaStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<Version>> {
        self.check_saga_write()?;
        let mut state = self.state.write().await;
        match state.sagas.get_mut(&id) {
            Some(stored)
                if stored.version == expected_version && stored.status == expected_status =>
            {
                stored.version = stored.version.next();
                stored.updated_at = now;
                Ok(Some(stored.version))
            }
            _ => Ok(None),
        }
    }

    async fn find_stale(
        &self,
        statuses: &[SagaStatus],
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SagaTransaction>> {
        let state = self.state.read().await;
        let mut stale: Vec<_> = state
            .sagas
            .values()
            .filter(|s| statuses.contains(&s.status) && s.updated_at < updated_before)
            .cloned()
            .collect();
        stale.sort_by_key(|s| s.updated_at);
        stale.truncate(limit);
        Ok(stale)
    }

    async fn delete_sagas_before(
        &self,
        statuses: &[SagaStatus],
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<u64> {
        let mut state = self.state.write().await;
        let doomed: Vec<SagaId> = state
            .sagas
            .values()
            .filter(|s| statuses.contains(&s.status) && s.updated_at < before)
            .map(|s| s.id)
            .take(limit)
            .collect();
        for id in &doomed {
            state.sagas.remove(id);
        }
        Ok(doomed.len() as u64)
    }

    async fn count_sagas_by_status(&self) -> Result<HashMap<SagaStatus, u64>> {
        let state = self.state.read().await;
        let mut counts = HashMap::new();
        for saga in state.sagas.values() {
            *counts.entry(saga.status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

#[async_trait]
impl OutboxStore for InMemoryStore {
    async fn fetch_unsent(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        let state = self.state.read().await;
        Ok(state
            .outbox
            .values()
            .filter(|r| r.status == OutboxStatus::New)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_sent(&self, id: i64, sent_at: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.outbox.get_mut(&id) {
            Some(record) if record.status == OutboxStatus::New => {
                record.status = OutboxStatus::Sent;
                record.sent_at = Some(sent_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_failure(&self, id: i64, error: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(record) = state.outbox.get_mut(&id) {
            record.attempts += 1;
            record.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn load_outbox(&self, id: i64) -> Result<Option<OutboxRecord>> {
        Ok(self.state.read().await.outbox.get(&id).cloned())
    }

    async fn delete_sent_before(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.write().await;
        let before_len = state.outbox.len();
        state
            .outbox
            .retain(|_, r| !(r.status == OutboxStatus::Sent && r.created_at < before));
        Ok((before_len - state.outbox.len()) as u64)
    }

    async fn count_outbox_by_status(&self) -> Result<HashMap<OutboxStatus, u64>> {
        let state = self.state.read().await;
        let mut counts = HashMap::new();
        for record in state.outbox.values() {
            *counts.entry(record.status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

#[async_trait]
impl InboxStore for InMemoryStore {
    async fn load_inbox(&self, message_id: &str) -> Result<Option<InboxRecord>> {
        Ok(self.state.read().await.inbox.get(message_id).cloned())
    }

    async fn delete_processed_before(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.write().await;
        let before_len = state.inbox.len();
        state.inbox.retain(|_, r| r.processed_at >= before);
        Ok((before_len - state.inbox.len()) as u64)
    }
}
