//! Consumer-side deduplication.

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use store::{InboxStore, StoreError, TransactionalStore, UnitOfWork};

/// Turns at-least-once delivery into at-most-once business effect.
///
/// The dedup key is inserted in the consumer's own unit of work, so the key
/// and the effect commit together or not at all.
#[derive(Debug, Clone)]
pub struct InboxDeduplicator<S> {
    store: S,
}

impl<S> InboxDeduplicator<S>
where
    S: TransactionalStore,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Stages the dedup key for `message_id` in `uow`.
    ///
    /// Returns true on first delivery; the caller must then apply its effect
    /// in the same unit. Returns false for a duplicate, which must be skipped.
    pub async fn try_consume(
        &self,
        uow: &mut S::Unit,
        message_id: &str,
    ) -> store::Result<bool> {
        let first = uow.insert_inbox(message_id, Utc::now()).await?;
        if first {
            metrics::counter!("inbox_consumed_total").increment(1);
        } else {
            metrics::counter!("inbox_duplicates_total").increment(1);
            tracing::debug!(message_id, "duplicate delivery skipped");
        }
        Ok(first)
    }

    /// Applies `effect` exactly once for `message_id`.
    ///
    /// Opens a unit of work, stages the dedup key and, on first delivery, runs
    /// `effect` in the same unit before committing. Returns `None` for a
    /// duplicate. If `effect` fails nothing is committed and the message can
    /// be redelivered.
    #[tracing::instrument(skip(self, effect))]
    pub async fn consume_once<T, E, F>(
        &self,
        message_id: &str,
        effect: F,
    ) -> std::result::Result<Option<T>, E>
    where
        E: From<StoreError>,
        F: for<'a> FnOnce(&'a mut S::Unit) -> BoxFuture<'a, std::result::Result<T, E>>,
    {
        let mut uow = self.store.begin().await?;

        if !self.try_consume(&mut uow, message_id).await? {
            uow.rollback().await?;
            return Ok(None);
        }

        let value = match effect(&mut uow).await {
            Ok(value) => value,
            Err(e) => {
                uow.rollback().await?;
                return Err(e);
            }
        };

        match uow.commit().await {
            Ok(()) => Ok(Some(value)),
            // A concurrent delivery committed the same key first
            Err(StoreError::DuplicateKey(_)) => {
                metrics::counter!("inbox_duplicates_total").increment(1);
                tracing::debug!(message_id, "duplicate delivery lost commit race");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl<S> InboxDeduplicator<S>
where
    S: TransactionalStore + InboxStore,
{
    /// Deletes dedup keys processed before `before`.
    #[tracing::instrument(skip(self))]
    pub async fn purge_processed_before(&self, before: DateTime<Utc>) -> store::Result<u64> {
        let deleted = self.store.delete_processed_before(before).await?;
        if deleted > 0 {
            tracing::info!(deleted, "purged inbox entries");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use store::InMemoryStore;

    #[tokio::test]
    async fn try_consume_is_true_once() {
        let store = InMemoryStore::new();
        let inbox = InboxDeduplicator::new(store.clone());

        let mut uow = store.begin().await.unwrap();
        assert!(inbox.try_consume(&mut uow, "m-1").await.unwrap());
        uow.commit().await.unwrap();

        for _ in 0..3 {
            let mut uow = store.begin().await.unwrap();
            assert!(!inbox.try_consume(&mut uow, "m-1").await.unwrap());
        }
    }

    #[tokio::test]
    async fn failed_effect_does_not_mark_message_seen() {
        let store = InMemoryStore::new();
        let inbox = InboxDeduplicator::new(store.clone());

        let result: Result<Option<()>, StoreError> = inbox
            .consume_once("m-1", |_uow| {
                Box::pin(async { Err(StoreError::Unavailable("downstream".to_string())) })
            })
            .await;
        assert!(result.is_err());
        assert!(store.load_inbox("m-1").await.unwrap().is_none());

        let applied: Option<u32> = inbox
            .consume_once::<_, StoreError, _>("m-1", |_uow| Box::pin(async { Ok(7) }))
            .await
            .unwrap();
        assert_eq!(applied, Some(7));
    }
}
