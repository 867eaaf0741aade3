//! Relays unsent outbox rows to the transport.

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use store::{OutboxRecord, OutboxStore};

use crate::{OutboundMessage, Result, Transport};

/// Dispatcher tuning.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Rows fetched per cycle.
    pub batch_size: usize,
    /// How long to wait for a broker confirmation.
    pub publish_timeout: Duration,
    /// Failed attempts after which an unsent row is reported as overdue.
    pub alert_attempts: i32,
    /// Age after which an unsent row is reported as overdue.
    pub alert_age: Duration,
    /// How long sent rows are kept.
    pub retention: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            publish_timeout: Duration::from_secs(5),
            alert_attempts: 3,
            alert_age: Duration::from_secs(300),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// Outcome of one dispatch cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub published: usize,
    pub failed: usize,
    /// Rows held back because an earlier row of the same aggregate failed.
    pub skipped: usize,
    /// Rows still unsent that crossed an alert threshold.
    pub overdue: usize,
}

/// Polls the outbox and publishes unsent rows in id order.
pub struct OutboxDispatcher<S, T>
where
    S: OutboxStore,
    T: Transport,
{
    store: S,
    transport: T,
    config: DispatcherConfig,
}

impl<S, T> OutboxDispatcher<S, T>
where
    S: OutboxStore,
    T: Transport,
{
    pub fn new(store: S, transport: T, config: DispatcherConfig) -> Self {
        Self {
            store,
            transport,
            config,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Runs one cycle with the configured batch size.
    pub async fn run_once(&self) -> Result<DispatchReport> {
        self.dispatch_batch(self.config.batch_size).await
    }

    /// Publishes up to `limit` unsent rows.
    ///
    /// A row is marked sent only after the transport confirms it. Failed or
    /// unconfirmed rows stay `NEW` for the next cycle, and later rows of the
    /// same aggregate are held back so per-aggregate order is kept.
    #[tracing::instrument(skip(self))]
    pub async fn dispatch_batch(&self, limit: usize) -> Result<DispatchReport> {
        let rows = self.store.fetch_unsent(limit).await?;
        let mut report = DispatchReport::default();
        let mut blocked: HashSet<String> = HashSet::new();
        let mut pending: Vec<(OutboxRecord, bool)> = Vec::new();

        for row in rows {
            let routing_key = row.routing_key();
            if blocked.contains(&routing_key) {
                report.skipped += 1;
                pending.push((row, false));
                continue;
            }

            match self.publish(&row).await {
                Ok(()) => {
                    if self.store.mark_sent(row.id, Utc::now()).await? {
                        report.published += 1;
                        metrics::counter!("outbox_published_total").increment(1);
                        tracing::debug!(outbox_id = row.id, %routing_key, "outbox event published");
                    } else {
                        tracing::debug!(outbox_id = row.id, "outbox row already sent elsewhere");
                    }
                }
                Err(reason) => {
                    self.store.record_failure(row.id, &reason).await?;
                    report.failed += 1;
                    metrics::counter!("outbox_publish_failures_total").increment(1);
                    tracing::warn!(outbox_id = row.id, %routing_key, %reason, "outbox publish failed");
                    blocked.insert(routing_key);
                    pending.push((row, true));
                }
            }
        }

        report.overdue = self.report_overdue(&pending);

        if report.published > 0 || report.failed > 0 {
            tracing::info!(
                published = report.published,
                failed = report.failed,
                skipped = report.skipped,
                "outbox dispatch cycle finished"
            );
        }
        Ok(report)
    }

    /// Deletes sent rows older than the retention window.
    #[tracing::instrument(skip(self))]
    pub async fn purge_sent(&self) -> Result<u64> {
        let cutoff = Utc::now() - self.config.retention;
        let deleted = self.store.delete_sent_before(cutoff).await?;
        if deleted > 0 {
            tracing::info!(deleted, "purged sent outbox rows");
        }
        Ok(deleted)
    }

    async fn publish(&self, row: &OutboxRecord) -> std::result::Result<(), String> {
        let message = OutboundMessage::from(row);
        match tokio::time::timeout(self.config.publish_timeout, self.transport.publish(message))
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "no confirmation within {}ms",
                self.config.publish_timeout.as_millis()
            )),
        }
    }

    /// Counts rows still unsent past an alert threshold and raises them.
    fn report_overdue(&self, pending: &[(OutboxRecord, bool)]) -> usize {
        let now = Utc::now();
        let mut overdue = 0;
        for (row, failed_now) in pending {
            let attempts = row.attempts + i32::from(*failed_now);
            let age = (now - row.created_at).to_std().unwrap_or_default();
            if attempts >= self.config.alert_attempts || age >= self.config.alert_age {
                overdue += 1;
                tracing::error!(
                    outbox_id = row.id,
                    routing_key = %row.routing_key(),
                    attempts,
                    age_secs = age.as_secs(),
                    last_error = row.last_error.as_deref().unwrap_or(""),
                    "outbox event overdue"
                );
            }
        }
        metrics::gauge!("outbox_overdue").set(overdue as f64);
        overdue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemoryTransport, OutboxRecorder};
    use store::{InMemoryStore, OutboxStatus, TransactionalStore, UnitOfWork};

    async fn seed(store: &InMemoryStore, rows: &[(&str, &str)]) -> Vec<i64> {
        let recorder = OutboxRecorder::new();
        let mut uow = store.begin().await.unwrap();
        let mut ids = Vec::new();
        for (aggregate_id, event_type) in rows {
            ids.push(
                recorder
                    .record(&mut uow, "Order", aggregate_id, event_type, b"{}".to_vec())
                    .await
                    .unwrap(),
            );
        }
        uow.commit().await.unwrap();
        ids
    }

    #[tokio::test]
    async fn publishes_in_id_order_and_marks_sent() {
        let store = InMemoryStore::new();
        let transport = InMemoryTransport::new();
        let ids = seed(&store, &[("1", "A"), ("2", "B"), ("1", "C")]).await;
        let dispatcher =
            OutboxDispatcher::new(store.clone(), transport.clone(), DispatcherConfig::default());

        let report = dispatcher.run_once().await.unwrap();
        assert_eq!(report.published, 3);

        let published: Vec<String> = transport
            .published()
            .into_iter()
            .map(|m| m.message_id)
            .collect();
        let expected: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        assert_eq!(published, expected);

        for id in ids {
            let row = store.load_outbox(id).await.unwrap().unwrap();
            assert_eq!(row.status, OutboxStatus::Sent);
        }
    }

    #[tokio::test]
    async fn failure_holds_back_later_rows_of_same_aggregate() {
        let store = InMemoryStore::new();
        let transport = InMemoryTransport::new();
        transport.fail_routing_key("Order.1");
        seed(&store, &[("1", "A"), ("2", "B"), ("1", "C")]).await;
        let dispatcher =
            OutboxDispatcher::new(store.clone(), transport.clone(), DispatcherConfig::default());

        let report = dispatcher.run_once().await.unwrap();
        assert_eq!(
            report,
            DispatchReport {
                published: 1,
                failed: 1,
                skipped: 1,
                overdue: 0,
            }
        );
        assert_eq!(transport.published()[0].routing_key, "Order.2");
    }

    #[tokio::test]
    async fn repeated_failures_are_reported_overdue() {
        let store = InMemoryStore::new();
        let transport = InMemoryTransport::new();
        transport.set_fail_on_publish(true);
        let ids = seed(&store, &[("1", "A")]).await;
        let config = DispatcherConfig {
            alert_attempts: 2,
            ..DispatcherConfig::default()
        };
        let dispatcher = OutboxDispatcher::new(store.clone(), transport.clone(), config);

        assert_eq!(dispatcher.run_once().await.unwrap().overdue, 0);
        assert_eq!(dispatcher.run_once().await.unwrap().overdue, 1);

        let row = store.load_outbox(ids[0]).await.unwrap().unwrap();
        assert_eq!(row.status, OutboxStatus::New);
        assert_eq!(row.attempts, 2);
        assert!(row.last_error.is_some());

        // Still retried, and delivered once the broker recovers
        transport.set_fail_on_publish(false);
        let report = dispatcher.run_once().await.unwrap();
        assert_eq!(report.published, 1);
        assert_eq!(report.overdue, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_publish_times_out() {
        let store = InMemoryStore::new();
        let transport = InMemoryTransport::new();
        transport.set_confirm_delay(Some(Duration::from_secs(60)));
        let ids = seed(&store, &[("1", "A")]).await;
        let dispatcher =
            OutboxDispatcher::new(store.clone(), transport.clone(), DispatcherConfig::default());

        let report = dispatcher.run_once().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(transport.published_count(), 0);
        let row = store.load_outbox(ids[0]).await.unwrap().unwrap();
        assert_eq!(row.status, OutboxStatus::New);
    }
}
