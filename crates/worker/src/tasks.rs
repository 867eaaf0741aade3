//! Background maintenance tasks run by the worker.

use std::sync::Arc;

use chrono::Utc;
use outbox::{InboxDeduplicator, OutboxDispatcher, Transport};
use saga::{SagaOrchestrator, StaleSagaRecoverer, StepRegistry};
use store::{InboxStore, OutboxStatus, OutboxStore, SagaRepository, TransactionalStore};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::scheduler::spawn_periodic;

/// Spawns every periodic task: outbox relay and retention, inbox cleanup,
/// stale saga recovery, saga retention and statistics logging.
/// The statistics run also reports the outbox backlog.
pub fn spawn_background_tasks<S, T>(
    config: &Config,
    store: S,
    orchestrator: Arc<SagaOrchestrator<S>>,
    registry: Arc<StepRegistry>,
    transport: T,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>>
where
    S: SagaRepository + OutboxStore + InboxStore + TransactionalStore + Clone + 'static,
    T: Transport + 'static,
{
    let dispatcher = Arc::new(OutboxDispatcher::new(
        store.clone(),
        transport,
        config.dispatcher_config(),
    ));
    let inbox = Arc::new(InboxDeduplicator::new(store.clone()));
    let recoverer = Arc::new(StaleSagaRecoverer::new(
        orchestrator,
        registry,
        config.recovery_config(),
    ));
    let inbox_retention = config.inbox_retention;

    let mut handles = Vec::new();

    let d = Arc::clone(&dispatcher);
    handles.push(spawn_periodic(
        "outbox_dispatch",
        config.outbox_poll_interval,
        shutdown.clone(),
        move || {
            let d = Arc::clone(&d);
            async move {
                if let Err(e) = d.run_once().await {
                    tracing::error!(error = %e, "outbox dispatch failed");
                }
            }
        },
    ));

    let d = dispatcher;
    handles.push(spawn_periodic(
        "outbox_retention",
        config.retention_interval,
        shutdown.clone(),
        move || {
            let d = Arc::clone(&d);
            async move {
                if let Err(e) = d.purge_sent().await {
                    tracing::error!(error = %e, "outbox retention failed");
                }
            }
        },
    ));

    handles.push(spawn_periodic(
        "inbox_cleanup",
        config.inbox_cleanup_interval,
        shutdown.clone(),
        move || {
            let inbox = Arc::clone(&inbox);
            async move {
                let before = Utc::now() - inbox_retention;
                if let Err(e) = inbox.purge_processed_before(before).await {
                    tracing::error!(error = %e, "inbox cleanup failed");
                }
            }
        },
    ));

    let r = Arc::clone(&recoverer);
    handles.push(spawn_periodic(
        "saga_recovery",
        config.saga_recovery_interval,
        shutdown.clone(),
        move || {
            let r = Arc::clone(&r);
            async move {
                if let Err(e) = r.recover_stale().await {
                    tracing::error!(error = %e, "stale saga recovery failed");
                }
            }
        },
    ));

    let r = Arc::clone(&recoverer);
    handles.push(spawn_periodic(
        "saga_retention",
        config.retention_interval,
        shutdown.clone(),
        move || {
            let r = Arc::clone(&r);
            async move {
                if let Err(e) = r.purge_terminal().await {
                    tracing::error!(error = %e, "saga retention failed");
                }
            }
        },
    ));

    handles.push(spawn_periodic(
        "saga_stats",
        config.saga_stats_interval,
        shutdown,
        move || {
            let r = Arc::clone(&recoverer);
            let store = store.clone();
            async move {
                if let Err(e) = r.log_statistics().await {
                    tracing::warn!(error = %e, "saga statistics unavailable");
                }
                log_outbox_backlog(&store).await;
            }
        },
    ));

    handles
}

async fn log_outbox_backlog<S: OutboxStore>(store: &S) {
    match store.count_outbox_by_status().await {
        Ok(counts) => {
            for status in [OutboxStatus::New, OutboxStatus::Sent] {
                let count = counts.get(&status).copied().unwrap_or(0);
                metrics::gauge!("outbox_rows", "status" => status.as_str()).set(count as f64);
            }
            tracing::info!(
                unsent = counts.get(&OutboxStatus::New).copied().unwrap_or(0),
                sent = counts.get(&OutboxStatus::Sent).copied().unwrap_or(0),
                "outbox backlog"
            );
        }
        Err(e) => tracing::warn!(error = %e, "outbox statistics unavailable"),
    }
}
