//! Stale saga recovery, retention and statistics.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use common::SagaStatus;
use serde::Serialize;
use store::SagaRepository;

use crate::config::RecoveryConfig;
use crate::error::Result;
use crate::orchestrator::SagaOrchestrator;
use crate::registry::StepRegistry;

/// Outcome of one recovery sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub found: usize,
    pub recovered: usize,
    /// Sagas another sweep claimed or advanced first.
    pub skipped: usize,
    pub failed: usize,
}

/// Saga counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SagaStatistics {
    pub total: u64,
    pub by_status: BTreeMap<String, u64>,
}

impl SagaStatistics {
    pub fn count(&self, status: SagaStatus) -> u64 {
        self.by_status.get(status.as_str()).copied().unwrap_or(0)
    }
}

/// Finds abandoned sagas and resumes them through the orchestrator.
///
/// A saga is abandoned when it is still in a non-terminal status but its row
/// has not been touched for `stale_timeout`. Each candidate is claimed with a
/// conditional write first; only the sweep whose claim succeeds resumes it.
pub struct StaleSagaRecoverer<R>
where
    R: SagaRepository,
{
    orchestrator: Arc<SagaOrchestrator<R>>,
    registry: Arc<StepRegistry>,
    config: RecoveryConfig,
}

impl<R> StaleSagaRecoverer<R>
where
    R: SagaRepository,
{
    pub fn new(
        orchestrator: Arc<SagaOrchestrator<R>>,
        registry: Arc<StepRegistry>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            orchestrator,
            registry,
            config,
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Runs one recovery sweep.
    #[tracing::instrument(skip(self))]
    pub async fn recover_stale(&self) -> Result<RecoveryReport> {
        let repo = self.orchestrator.repository();
        let cutoff = Utc::now() - self.config.stale_timeout;
        let stale = repo
            .find_stale(&SagaStatus::RECOVERABLE, cutoff, self.config.batch_size)
            .await?;

        let mut report = RecoveryReport {
            found: stale.len(),
            ..RecoveryReport::default()
        };

        for saga in stale {
            let steps = match self.registry.resolve_for(&saga) {
                Ok(steps) => steps,
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(saga_id = %saga.id, error = %e, "cannot resolve steps for stale saga");
                    continue;
                }
            };

            if self.orchestrator.is_running(saga.id) {
                report.skipped += 1;
                metrics::counter!("saga_recovery_skipped_total").increment(1);
                tracing::debug!(saga_id = %saga.id, "stale saga still running here, skipping");
                continue;
            }

            let claimed = repo
                .claim_saga(saga.id, saga.version, saga.status, Utc::now())
                .await?;
            if claimed.is_none() {
                report.skipped += 1;
                metrics::counter!("saga_recovery_skipped_total").increment(1);
                tracing::debug!(saga_id = %saga.id, "stale saga claimed elsewhere, skipping");
                continue;
            }

            tracing::info!(
                saga_id = %saga.id,
                status = %saga.status,
                current_step = saga.current_step,
                "recovering stale saga"
            );

            match self.orchestrator.resume_saga(saga.id, &steps).await {
                Ok(resumed) => {
                    report.recovered += 1;
                    metrics::counter!("saga_recovered_total").increment(1);
                    tracing::info!(saga_id = %saga.id, status = %resumed.status, "stale saga recovered");
                }
                Err(e) if e.is_conflict() => {
                    report.skipped += 1;
                    metrics::counter!("saga_recovery_skipped_total").increment(1);
                    tracing::warn!(saga_id = %saga.id, "stale saga advanced concurrently, skipping");
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(saga_id = %saga.id, error = %e, "stale saga recovery failed");
                }
            }
        }

        if report.found > 0 {
            tracing::info!(
                found = report.found,
                recovered = report.recovered,
                skipped = report.skipped,
                failed = report.failed,
                "stale saga sweep finished"
            );
        }
        Ok(report)
    }

    /// Deletes `COMPLETED` and `COMPENSATED` sagas past retention, in batches.
    ///
    /// `FAILED` sagas are kept for operators.
    #[tracing::instrument(skip(self))]
    pub async fn purge_terminal(&self) -> Result<u64> {
        let repo = self.orchestrator.repository();
        let cutoff = Utc::now() - self.config.retention;
        let batch = self.config.retention_batch_size;
        let mut total = 0;

        loop {
            let deleted = repo
                .delete_sagas_before(&SagaStatus::RETAINABLE, cutoff, batch)
                .await?;
            total += deleted;
            if deleted == 0 || (deleted as usize) < batch {
                break;
            }
        }

        if total > 0 {
            tracing::info!(deleted = total, "purged terminal sagas");
        }
        Ok(total)
    }

    /// Counts sagas per status.
    pub async fn statistics(&self) -> Result<SagaStatistics> {
        saga_statistics(self.orchestrator.repository()).await
    }

    /// Logs the current saga statistics.
    pub async fn log_statistics(&self) -> Result<SagaStatistics> {
        let stats = self.statistics().await?;
        tracing::info!(
            total = stats.total,
            executing = stats.count(SagaStatus::Executing),
            compensating = stats.count(SagaStatus::Compensating),
            completed = stats.count(SagaStatus::Completed),
            compensated = stats.count(SagaStatus::Compensated),
            failed = stats.count(SagaStatus::Failed),
            "saga statistics"
        );
        Ok(stats)
    }
}

/// Counts sagas per status, listing every status even when zero.
pub async fn saga_statistics<R: SagaRepository + ?Sized>(repo: &R) -> Result<SagaStatistics> {
    let counts = repo.count_sagas_by_status().await?;
    let by_status: BTreeMap<String, u64> = SagaStatus::ALL
        .iter()
        .map(|s| (s.as_str().to_string(), counts.get(s).copied().unwrap_or(0)))
        .collect();
    Ok(SagaStatistics {
        total: by_status.values().sum(),
        by_status,
    })
}
