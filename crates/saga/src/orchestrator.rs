//! Saga orchestrator: forward execution with checkpointing, reverse
//! compensation on failure, and resume from the last durable checkpoint.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use common::{SagaId, SagaStatus};
use store::{SagaRepository, SagaTransaction};

use crate::config::{CompensationPolicy, OrchestratorConfig};
use crate::data::SagaData;
use crate::error::{Result, SagaError};
use crate::registry::StepRegistry;
use crate::step::SagaStep;

#[derive(Debug, Clone, Copy)]
enum Phase {
    Execute,
    Compensate,
}

impl Phase {
    fn as_str(&self) -> &'static str {
        match self {
            Phase::Execute => "execute",
            Phase::Compensate => "compensate",
        }
    }

    fn failure(&self, step: &str, reason: String) -> SagaError {
        let step = step.to_string();
        match self {
            Phase::Execute => SagaError::StepFailed { step, reason },
            Phase::Compensate => SagaError::CompensationFailed { step, reason },
        }
    }
}

enum StepOutcome {
    Succeeded(Option<SagaData>),
    Failed {
        error: SagaError,
        data: Option<SagaData>,
    },
}

/// Holds a saga in the orchestrator's running set until dropped.
struct RunGuard<'a> {
    running: &'a Mutex<HashSet<SagaId>>,
    id: SagaId,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

/// Drives sagas through their steps.
///
/// Every step boundary is checkpointed with a conditional write before the
/// next step runs, so the persisted row always reflects durable progress:
///
/// ```text
/// STARTED ──► EXECUTING ──┬──► COMPLETED
///                         └──► COMPENSATING ──┬──► COMPENSATED
///                                             └──► FAILED
/// ```
///
/// Each run, forward or compensating, opens with a conditional write before
/// any step runs, so a caller holding a stale row loses with a conflict
/// instead of running steps. Within one orchestrator a saga has at most one
/// driver at a time; a second concurrent call fails with
/// [`SagaError::InProgress`].
///
/// Step failures never surface as errors; they end in `COMPENSATED` or
/// `FAILED`. Errors returned from here are persistence or setup failures, and
/// leave the saga at its last checkpoint for recovery to pick up.
pub struct SagaOrchestrator<R>
where
    R: SagaRepository,
{
    repo: R,
    config: OrchestratorConfig,
    running: Mutex<HashSet<SagaId>>,
}

impl<R> SagaOrchestrator<R>
where
    R: SagaRepository,
{
    pub fn new(repo: R, config: OrchestratorConfig) -> Self {
        Self {
            repo,
            config,
            running: Mutex::new(HashSet::new()),
        }
    }

    pub fn repository(&self) -> &R {
        &self.repo
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Returns true while a call on this orchestrator is driving the saga.
    pub fn is_running(&self, saga_id: SagaId) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&saga_id)
    }

    fn enter(&self, saga_id: SagaId) -> Result<RunGuard<'_>> {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if !running.insert(saga_id) {
            metrics::counter!("saga_run_rejected_total").increment(1);
            tracing::warn!(%saga_id, "saga already running here, second driver rejected");
            return Err(SagaError::InProgress(saga_id));
        }
        Ok(RunGuard {
            running: &self.running,
            id: saga_id,
        })
    }

    /// Persists a new saga at step 0 and runs it.
    #[tracing::instrument(skip(self, context, steps), fields(saga_id))]
    pub async fn start_saga(
        &self,
        saga_type: &str,
        business_id: &str,
        context: SagaData,
        steps: &[Arc<dyn SagaStep>],
    ) -> Result<SagaTransaction> {
        let names = steps.iter().map(|s| s.step_name().to_string()).collect();
        let saga = SagaTransaction::new(saga_type, business_id, names, context.to_snapshot());
        tracing::Span::current().record("saga_id", tracing::field::display(saga.id));

        self.repo.insert_saga(&saga).await?;
        metrics::counter!("saga_started_total", "saga_type" => saga_type.to_string()).increment(1);
        tracing::info!(steps = steps.len(), "saga started");

        let _run = self.enter(saga.id)?;
        self.run_forward(saga, steps).await
    }

    /// Starts a saga of a type defined in `registry`.
    pub async fn start_registered(
        &self,
        registry: &StepRegistry,
        saga_type: &str,
        business_id: &str,
        context: SagaData,
    ) -> Result<SagaTransaction> {
        let steps = registry.steps_for(saga_type)?;
        self.start_saga(saga_type, business_id, context, &steps)
            .await
    }

    /// Runs the remaining steps from `current_step`.
    ///
    /// On the first failing step the saga switches to `COMPENSATING` and the
    /// completed steps are compensated in reverse. `saga` must be the row as
    /// last persisted; an outdated copy fails with a conflict before any step
    /// runs.
    pub async fn execute_saga(
        &self,
        saga: SagaTransaction,
        steps: &[Arc<dyn SagaStep>],
    ) -> Result<SagaTransaction> {
        let _run = self.enter(saga.id)?;
        self.run_forward(saga, steps).await
    }

    /// Compensates completed steps from index `from_step` down to 0.
    ///
    /// `from_step` is clamped to the steps that actually completed. The saga
    /// is moved to `COMPENSATING` with `current_step` set to the number of
    /// steps awaiting compensation, and that write is checkpointed before
    /// the first compensating action.
    pub async fn compensate_saga(
        &self,
        saga: SagaTransaction,
        steps: &[Arc<dyn SagaStep>],
        from_step: usize,
    ) -> Result<SagaTransaction> {
        let _run = self.enter(saga.id)?;
        verify_steps(&saga, steps)?;
        let data = SagaData::from_snapshot(&saga.context)?;
        let pending = from_step.saturating_add(1).min(saga.current_step);
        self.run_compensation(saga, steps, data, pending).await
    }

    /// Continues a saga from its persisted status.
    ///
    /// `STARTED` and `EXECUTING` sagas resume forward from `current_step`,
    /// `COMPENSATING` sagas resume compensation from `current_step - 1`.
    /// Terminal sagas are returned unchanged.
    ///
    /// The version check only tells writers apart, not live runners from
    /// crashed ones. Across processes, resume only sagas obtained through
    /// [`SagaRepository::claim_saga`], as the stale saga recoverer does.
    #[tracing::instrument(skip(self, steps))]
    pub async fn resume_saga(
        &self,
        saga_id: SagaId,
        steps: &[Arc<dyn SagaStep>],
    ) -> Result<SagaTransaction> {
        let _run = self.enter(saga_id)?;
        let saga = self
            .repo
            .load_saga(saga_id)
            .await?
            .ok_or(SagaError::NotFound(saga_id))?;

        match saga.status {
            SagaStatus::Started | SagaStatus::Executing => {
                tracing::info!(current_step = saga.current_step, "resuming saga forward");
                self.run_forward(saga, steps).await
            }
            SagaStatus::Compensating => {
                verify_steps(&saga, steps)?;
                let data = SagaData::from_snapshot(&saga.context)?;
                let pending = saga.current_step;
                tracing::info!(current_step = pending, "resuming saga compensation");
                self.run_compensation(saga, steps, data, pending).await
            }
            status => {
                tracing::debug!(%status, "saga already terminal, nothing to resume");
                Ok(saga)
            }
        }
    }

    /// Resumes a saga using the steps registered for its persisted names.
    pub async fn resume_registered(
        &self,
        registry: &StepRegistry,
        saga_id: SagaId,
    ) -> Result<SagaTransaction> {
        let saga = self
            .repo
            .load_saga(saga_id)
            .await?
            .ok_or(SagaError::NotFound(saga_id))?;
        let steps = registry.resolve_for(&saga)?;
        self.resume_saga(saga_id, &steps).await
    }

    #[tracing::instrument(
        skip(self, saga, steps),
        fields(saga_id = %saga.id, saga_type = %saga.saga_type)
    )]
    async fn run_forward(
        &self,
        mut saga: SagaTransaction,
        steps: &[Arc<dyn SagaStep>],
    ) -> Result<SagaTransaction> {
        verify_steps(&saga, steps)?;
        let mut data = SagaData::from_snapshot(&saga.context)?;
        let started = Instant::now();

        transition(&mut saga, SagaStatus::Executing)?;
        saga.context = data.to_snapshot();
        self.checkpoint(&mut saga).await?;

        for index in saga.current_step..steps.len() {
            let step = steps[index].as_ref();

            match self.run_step(step, &data, Phase::Execute).await {
                StepOutcome::Succeeded(updated) => {
                    if let Some(updated) = updated {
                        data.merge(updated);
                    }
                    saga.current_step = index + 1;
                    saga.context = data.to_snapshot();
                    self.checkpoint(&mut saga).await?;
                    tracing::debug!(
                        step = step.step_name(),
                        current_step = saga.current_step,
                        "saga step completed"
                    );
                }
                StepOutcome::Failed {
                    error,
                    data: updated,
                } => {
                    if let Some(updated) = updated {
                        data.merge(updated);
                    }
                    tracing::warn!(step = step.step_name(), %error, "saga step failed, compensating");
                    saga.error_message = Some(error.to_string());
                    saga.context = data.to_snapshot();
                    transition(&mut saga, SagaStatus::Compensating)?;
                    self.checkpoint(&mut saga).await?;

                    let pending = saga.current_step;
                    return self
                        .compensate_pending(saga, steps, data, pending, started)
                        .await;
                }
            }
        }

        transition(&mut saga, SagaStatus::Completed)?;
        saga.completed_at = Some(Utc::now());
        self.checkpoint(&mut saga).await?;

        metrics::counter!("saga_completed_total", "saga_type" => saga.saga_type.clone())
            .increment(1);
        metrics::histogram!("saga_duration_seconds").record(started.elapsed().as_secs_f64());
        tracing::info!("saga completed");
        Ok(saga)
    }

    /// Takes the row into `COMPENSATING` with a conditional write, then
    /// compensates the first `pending` steps.
    #[tracing::instrument(
        skip(self, saga, steps, data),
        fields(saga_id = %saga.id, saga_type = %saga.saga_type)
    )]
    async fn run_compensation(
        &self,
        mut saga: SagaTransaction,
        steps: &[Arc<dyn SagaStep>],
        data: SagaData,
        pending: usize,
    ) -> Result<SagaTransaction> {
        if saga.status != SagaStatus::Compensating {
            transition(&mut saga, SagaStatus::Compensating)?;
        }
        saga.current_step = pending;
        self.checkpoint(&mut saga).await?;

        self.compensate_pending(saga, steps, data, pending, Instant::now())
            .await
    }

    /// Compensates the first `pending` steps in reverse order.
    ///
    /// After each step `current_step` is lowered to that step's index and
    /// checkpointed, so a resumed sweep never compensates a step twice.
    async fn compensate_pending(
        &self,
        mut saga: SagaTransaction,
        steps: &[Arc<dyn SagaStep>],
        mut data: SagaData,
        pending: usize,
        started: Instant,
    ) -> Result<SagaTransaction> {
        let pending = pending.min(steps.len());

        for index in (0..pending).rev() {
            let step = steps[index].as_ref();
            let mut stop = false;

            if step.is_compensable() {
                match self.run_step(step, &data, Phase::Compensate).await {
                    StepOutcome::Succeeded(updated) => {
                        if let Some(updated) = updated {
                            data.merge(updated);
                        }
                        tracing::debug!(step = step.step_name(), "step compensated");
                    }
                    StepOutcome::Failed {
                        error,
                        data: updated,
                    } => {
                        if let Some(updated) = updated {
                            data.merge(updated);
                        }
                        tracing::error!(step = step.step_name(), %error, "compensation failed");
                        saga.failed_compensations.push(step.step_name().to_string());
                        append_error(&mut saga, &error);
                        stop = self.config.compensation_policy == CompensationPolicy::FailFast;
                    }
                }
            } else {
                tracing::debug!(step = step.step_name(), "step not compensable, skipped");
            }

            saga.current_step = index;
            saga.context = data.to_snapshot();
            self.checkpoint_compensation(&mut saga).await?;

            if stop {
                break;
            }
        }

        let terminal = if saga.failed_compensations.is_empty() {
            SagaStatus::Compensated
        } else {
            SagaStatus::Failed
        };
        transition(&mut saga, terminal)?;
        saga.completed_at = Some(Utc::now());
        self.checkpoint_compensation(&mut saga).await?;

        match terminal {
            SagaStatus::Compensated => {
                metrics::counter!("saga_compensated_total", "saga_type" => saga.saga_type.clone())
                    .increment(1);
                tracing::info!("saga compensated");
            }
            _ => {
                metrics::counter!("saga_failed_total", "saga_type" => saga.saga_type.clone())
                    .increment(1);
                tracing::error!(
                    failed_compensations = ?saga.failed_compensations,
                    "saga failed: compensation incomplete"
                );
            }
        }
        metrics::histogram!("saga_duration_seconds").record(started.elapsed().as_secs_f64());
        Ok(saga)
    }

    async fn run_step(&self, step: &dyn SagaStep, data: &SagaData, phase: Phase) -> StepOutcome {
        let started = Instant::now();
        let action = match phase {
            Phase::Execute => step.execute(data),
            Phase::Compensate => step.compensate(data),
        };

        let outcome = match tokio::time::timeout(self.config.step_timeout, action).await {
            Ok(Ok(result)) if result.success => StepOutcome::Succeeded(result.updated_data),
            Ok(Ok(result)) => StepOutcome::Failed {
                error: phase.failure(
                    step.step_name(),
                    result
                        .message
                        .unwrap_or_else(|| "step reported failure".to_string()),
                ),
                data: result.updated_data,
            },
            Ok(Err(e @ (SagaError::StepFailed { .. } | SagaError::CompensationFailed { .. }))) => {
                StepOutcome::Failed {
                    error: e,
                    data: None,
                }
            }
            Ok(Err(e)) => StepOutcome::Failed {
                error: phase.failure(step.step_name(), e.to_string()),
                data: None,
            },
            Err(_) => StepOutcome::Failed {
                error: SagaError::Timeout {
                    step: step.step_name().to_string(),
                    after_ms: self.config.step_timeout.as_millis(),
                },
                data: None,
            },
        };

        metrics::histogram!(
            "saga_step_duration_seconds",
            "step" => step.step_name().to_string(),
            "phase" => phase.as_str()
        )
        .record(started.elapsed().as_secs_f64());
        outcome
    }

    async fn checkpoint(&self, saga: &mut SagaTransaction) -> Result<()> {
        saga.updated_at = Utc::now();
        saga.version = self.repo.update_saga(saga).await?;
        Ok(())
    }

    /// Checkpoints during compensation; if the write fails for any reason
    /// other than a lost race, makes one attempt to park the saga as `FAILED`.
    async fn checkpoint_compensation(&self, saga: &mut SagaTransaction) -> Result<()> {
        let err = match self.checkpoint(saga).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_conflict() => return Err(e),
            Err(e) => e,
        };

        let mut parked = saga.clone();
        parked.status = SagaStatus::Failed;
        parked.error_message = Some(format!("Compensation checkpoint failed: {err}"));
        parked.completed_at = Some(Utc::now());
        match self.repo.update_saga(&parked).await {
            Ok(_) => {
                metrics::counter!("saga_failed_total", "saga_type" => saga.saga_type.clone())
                    .increment(1);
                tracing::error!(error = %err, "compensation could not be checkpointed, saga marked failed");
            }
            Err(mark_err) => {
                tracing::error!(
                    error = %err,
                    mark_error = %mark_err,
                    "compensation could not be checkpointed, saga left for recovery"
                );
            }
        }
        Err(err)
    }
}

fn append_error(saga: &mut SagaTransaction, error: &SagaError) {
    saga.error_message = Some(match saga.error_message.take() {
        Some(previous) => format!("{previous}; {error}"),
        None => error.to_string(),
    });
}

fn transition(saga: &mut SagaTransaction, to: SagaStatus) -> Result<()> {
    if !saga.status.can_transition_to(to) {
        return Err(SagaError::InvalidTransition {
            from: saga.status,
            to,
        });
    }
    saga.status = to;
    Ok(())
}

fn verify_steps(saga: &SagaTransaction, steps: &[Arc<dyn SagaStep>]) -> Result<()> {
    let matches = saga.steps.len() == steps.len()
        && saga
            .steps
            .iter()
            .zip(steps)
            .all(|(name, step)| name == step.step_name());
    if !matches {
        return Err(SagaError::StepMismatch {
            persisted: saga.steps.clone(),
            supplied: steps.iter().map(|s| s.step_name().to_string()).collect(),
        });
    }
    Ok(())
}
