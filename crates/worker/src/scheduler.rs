//! Periodic background tasks with single-flight execution.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

/// Spawns a task that runs `job` every `period` until `shutdown` flips.
///
/// Each run executes on its own task so a slow run never delays the ticker,
/// but a tick that fires while the previous run is still going is skipped:
/// at most one run of a given task is in flight at a time. On shutdown the
/// returned handle resolves once the in-flight run, if any, has finished.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    job: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let in_flight = Arc::new(Mutex::new(()));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::info!(task = name, period_ms = period.as_millis() as u64, "periodic task started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Ok(permit) = Arc::clone(&in_flight).try_lock_owned() else {
                        tracing::debug!(task = name, "previous run still in progress, skipping tick");
                        metrics::counter!("worker_task_skipped_total", "task" => name).increment(1);
                        continue;
                    };
                    let run = job();
                    tokio::spawn(async move {
                        let _permit = permit;
                        run.await;
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        let _drained = in_flight.lock().await;
        tracing::info!(task = name, "periodic task stopped");
    })
}
