//! Runs a saga until it reaches a terminal status.

use std::time::Duration;

use saga::{Coordinator, SagaError};
use saga_store::{Instance, SagaId};
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::{Result, WorkerError};

/// Polls [`Coordinator::run`] until the saga is terminal.
///
/// Runs that could not make progress (lease held elsewhere, lease lost,
/// concurrent writer, store or lock hiccup) are retried after the poll
/// interval. Any other run error is returned.
#[derive(Clone)]
pub struct Driver {
    coordinator: Coordinator,
    poll_interval: Duration,
    max_runs: u32,
}

impl Driver {
    pub fn new(coordinator: Coordinator, config: &WorkerConfig) -> Self {
        Self {
            coordinator,
            poll_interval: config.poll_interval,
            max_runs: config.max_runs,
        }
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    #[tracing::instrument(skip(self, shutdown))]
    pub async fn drive(&self, saga_id: &SagaId, shutdown: &CancellationToken) -> Result<Instance> {
        for run in 1..=self.max_runs {
            if shutdown.is_cancelled() {
                return Err(WorkerError::Shutdown(saga_id.clone()));
            }

            match self.coordinator.run(saga_id, shutdown).await {
                Ok(()) => {}
                Err(SagaError::Compensation(failures)) => {
                    tracing::error!(run, failures = failures.len(), error = %failures, "compensation incomplete");
                }
                Err(err) if is_retryable(&err) => {
                    tracing::warn!(run, error = %err, "saga run made no progress");
                }
                Err(err) => return Err(err.into()),
            }

            let instance = self.coordinator.load(saga_id).await?;
            if instance.is_terminal() {
                tracing::info!(run, status = %instance.status, "saga finished");
                metrics::histogram!("worker_runs_per_saga").record(f64::from(run));
                return Ok(instance);
            }

            tokio::select! {
                _ = shutdown.cancelled() => return Err(WorkerError::Shutdown(saga_id.clone())),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        metrics::counter!("worker_gave_up_total").increment(1);
        Err(WorkerError::GaveUp {
            id: saga_id.clone(),
            runs: self.max_runs,
        })
    }
}

fn is_retryable(err: &SagaError) -> bool {
    matches!(
        err,
        SagaError::Locked(_)
            | SagaError::LeaseLost(_)
            | SagaError::Conflict { .. }
            | SagaError::Store(_)
            | SagaError::Lock(_)
    )
}
