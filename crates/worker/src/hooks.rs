//! Saga lifecycle logging.

use saga::{SagaError, SagaHooks, StepError};
use saga_store::{Instance, StepState};

/// Logs every saga and step transition.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHooks;

impl SagaHooks for LoggingHooks {
    fn on_saga_started(&self, instance: &Instance) {
        tracing::info!(saga_id = %instance.id, saga = %instance.name, "saga started");
    }

    fn on_saga_completed(&self, instance: &Instance) {
        tracing::info!(saga_id = %instance.id, "saga completed");
    }

    fn on_saga_failed(&self, instance: &Instance, error: &SagaError) {
        tracing::warn!(saga_id = %instance.id, %error, "saga failed");
    }

    fn on_saga_compensating(&self, instance: &Instance, from: usize) {
        tracing::info!(saga_id = %instance.id, from, "saga compensating");
    }

    fn on_saga_compensating_finished(&self, instance: &Instance) {
        tracing::info!(saga_id = %instance.id, "saga compensation finished");
    }

    fn on_step_start(&self, instance: &Instance, step: &StepState) {
        tracing::debug!(saga_id = %instance.id, step = %step.name, attempt = step.attempt, "step started");
    }

    fn on_step_success(&self, instance: &Instance, step: &StepState) {
        tracing::info!(saga_id = %instance.id, step = %step.name, attempt = step.attempt, "step completed");
    }

    fn on_step_failure(&self, instance: &Instance, step: &StepState, error: &StepError) {
        tracing::warn!(saga_id = %instance.id, step = %step.name, %error, "step failed");
    }

    fn on_step_compensation_ok(&self, instance: &Instance, step: &StepState) {
        tracing::info!(saga_id = %instance.id, step = %step.name, "step compensated");
    }

    fn on_step_compensation_ko(&self, instance: &Instance, step: &StepState, error: &StepError) {
        tracing::error!(saga_id = %instance.id, step = %step.name, %error, "step compensation failed");
    }
}
