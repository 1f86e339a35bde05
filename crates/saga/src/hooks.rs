//! Lifecycle callbacks.

use saga_store::{Instance, StepState};

use crate::error::{SagaError, StepError};

/// Observer of saga lifecycle events.
///
/// Callbacks run synchronously on the coordinator's task, after the state
/// they describe has been applied. They must not block or panic. Every
/// method has a no-op default so implementors only override what they need.
#[allow(unused_variables)]
pub trait SagaHooks: Send + Sync {
    fn on_saga_started(&self, instance: &Instance) {}

    fn on_saga_completed(&self, instance: &Instance) {}

    /// The step loop gave up; compensation starts next.
    fn on_saga_failed(&self, instance: &Instance, error: &SagaError) {}

    /// Compensation starts walking back from step index `from`.
    fn on_saga_compensating(&self, instance: &Instance, from: usize) {}

    fn on_saga_compensating_finished(&self, instance: &Instance) {}

    fn on_step_start(&self, instance: &Instance, step: &StepState) {}

    fn on_step_success(&self, instance: &Instance, step: &StepState) {}

    /// The step gave up; `error` is the failure of its last attempt.
    fn on_step_failure(&self, instance: &Instance, step: &StepState, error: &StepError) {}

    fn on_step_compensation_ok(&self, instance: &Instance, step: &StepState) {}

    fn on_step_compensation_ko(&self, instance: &Instance, step: &StepState, error: &StepError) {}
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl SagaHooks for NoopHooks {}
