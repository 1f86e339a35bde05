//! Static description of a saga: its name and ordered steps.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use retry::RetryOptions;

use crate::error::BoxError;
use crate::execution::Execution;

/// Future returned by step actions and compensations.
pub type StepFuture<'a> = BoxFuture<'a, Result<(), BoxError>>;

type StepCallback = dyn for<'a> Fn(&'a mut Execution) -> StepFuture<'a> + Send + Sync;

/// A step action or compensation.
///
/// The callback borrows the [`Execution`] mutably for one invocation, which
/// lets it read and write the step data without sharing it:
///
/// ```ignore
/// let reserve = StepFn::new(|ex| {
///     Box::pin(async move {
///         ex.set("reservation_id", "RES-0001");
///         Ok(())
///     })
/// });
/// ```
#[derive(Clone)]
pub struct StepFn(Arc<StepCallback>);

impl StepFn {
    pub fn new<F>(f: F) -> Self
    where
        F: for<'a> Fn(&'a mut Execution) -> StepFuture<'a> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub(crate) fn call<'a>(&self, ex: &'a mut Execution) -> StepFuture<'a> {
        (self.0)(ex)
    }
}

impl fmt::Debug for StepFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StepFn")
    }
}

/// Derives an idempotency key for the current attempt.
pub type IdempotencyFn = Arc<dyn Fn(&Execution) -> String + Send + Sync>;

/// One step of a saga.
#[derive(Clone)]
pub struct Step {
    pub name: String,
    pub action: StepFn,
    pub compensate: Option<StepFn>,
    /// Per-attempt deadline for the action.
    pub timeout: Option<Duration>,
    pub idempotency_key: Option<IdempotencyFn>,
    /// Overrides for the coordinator's action retry defaults.
    pub retry: RetryOptions,
    /// Overrides for the coordinator's compensation retry defaults.
    pub compensation_retry: RetryOptions,
}

impl Step {
    /// Creates a step with no compensation.
    pub fn new<F>(name: impl Into<String>, action: F) -> Self
    where
        F: for<'a> Fn(&'a mut Execution) -> StepFuture<'a> + Send + Sync + 'static,
    {
        Self::from_fn(name, StepFn::new(action))
    }

    /// Creates a step from an already built action.
    pub fn from_fn(name: impl Into<String>, action: StepFn) -> Self {
        Self {
            name: name.into(),
            action,
            compensate: None,
            timeout: None,
            idempotency_key: None,
            retry: RetryOptions::default(),
            compensation_retry: RetryOptions::default(),
        }
    }

    pub fn with_compensation<F>(self, compensate: F) -> Self
    where
        F: for<'a> Fn(&'a mut Execution) -> StepFuture<'a> + Send + Sync + 'static,
    {
        self.with_compensation_fn(StepFn::new(compensate))
    }

    pub fn with_compensation_fn(mut self, compensate: StepFn) -> Self {
        self.compensate = Some(compensate);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout).filter(|t| !t.is_zero());
        self
    }

    pub fn with_idempotency_key<F>(mut self, f: F) -> Self
    where
        F: Fn(&Execution) -> String + Send + Sync + 'static,
    {
        self.idempotency_key = Some(Arc::new(f));
        self
    }

    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_compensation_retry(mut self, retry: RetryOptions) -> Self {
        self.compensation_retry = retry;
        self
    }

    /// Returns true if the step can be undone.
    pub fn is_compensable(&self) -> bool {
        self.compensate.is_some()
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("compensable", &self.is_compensable())
            .field("timeout", &self.timeout)
            .field("idempotent", &self.idempotency_key.is_some())
            .field("retry", &self.retry)
            .field("compensation_retry", &self.compensation_retry)
            .finish()
    }
}

/// A named, ordered list of steps.
#[derive(Debug, Clone)]
pub struct Definition {
    pub name: String,
    pub steps: Vec<Step>,
}

impl Definition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Appends a step.
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Step names in execution order.
    pub fn step_names(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|s| s.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Step {
        Step::new("noop", |_ex| Box::pin(async { Ok(()) }))
    }

    #[test]
    fn definition_keeps_step_order() {
        let def = Definition::new("order")
            .step(Step::new("reserve", |_ex| Box::pin(async { Ok(()) })))
            .step(Step::new("charge", |_ex| Box::pin(async { Ok(()) })))
            .step(Step::new("ship", |_ex| Box::pin(async { Ok(()) })));

        assert_eq!(def.len(), 3);
        assert_eq!(def.step_names().collect::<Vec<_>>(), ["reserve", "charge", "ship"]);
    }

    #[test]
    fn zero_timeout_means_none() {
        assert_eq!(noop().with_timeout(Duration::ZERO).timeout, None);
        assert_eq!(
            noop().with_timeout(Duration::from_secs(2)).timeout,
            Some(Duration::from_secs(2))
        );
    }

    #[test]
    fn compensation_is_optional() {
        assert!(!noop().is_compensable());
        let step = noop().with_compensation(|_ex| Box::pin(async { Ok(()) }));
        assert!(step.is_compensable());
    }
}
