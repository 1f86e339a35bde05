//! Builds the retrier used for each step action and compensation.

use std::time::Duration;

use retry::{ExponentialStrategy, FullJitter, Retrier, RetryOptions};

use crate::definition::Step;

/// Builds a [`Retrier`] for a step.
pub trait RetryFactory: Send + Sync {
    fn build(&self, step: &Step) -> Retrier;
}

impl<F> RetryFactory for F
where
    F: Fn(&Step) -> Retrier + Send + Sync,
{
    fn build(&self, step: &Step) -> Retrier {
        self(step)
    }
}

/// Default factory for step actions.
///
/// Exponential backoff from 1s doubling up to 30s with full jitter and no
/// attempt cap. The step's own [`Step::retry`] options override these field
/// by field.
#[derive(Debug, Clone)]
pub struct StepRetryFactory {
    defaults: RetryOptions,
}

impl StepRetryFactory {
    pub fn new() -> Self {
        Self {
            defaults: RetryOptions::new()
                .with_strategy(ExponentialStrategy::new(
                    Duration::from_secs(1),
                    2.0,
                    Duration::from_secs(30),
                ))
                .with_jitter(FullJitter)
                .with_max_attempts(0),
        }
    }

    /// Replaces individual defaults, keeping the rest.
    pub fn with_defaults(overrides: RetryOptions) -> Self {
        let base = Self::new();
        Self {
            defaults: base.defaults.overridden_by(&overrides),
        }
    }

    pub fn defaults(&self) -> &RetryOptions {
        &self.defaults
    }
}

impl Default for StepRetryFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryFactory for StepRetryFactory {
    fn build(&self, step: &Step) -> Retrier {
        Retrier::new(self.defaults.overridden_by(&step.retry))
    }
}

/// Default factory for compensations.
///
/// Exponential backoff from 500ms doubling up to 10s with full jitter and at
/// most 5 attempts, overridden field by field by [`Step::compensation_retry`].
#[derive(Debug, Clone)]
pub struct CompensationRetryFactory {
    defaults: RetryOptions,
}

impl CompensationRetryFactory {
    pub fn new() -> Self {
        Self {
            defaults: RetryOptions::new()
                .with_strategy(ExponentialStrategy::new(
                    Duration::from_millis(500),
                    2.0,
                    Duration::from_secs(10),
                ))
                .with_jitter(FullJitter)
                .with_max_attempts(5),
        }
    }

    pub fn with_defaults(overrides: RetryOptions) -> Self {
        let base = Self::new();
        Self {
            defaults: base.defaults.overridden_by(&overrides),
        }
    }

    pub fn defaults(&self) -> &RetryOptions {
        &self.defaults
    }
}

impl Default for CompensationRetryFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryFactory for CompensationRetryFactory {
    fn build(&self, step: &Step) -> Retrier {
        Retrier::new(self.defaults.overridden_by(&step.compensation_retry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step() -> Step {
        Step::new("charge", |_ex| Box::pin(async { Ok(()) }))
    }

    #[test]
    fn action_defaults_are_unbounded() {
        let retrier = StepRetryFactory::new().build(&step());
        assert_eq!(retrier.max_attempts(), None);
        assert_eq!(retrier.max_elapsed(), None);
    }

    #[test]
    fn compensation_defaults_cap_attempts() {
        let retrier = CompensationRetryFactory::new().build(&step());
        assert_eq!(retrier.max_attempts(), Some(5));
    }

    #[test]
    fn step_options_override_defaults() {
        let step = step()
            .with_retry(RetryOptions::new().with_max_attempts(3))
            .with_compensation_retry(RetryOptions::new().with_max_elapsed(Duration::from_secs(2)));

        assert_eq!(StepRetryFactory::new().build(&step).max_attempts(), Some(3));

        let comp = CompensationRetryFactory::new().build(&step);
        assert_eq!(comp.max_attempts(), Some(5));
        assert_eq!(comp.max_elapsed(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn with_defaults_keeps_unset_fields() {
        let factory = CompensationRetryFactory::with_defaults(RetryOptions::new().with_max_attempts(2));
        assert_eq!(factory.defaults().max_attempts, Some(2));
        assert!(factory.defaults().strategy.is_some());
    }

    #[test]
    fn closures_are_factories() {
        let factory = |_step: &Step| Retrier::new(RetryOptions::new().with_max_attempts(1));
        assert_eq!(factory.build(&step()).max_attempts(), Some(1));
    }
}
