//! The retry loop.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::DynError;
use crate::classifier::{Classifier, RetryAll};
use crate::error::{RetryError, StopCause};
use crate::hooks::RetryHooks;
use crate::jitter::{FullJitter, Jitter};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::stopper::Stopper;
use crate::strategy::{ExponentialStrategy, Strategy};

/// Retrier configuration.
///
/// Every field is optional; unset fields fall back to the defaults applied by
/// [`Retrier::new`]: exponential backoff (50ms, x2, 30s cap), full jitter,
/// retry every failure, no stopper, unlimited attempts, no elapsed-time
/// budget, tokio sleeper, no hooks.
#[derive(Clone, Default)]
pub struct RetryOptions {
    pub strategy: Option<Arc<dyn Strategy>>,
    pub jitter: Option<Arc<dyn Jitter>>,
    pub classifier: Option<Arc<dyn Classifier>>,
    pub stopper: Option<Arc<dyn Stopper>>,
    /// Total attempts including the first one. `0` means unlimited.
    pub max_attempts: Option<u32>,
    /// Wall-clock budget across all attempts and waits. Zero means unlimited.
    pub max_elapsed: Option<Duration>,
    pub sleeper: Option<Arc<dyn Sleeper>>,
    pub hooks: Option<RetryHooks>,
}

impl RetryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_strategy(mut self, strategy: impl Strategy + 'static) -> Self {
        self.strategy = Some(Arc::new(strategy));
        self
    }

    pub fn with_jitter(mut self, jitter: impl Jitter + 'static) -> Self {
        self.jitter = Some(Arc::new(jitter));
        self
    }

    pub fn with_classifier(mut self, classifier: impl Classifier + 'static) -> Self {
        self.classifier = Some(Arc::new(classifier));
        self
    }

    /// Stoppers are usually shared (a token bucket fed by a monitor), hence the `Arc`.
    pub fn with_stopper(mut self, stopper: Arc<dyn Stopper>) -> Self {
        self.stopper = Some(stopper);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed = Some(max_elapsed);
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = Some(sleeper);
        self
    }

    pub fn with_hooks(mut self, hooks: RetryHooks) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Field-by-field merge: anything set on `overrides` wins.
    pub fn overridden_by(&self, overrides: &RetryOptions) -> RetryOptions {
        RetryOptions {
            strategy: overrides.strategy.clone().or_else(|| self.strategy.clone()),
            jitter: overrides.jitter.clone().or_else(|| self.jitter.clone()),
            classifier: overrides.classifier.clone().or_else(|| self.classifier.clone()),
            stopper: overrides.stopper.clone().or_else(|| self.stopper.clone()),
            max_attempts: overrides.max_attempts.or(self.max_attempts),
            max_elapsed: overrides.max_elapsed.or(self.max_elapsed),
            sleeper: overrides.sleeper.clone().or_else(|| self.sleeper.clone()),
            hooks: match (&self.hooks, &overrides.hooks) {
                (Some(base), Some(over)) => Some(base.merged_with(over)),
                (base, over) => over.clone().or_else(|| base.clone()),
            },
        }
    }
}

impl fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("strategy", &self.strategy.is_some())
            .field("jitter", &self.jitter.is_some())
            .field("classifier", &self.classifier.is_some())
            .field("stopper", &self.stopper.is_some())
            .field("max_attempts", &self.max_attempts)
            .field("max_elapsed", &self.max_elapsed)
            .field("sleeper", &self.sleeper.is_some())
            .field("hooks", &self.hooks)
            .finish()
    }
}

/// Runs an operation until it succeeds or a stop condition is met.
///
/// Immutable once built and cheap to clone; one retrier can drive any number
/// of concurrent loops. Per attempt the loop, in order:
///
/// 1. fires `on_attempt` and runs the operation; success returns at once,
/// 2. gives up if the classifier rejects the failure,
/// 3. gives up if the cancellation token has fired,
/// 4. gives up if the stopper signals,
/// 5. gives up if the attempt budget or the elapsed-time budget is spent,
/// 6. computes `jitter(strategy(attempt))`, clamped to the remaining budget,
/// 7. fires `on_retry` and waits, giving up if the wait is cancelled.
#[derive(Clone)]
pub struct Retrier {
    strategy: Arc<dyn Strategy>,
    jitter: Arc<dyn Jitter>,
    classifier: Arc<dyn Classifier>,
    stopper: Option<Arc<dyn Stopper>>,
    max_attempts: u32,
    max_elapsed: Option<Duration>,
    sleeper: Arc<dyn Sleeper>,
    hooks: RetryHooks,
}

impl Retrier {
    pub fn new(options: RetryOptions) -> Self {
        Self {
            strategy: options
                .strategy
                .unwrap_or_else(|| Arc::new(ExponentialStrategy::default())),
            jitter: options.jitter.unwrap_or_else(|| Arc::new(FullJitter)),
            classifier: options.classifier.unwrap_or_else(|| Arc::new(RetryAll)),
            stopper: options.stopper,
            max_attempts: options.max_attempts.unwrap_or(0),
            max_elapsed: options.max_elapsed.filter(|d| !d.is_zero()),
            sleeper: options.sleeper.unwrap_or_else(|| Arc::new(TokioSleeper)),
            hooks: options.hooks.unwrap_or_default(),
        }
    }

    /// The elapsed-time budget, if any.
    pub fn max_elapsed(&self) -> Option<Duration> {
        self.max_elapsed
    }

    /// The attempt budget, if any.
    pub fn max_attempts(&self) -> Option<u32> {
        (self.max_attempts > 0).then_some(self.max_attempts)
    }

    pub fn sleeper(&self) -> &Arc<dyn Sleeper> {
        &self.sleeper
    }

    /// Runs `op` until it succeeds, threading its value out.
    ///
    /// `op` receives the 0-based attempt index. On give-up the returned
    /// [`RetryError`] carries the last failure, the stop cause and the index of
    /// the last attempt executed.
    pub async fn run<T, E, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        let start = self.sleeper.now();
        self.strategy.reset();

        let mut attempt: u32 = 0;
        loop {
            self.hooks.attempt(attempt);
            metrics::counter!("retry_attempts_total").increment(1);

            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if let Some(cause) = self.stop_cause(attempt, &err, cancel, start) {
                return Err(self.give_up(err, cause, attempt));
            }

            let Some(delay) = self.next_delay(attempt, &err, start) else {
                return Err(self.give_up(err, StopCause::Exhausted, attempt));
            };

            self.hooks.retry(attempt, &err, delay);
            tracing::debug!(
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "retrying after failure"
            );

            if !delay.is_zero() && self.sleeper.sleep(delay, cancel).await.is_err() {
                return Err(self.give_up(err, StopCause::Cancelled, attempt));
            }

            attempt = attempt.saturating_add(1);
        }
    }

    fn stop_cause(
        &self,
        attempt: u32,
        err: &DynError,
        cancel: &CancellationToken,
        start: Instant,
    ) -> Option<StopCause> {
        if !self.classifier.is_retryable(err) {
            return Some(StopCause::NonRetryable);
        }
        if cancel.is_cancelled() {
            return Some(StopCause::Cancelled);
        }
        if let Some(stopper) = &self.stopper
            && let Some(cause) = stopper.should_stop(attempt, err, self.elapsed_since(start))
        {
            return Some(cause);
        }
        if self.max_attempts > 0 && attempt.saturating_add(1) >= self.max_attempts {
            return Some(StopCause::Exhausted);
        }
        if let Some(max) = self.max_elapsed
            && self.elapsed_since(start) >= max
        {
            return Some(StopCause::Exhausted);
        }
        None
    }

    /// `None` when no time budget remains.
    fn next_delay(&self, attempt: u32, err: &DynError, start: Instant) -> Option<Duration> {
        let delay = self.jitter.apply(self.strategy.next_delay(attempt, err));
        match self.max_elapsed {
            None => Some(delay),
            Some(max) => {
                let remaining = max.checked_sub(self.elapsed_since(start))?;
                if remaining.is_zero() {
                    return None;
                }
                Some(delay.min(remaining))
            }
        }
    }

    fn elapsed_since(&self, start: Instant) -> Duration {
        self.sleeper.now().saturating_duration_since(start)
    }

    fn give_up<E>(&self, err: E, cause: StopCause, attempt: u32) -> RetryError<E>
    where
        E: std::error::Error + 'static,
    {
        self.hooks.give_up(attempt, &err, &cause);
        metrics::counter!("retry_give_ups_total", "cause" => cause.as_str()).increment(1);
        tracing::debug!(attempts = attempt + 1, %cause, error = %err, "giving up");
        RetryError::new(err, cause, attempt)
    }
}

impl Default for Retrier {
    fn default() -> Self {
        Self::new(RetryOptions::default())
    }
}

impl fmt::Debug for Retrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retrier")
            .field("max_attempts", &self.max_attempts)
            .field("max_elapsed", &self.max_elapsed)
            .field("stopper", &self.stopper.is_some())
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}
