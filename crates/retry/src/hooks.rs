//! Observability callbacks for a retry loop.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::DynError;
use crate::error::StopCause;

type AttemptHook = dyn Fn(u32) + Send + Sync;
type RetryHook = dyn Fn(u32, &DynError, Duration) + Send + Sync;
type GiveUpHook = dyn Fn(u32, &DynError, &StopCause) + Send + Sync;

/// Optional callbacks invoked by the retrier on its own task.
///
/// Callbacks must be quick and must not panic.
#[derive(Clone, Default)]
pub struct RetryHooks {
    on_attempt: Option<Arc<AttemptHook>>,
    on_retry: Option<Arc<RetryHook>>,
    on_give_up: Option<Arc<GiveUpHook>>,
}

impl RetryHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called before every attempt with its 0-based index.
    pub fn on_attempt<F>(mut self, f: F) -> Self
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.on_attempt = Some(Arc::new(f));
        self
    }

    /// Called after a retryable failure, with the post-jitter delay about to be waited.
    pub fn on_retry<F>(mut self, f: F) -> Self
    where
        F: Fn(u32, &DynError, Duration) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(f));
        self
    }

    /// Called once when the loop gives up.
    pub fn on_give_up<F>(mut self, f: F) -> Self
    where
        F: Fn(u32, &DynError, &StopCause) + Send + Sync + 'static,
    {
        self.on_give_up = Some(Arc::new(f));
        self
    }

    /// Hooks set on `other` replace the ones set here.
    pub fn merged_with(&self, other: &RetryHooks) -> RetryHooks {
        RetryHooks {
            on_attempt: other.on_attempt.clone().or_else(|| self.on_attempt.clone()),
            on_retry: other.on_retry.clone().or_else(|| self.on_retry.clone()),
            on_give_up: other.on_give_up.clone().or_else(|| self.on_give_up.clone()),
        }
    }

    pub(crate) fn attempt(&self, attempt: u32) {
        if let Some(f) = &self.on_attempt {
            f(attempt);
        }
    }

    pub(crate) fn retry(&self, attempt: u32, err: &DynError, delay: Duration) {
        if let Some(f) = &self.on_retry {
            f(attempt, err, delay);
        }
    }

    pub(crate) fn give_up(&self, attempt: u32, err: &DynError, cause: &StopCause) {
        if let Some(f) = &self.on_give_up {
            f(attempt, err, cause);
        }
    }
}

impl fmt::Debug for RetryHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryHooks")
            .field("on_attempt", &self.on_attempt.is_some())
            .field("on_retry", &self.on_retry.is_some())
            .field("on_give_up", &self.on_give_up.is_some())
            .finish()
    }
}
