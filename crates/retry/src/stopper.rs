//! External stop signals consulted after every retryable failure.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::DynError;
use crate::error::StopCause;

/// Halts a retry loop regardless of how the failure was classified.
///
/// Consulted after classification and before the attempt and time budget
/// checks, so a stop signal always wins over remaining budget.
pub trait Stopper: Send + Sync {
    /// Returns `Some(cause)` to stop retrying now.
    fn should_stop(&self, attempt: u32, last_error: &DynError, elapsed: Duration) -> Option<StopCause>;
}

/// Adapts a closure into a [`Stopper`].
pub struct StopperFn<F>(F);

impl<F> Stopper for StopperFn<F>
where
    F: Fn(u32, &DynError, Duration) -> Option<StopCause> + Send + Sync,
{
    fn should_stop(&self, attempt: u32, last_error: &DynError, elapsed: Duration) -> Option<StopCause> {
        (self.0)(attempt, last_error, elapsed)
    }
}

impl<F> fmt::Debug for StopperFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopperFn").finish_non_exhaustive()
    }
}

/// Builds a stopper from a closure.
pub fn stop_when<F>(f: F) -> StopperFn<F>
where
    F: Fn(u32, &DynError, Duration) -> Option<StopCause> + Send + Sync,
{
    StopperFn(f)
}

/// Several stoppers consulted in order; the first to signal wins.
#[derive(Clone, Default)]
pub struct CombinedStopper {
    stoppers: Vec<Arc<dyn Stopper>>,
}

impl CombinedStopper {
    pub fn push(mut self, stopper: Arc<dyn Stopper>) -> Self {
        self.stoppers.push(stopper);
        self
    }

    pub fn len(&self) -> usize {
        self.stoppers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stoppers.is_empty()
    }
}

impl fmt::Debug for CombinedStopper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CombinedStopper")
            .field("stoppers", &self.stoppers.len())
            .finish()
    }
}

impl Stopper for CombinedStopper {
    fn should_stop(&self, attempt: u32, last_error: &DynError, elapsed: Duration) -> Option<StopCause> {
        self.stoppers
            .iter()
            .find_map(|s| s.should_stop(attempt, last_error, elapsed))
    }
}

/// Combines stoppers; the first one to signal stop provides the cause.
pub fn combine(stoppers: Vec<Arc<dyn Stopper>>) -> CombinedStopper {
    CombinedStopper { stoppers }
}
