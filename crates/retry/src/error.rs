//! Retry error types.

use std::sync::Arc;

use thiserror::Error;

/// Why a retry loop stopped without success.
#[derive(Debug, Clone, Error)]
pub enum StopCause {
    /// The classifier rejected the failure.
    #[error("non-retryable")]
    NonRetryable,

    /// The attempt count or elapsed-time budget was used up.
    #[error("retry budget exhausted")]
    Exhausted,

    /// The caller's cancellation signal fired.
    #[error("cancelled")]
    Cancelled,

    /// A token-bucket stopper ran out of tokens.
    #[error("backpressure: token bucket empty")]
    Backpressure,

    /// A user-supplied stopper halted the loop.
    #[error("stopped: {0}")]
    External(Arc<dyn std::error::Error + Send + Sync>),
}

impl StopCause {
    /// Wraps an arbitrary error as an external stop cause.
    pub fn external<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::External(Arc::new(err))
    }

    /// Short label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            StopCause::NonRetryable => "non_retryable",
            StopCause::Exhausted => "exhausted",
            StopCause::Cancelled => "cancelled",
            StopCause::Backpressure => "backpressure",
            StopCause::External(_) => "external",
        }
    }
}

/// Structured failure returned when a retry loop gives up.
///
/// Carries the last failure returned by the operation, the reason the loop
/// stopped and the 0-based index of the last attempt executed.
#[derive(Debug, Error)]
#[error("retry stopped: cause={cause} attempts={} last_error={last_error}", .last_attempt + 1)]
pub struct RetryError<E> {
    #[source]
    last_error: E,
    cause: StopCause,
    last_attempt: u32,
}

impl<E> RetryError<E> {
    pub(crate) fn new(last_error: E, cause: StopCause, last_attempt: u32) -> Self {
        Self {
            last_error,
            cause,
            last_attempt,
        }
    }

    /// Why the loop stopped.
    pub fn cause(&self) -> &StopCause {
        &self.cause
    }

    /// The failure returned by the last attempt.
    pub fn last_error(&self) -> &E {
        &self.last_error
    }

    /// Consumes the error, returning the last operation failure.
    pub fn into_last_error(self) -> E {
        self.last_error
    }

    /// 0-based index of the last attempt executed.
    pub fn last_attempt(&self) -> u32 {
        self.last_attempt
    }

    /// Number of attempts executed.
    pub fn attempts(&self) -> u32 {
        self.last_attempt + 1
    }

    /// Returns true if the loop gave up because the classifier rejected the failure.
    pub fn is_non_retryable(&self) -> bool {
        matches!(self.cause, StopCause::NonRetryable)
    }

    /// Returns true if the loop gave up because its budget ran out.
    pub fn is_exhausted(&self) -> bool {
        matches!(self.cause, StopCause::Exhausted)
    }

    /// Returns true if the loop was interrupted by cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.cause, StopCause::Cancelled)
    }
}
