//! Failure classification.

use std::fmt;
use std::sync::Arc;

use crate::DynError;

/// Decides whether a failure is worth retrying.
pub trait Classifier: Send + Sync {
    fn is_retryable(&self, err: &DynError) -> bool;
}

/// Retries every failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryAll;

impl Classifier for RetryAll {
    fn is_retryable(&self, _err: &DynError) -> bool {
        true
    }
}

/// Retries only failures matching a predicate.
#[derive(Clone)]
pub struct RetryOn {
    predicate: Arc<dyn Fn(&DynError) -> bool + Send + Sync>,
}

impl RetryOn {
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&DynError) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Arc::new(predicate),
        }
    }

    /// Retries failures whose source chain contains a `T`.
    pub fn error_type<T>() -> Self
    where
        T: std::error::Error + 'static,
    {
        Self::new(|err| {
            let mut current: Option<&DynError> = Some(err);
            while let Some(e) = current {
                if e.is::<T>() {
                    return true;
                }
                current = e.source();
            }
            false
        })
    }
}

impl fmt::Debug for RetryOn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOn").finish_non_exhaustive()
    }
}

impl Classifier for RetryOn {
    fn is_retryable(&self, err: &DynError) -> bool {
        (self.predicate)(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("timeout")]
    struct Timeout;

    #[derive(Debug, thiserror::Error)]
    #[error("bad request")]
    struct BadRequest;

    #[derive(Debug, thiserror::Error)]
    #[error("wrapped")]
    struct Wrapped(#[source] Timeout);

    #[test]
    fn retry_all_accepts_everything() {
        assert!(RetryAll.is_retryable(&Timeout));
        assert!(RetryAll.is_retryable(&BadRequest));
    }

    #[test]
    fn predicate_decides() {
        let c = RetryOn::new(|e| e.to_string() == "timeout");
        assert!(c.is_retryable(&Timeout));
        assert!(!c.is_retryable(&BadRequest));
    }

    #[test]
    fn error_type_walks_source_chain() {
        let c = RetryOn::error_type::<Timeout>();
        assert!(c.is_retryable(&Wrapped(Timeout)));
        assert!(!c.is_retryable(&BadRequest));
    }
}
