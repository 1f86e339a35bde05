//! Deduplicated execution of side-effecting operations.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use thiserror::Error;

/// Failure of the dedupe backend itself.
#[derive(Debug, Clone, Error)]
pub enum DedupeError {
    #[error("dedupe store unavailable: {0}")]
    Unavailable(String),
}

/// Reserves idempotency tokens across workers.
///
/// Typical backends: a key-value store with set-if-absent and expiry, or a
/// table with a unique key.
#[async_trait]
pub trait DedupeStore: Send + Sync {
    /// Reserves `token` for `ttl`. `false` means the work was already done
    /// (or is being done) under this token.
    async fn begin(&self, token: &str, ttl: Duration) -> Result<bool, DedupeError>;

    /// Marks the work as done.
    async fn commit(&self, token: &str) -> Result<(), DedupeError>;

    /// Releases the reservation so a later attempt may proceed.
    async fn rollback(&self, token: &str) -> Result<(), DedupeError>;
}

/// Failure of an idempotent run.
#[derive(Debug, Error)]
pub enum IdempotencyError<E> {
    /// The token could not be reserved.
    #[error("idempotency begin: {0}")]
    Begin(#[source] DedupeError),
    /// The operation succeeded but completion could not be recorded.
    #[error("idempotency commit: {0}")]
    Commit(#[source] DedupeError),
    /// The operation itself failed; the reservation was rolled back.
    #[error("{0}")]
    Operation(#[source] E),
}

impl<E> IdempotencyError<E> {
    /// Returns the operation failure, if that is what this is.
    pub fn into_operation(self) -> Option<E> {
        match self {
            IdempotencyError::Operation(e) => Some(e),
            _ => None,
        }
    }
}

/// Wraps operations so that re-running them under the same token is a no-op.
///
/// ```ignore
/// let idem = Idempotent::new(store, "charge:order-42", Duration::from_secs(600));
/// let charged = retrier
///     .run(&cancel, |_| idem.run(|token| payments.charge(order, token)))
///     .await?;
/// ```
#[derive(Clone)]
pub struct Idempotent {
    store: Arc<dyn DedupeStore>,
    token: String,
    ttl: Duration,
}

impl Idempotent {
    /// An empty `token` disables deduplication.
    pub fn new(store: Arc<dyn DedupeStore>, token: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            token: token.into(),
            ttl,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Runs `op` unless the token was already consumed.
    ///
    /// Returns `Ok(None)` when the work was skipped. A failed or panicking
    /// operation rolls the reservation back before the failure propagates.
    pub async fn run<T, E, F, Fut>(&self, op: F) -> Result<Option<T>, IdempotencyError<E>>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if self.token.is_empty() {
            return op(String::new())
                .await
                .map(Some)
                .map_err(IdempotencyError::Operation);
        }

        let proceed = self
            .store
            .begin(&self.token, self.ttl)
            .await
            .map_err(IdempotencyError::Begin)?;
        if !proceed {
            tracing::debug!(token = %self.token, "operation already done, skipping");
            return Ok(None);
        }

        match AssertUnwindSafe(op(self.token.clone())).catch_unwind().await {
            Ok(Ok(value)) => {
                self.store
                    .commit(&self.token)
                    .await
                    .map_err(IdempotencyError::Commit)?;
                Ok(Some(value))
            }
            Ok(Err(err)) => {
                self.release().await;
                Err(IdempotencyError::Operation(err))
            }
            Err(panic) => {
                self.release().await;
                std::panic::resume_unwind(panic)
            }
        }
    }

    /// Unit variant of [`run`](Self::run); a skipped run counts as success.
    pub async fn execute<E, F, Fut>(&self, op: F) -> Result<(), IdempotencyError<E>>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        self.run(op).await.map(|_| ())
    }

    async fn release(&self) {
        if let Err(err) = self.store.rollback(&self.token).await {
            tracing::warn!(token = %self.token, error = %err, "idempotency rollback failed");
        }
    }
}

impl std::fmt::Debug for Idempotent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Idempotent")
            .field("token", &self.token)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}
