//! Bounded-concurrency retries over a batch of items.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::MultiError;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::RetryError;
use crate::retrier::Retrier;

/// Batch tuning.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchOptions {
    /// Maximum items in flight. Defaults to the host's available parallelism.
    pub concurrency: Option<usize>,
    /// Cancel the whole batch on the first failed item.
    pub fail_fast: bool,
    /// Report every failed item instead of only the first one to fail.
    pub collect_errors: bool,
}

impl BatchOptions {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn fail_fast(mut self) -> Self {
        self.fail_fast = true;
        self
    }

    pub fn collect_errors(mut self) -> Self {
        self.collect_errors = true;
        self
    }
}

/// One item that gave up.
#[derive(Debug, Error)]
#[error("item {index}: {error}")]
pub struct ItemFailure<E> {
    pub index: usize,
    #[source]
    pub error: RetryError<E>,
}

/// A batch that did not fully succeed.
#[derive(Debug, Error)]
#[error("batch failed: {} failed, {} skipped", .failures.len(), .skipped.len())]
pub struct BatchError<E> {
    #[source]
    failures: MultiError<ItemFailure<E>>,
    skipped: Vec<usize>,
}

impl<E> BatchError<E> {
    /// Failed items in index order; only the first one to fail unless
    /// [`BatchOptions::collect_errors`] was set.
    pub fn failures(&self) -> &MultiError<ItemFailure<E>> {
        &self.failures
    }

    /// Items never started because the batch was cancelled first.
    pub fn skipped(&self) -> &[usize] {
        &self.skipped
    }

    pub fn into_failures(self) -> MultiError<ItemFailure<E>> {
        self.failures
    }
}

enum Slot<E> {
    NotStarted,
    Done,
    /// Failure with its position in completion order.
    Failed(usize, RetryError<E>),
}

/// Retries `op` for every item on a pool of at most `concurrency` tasks.
///
/// Each item runs on its own spawned task once a pool permit is free. All
/// items share one cancellation token derived from `cancel`, and, when the
/// retrier has an elapsed-time budget, one deadline: the whole batch gets that
/// budget once, not each item. `op` receives the shared token so long-running
/// work can observe it. Outcomes are recorded by item index.
///
/// A panic inside `op` is resumed on the caller once the remaining tasks have
/// been joined.
pub async fn run_batch<I, T, E, F, Fut>(
    retrier: &Retrier,
    cancel: &CancellationToken,
    items: I,
    op: F,
    options: BatchOptions,
) -> Result<(), BatchError<E>>
where
    I: IntoIterator<Item = T>,
    T: Send + Sync + 'static,
    F: Fn(&T, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: std::error::Error + Send + 'static,
{
    let items: Vec<T> = items.into_iter().collect();
    if items.is_empty() {
        return Ok(());
    }

    let concurrency = options
        .concurrency
        .filter(|c| *c > 0)
        .unwrap_or_else(default_concurrency);
    let shared = cancel.child_token();
    let mut slots: Vec<Slot<E>> = items.iter().map(|_| Slot::NotStarted).collect();

    {
        let pool = drive_pool(
            retrier,
            &shared,
            items,
            Arc::new(op),
            concurrency,
            options.fail_fast,
            &mut slots,
        );
        tokio::pin!(pool);

        match retrier.max_elapsed() {
            Some(budget) => {
                tokio::select! {
                    _ = &mut pool => {}
                    _ = tokio::time::sleep(budget) => {
                        tracing::debug!(budget_ms = u64::try_from(budget.as_millis()).unwrap_or(u64::MAX), "batch budget spent, cancelling");
                        shared.cancel();
                        pool.await;
                    }
                }
            }
            None => pool.await,
        }
    }

    let mut failures = Vec::new();
    let mut skipped = Vec::new();
    for (index, slot) in slots.into_iter().enumerate() {
        match slot {
            Slot::Done => {}
            Slot::NotStarted => skipped.push(index),
            Slot::Failed(order, error) => failures.push((order, ItemFailure { index, error })),
        }
    }
    if !options.collect_errors
        && let Some(first) = failures.iter().map(|(order, _)| *order).min()
    {
        failures.retain(|(order, _)| *order == first);
    }

    if failures.is_empty() && skipped.is_empty() {
        Ok(())
    } else {
        Err(BatchError {
            failures: failures.into_iter().map(|(_, failure)| failure).collect(),
            skipped,
        })
    }
}

/// Dispatches items onto the pool and records each outcome as its task joins.
async fn drive_pool<T, E, F, Fut>(
    retrier: &Retrier,
    shared: &CancellationToken,
    items: Vec<T>,
    op: Arc<F>,
    concurrency: usize,
    fail_fast: bool,
    slots: &mut [Slot<E>],
) where
    T: Send + Sync + 'static,
    F: Fn(&T, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: std::error::Error + Send + 'static,
{
    let permits = Arc::new(Semaphore::new(concurrency.min(Semaphore::MAX_PERMITS)));
    let failed = Arc::new(AtomicUsize::new(0));
    let mut tasks = JoinSet::new();

    for (index, item) in items.into_iter().enumerate() {
        let permit = tokio::select! {
            biased;
            _ = shared.cancelled() => break,
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let retrier = retrier.clone();
        let token = shared.clone();
        let op = Arc::clone(&op);
        let failed = Arc::clone(&failed);
        tasks.spawn(async move {
            let _permit = permit;
            match retrier.run(&token, |_| (*op)(&item, token.clone())).await {
                Ok(()) => (index, Slot::Done),
                Err(err) => {
                    if fail_fast {
                        token.cancel();
                    }
                    (index, Slot::Failed(failed.fetch_add(1, Ordering::SeqCst), err))
                }
            }
        });
    }

    let mut panic = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, slot)) => slots[index] = slot,
            Err(err) if err.is_panic() => {
                shared.cancel();
                panic.get_or_insert(err.into_panic());
            }
            Err(err) => tracing::warn!(error = %err, "batch task did not finish"),
        }
    }
    if let Some(payload) = panic {
        std::panic::resume_unwind(payload);
    }
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}
