//! Composable retry with backoff and jitter.
//!
//! A [`Retrier`] drives one retry loop and is assembled from narrow, pluggable
//! capabilities:
//!
//! - [`Strategy`] computes the nominal delay before the next attempt
//!   ([`ConstantStrategy`], [`ExponentialStrategy`], [`HintedStrategy`]).
//! - [`Jitter`] perturbs that delay ([`NoJitter`], [`FullJitter`],
//!   [`EqualJitter`], [`DecorrelatedJitter`]).
//! - [`Classifier`] decides whether a failure is retryable at all.
//! - [`Stopper`] lets an external signal (rate limiter, circuit breaker,
//!   [`TokenBucketStopper`]) halt retries regardless of classification.
//! - [`Sleeper`] abstracts waiting and "now" so tests can use a virtual clock.
//!
//! On top of the retrier sit [`Idempotent`] (deduplicated execution through a
//! [`DedupeStore`]) and [`run_batch`] (bounded-concurrency retries sharing one
//! time budget).

pub mod batch;
pub mod classifier;
pub mod dedupe_memory;
pub mod error;
pub mod hint;
pub mod hooks;
pub mod idempotency;
pub mod jitter;
pub mod retrier;
pub mod sleeper;
pub mod stopper;
pub mod strategy;
pub mod token_bucket;

pub use batch::{BatchError, BatchOptions, ItemFailure, run_batch};
pub use classifier::{Classifier, RetryAll, RetryOn};
pub use dedupe_memory::InMemoryDedupeStore;
pub use error::{RetryError, StopCause};
pub use hint::{HttpError, RetryAfter, RetryAfterHint, extract_retry_after, parse_retry_after};
pub use hooks::RetryHooks;
pub use idempotency::{DedupeError, DedupeStore, IdempotencyError, Idempotent};
pub use jitter::{DecorrelatedJitter, EqualJitter, FullJitter, Jitter, NoJitter};
pub use retrier::{Retrier, RetryOptions};
pub use sleeper::{Interrupted, ManualSleeper, Sleeper, TokioSleeper};
pub use stopper::{CombinedStopper, Stopper, StopperFn, combine, stop_when};
pub use strategy::{ConstantStrategy, ExponentialStrategy, HintedStrategy, Strategy};
pub use token_bucket::TokenBucketStopper;

/// Error trait object handed to classifiers, stoppers and strategies.
pub type DynError = dyn std::error::Error + 'static;

pub use tokio_util::sync::CancellationToken;
