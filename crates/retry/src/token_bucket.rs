//! Token-bucket backpressure stopper.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{Clock, SystemClock};

use crate::DynError;
use crate::error::StopCause;
use crate::stopper::Stopper;

#[derive(Debug)]
struct Bucket {
    capacity: f64,
    refill_rate: f64,
    tokens: f64,
    last: DateTime<Utc>,
    consume_per_failure: bool,
}

impl Bucket {
    fn refill(&mut self, now: DateTime<Utc>) {
        let dt = (now - self.last).to_std().map_or(0.0, |d| d.as_secs_f64());
        if dt > 0.0 && self.refill_rate > 0.0 {
            self.tokens = (self.tokens + dt * self.refill_rate).min(self.capacity);
        }
        self.last = now;
    }
}

/// Halts retries while a shared token bucket is empty.
///
/// Tokens refill lazily at `refill_rate` per second whenever the bucket is
/// touched; there is no background task. External controllers (an SLO
/// monitor, a health probe) drain or replenish the bucket out-of-band with
/// [`consume`](Self::consume) and [`add_tokens`](Self::add_tokens).
///
/// Safe to share between retriers behind an `Arc`.
pub struct TokenBucketStopper {
    bucket: Mutex<Bucket>,
    min_delay: Duration,
    clock: Arc<dyn Clock>,
}

impl TokenBucketStopper {
    /// Creates a bucket.
    ///
    /// A non-positive `capacity` becomes 1 and a negative `refill_rate`
    /// becomes 0. `min_delay` is advisory only; read it back to align a
    /// strategy's cap with the refill pace.
    pub fn new(capacity: f64, refill_rate: f64, start_full: bool, min_delay: Duration) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let capacity = sanitize_capacity(capacity);
        Self {
            bucket: Mutex::new(Bucket {
                capacity,
                refill_rate: sanitize_rate(refill_rate),
                tokens: if start_full { capacity } else { 0.0 },
                last: clock.now(),
                consume_per_failure: false,
            }),
            min_delay,
            clock,
        }
    }

    /// Replaces the clock used for refills.
    pub fn with_clock(self, clock: Arc<dyn Clock>) -> Self {
        {
            let mut bucket = self.lock();
            bucket.refill(self.clock.now());
            bucket.last = clock.now();
        }
        Self { clock, ..self }
    }

    /// Burns one token per failure inspected by [`Stopper::should_stop`].
    pub fn with_consume_per_failure(self, on: bool) -> Self {
        self.set_consume_per_failure(on);
        self
    }

    pub fn set_consume_per_failure(&self, on: bool) {
        self.lock().consume_per_failure = on;
    }

    /// Changes capacity and refill rate, refilling at the old rate first.
    pub fn reconfigure(&self, capacity: f64, refill_rate: f64) {
        let now = self.clock.now();
        let mut bucket = self.lock();
        bucket.refill(now);
        bucket.capacity = sanitize_capacity(capacity);
        bucket.tokens = bucket.tokens.min(bucket.capacity);
        bucket.refill_rate = sanitize_rate(refill_rate);
    }

    /// Burns `n` tokens immediately. Non-positive `n` is ignored.
    pub fn consume(&self, n: f64) {
        if n.is_nan() || n <= 0.0 {
            return;
        }
        let now = self.clock.now();
        let mut bucket = self.lock();
        bucket.refill(now);
        bucket.tokens = (bucket.tokens - n).max(0.0);
    }

    /// Adds up to `n` tokens, bounded by capacity. Non-positive `n` is ignored.
    pub fn add_tokens(&self, n: f64) {
        if n.is_nan() || n <= 0.0 {
            return;
        }
        let now = self.clock.now();
        let mut bucket = self.lock();
        bucket.refill(now);
        bucket.tokens = (bucket.tokens + n).min(bucket.capacity);
    }

    /// Tokens currently available, after a lazy refill.
    pub fn tokens(&self) -> f64 {
        let now = self.clock.now();
        let mut bucket = self.lock();
        bucket.refill(now);
        bucket.tokens
    }

    pub fn min_delay(&self) -> Duration {
        self.min_delay
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Bucket> {
        self.bucket.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for TokenBucketStopper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucketStopper")
            .field("bucket", &*self.lock())
            .field("min_delay", &self.min_delay)
            .finish_non_exhaustive()
    }
}

impl Stopper for TokenBucketStopper {
    fn should_stop(&self, _attempt: u32, _last_error: &DynError, _elapsed: Duration) -> Option<StopCause> {
        let now = self.clock.now();
        let mut bucket = self.lock();
        bucket.refill(now);

        if bucket.consume_per_failure && bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
        }

        (bucket.tokens < 1.0).then_some(StopCause::Backpressure)
    }
}

fn sanitize_capacity(capacity: f64) -> f64 {
    if capacity.is_nan() || capacity <= 0.0 { 1.0 } else { capacity }
}

fn sanitize_rate(rate: f64) -> f64 {
    if rate.is_nan() || rate < 0.0 { 0.0 } else { rate }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use common::FixedClock;

    #[derive(Debug, thiserror::Error)]
    #[error("fail")]
    struct Fail;

    fn clock() -> Arc<FixedClock> {
        Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        ))
    }

    fn stops(tb: &TokenBucketStopper) -> bool {
        tb.should_stop(0, &Fail, Duration::ZERO).is_some()
    }

    #[test]
    fn config_is_sanitized() {
        let tb = TokenBucketStopper::new(0.0, -3.0, true, Duration::ZERO);
        assert_eq!(tb.tokens(), 1.0);
        tb.consume(1.0);
        assert!(stops(&tb));
    }

    #[test]
    fn empty_bucket_stops_until_tokens_are_added() {
        let clock = clock();
        let tb = TokenBucketStopper::new(3.0, 0.0, true, Duration::ZERO).with_clock(clock.clone());

        assert!(!stops(&tb));
        tb.consume(3.0);
        assert!(matches!(
            tb.should_stop(0, &Fail, Duration::ZERO),
            Some(StopCause::Backpressure)
        ));

        clock.advance(chrono::Duration::hours(1));
        assert!(stops(&tb), "zero refill rate never refills");

        tb.add_tokens(1.0);
        assert!(!stops(&tb));
    }

    #[test]
    fn refills_lazily_over_time() {
        let clock = clock();
        let tb = TokenBucketStopper::new(2.0, 0.5, false, Duration::ZERO).with_clock(clock.clone());
        assert!(stops(&tb));

        clock.advance(chrono::Duration::seconds(1));
        assert!(stops(&tb), "half a token is not enough");

        clock.advance(chrono::Duration::seconds(1));
        assert!(!stops(&tb));

        clock.advance(chrono::Duration::seconds(60));
        assert_eq!(tb.tokens(), 2.0);
    }

    #[test]
    fn consume_per_failure_drains_bucket() {
        let clock = clock();
        let tb = TokenBucketStopper::new(2.0, 0.0, true, Duration::ZERO)
            .with_clock(clock)
            .with_consume_per_failure(true);

        assert!(!stops(&tb));
        assert!(stops(&tb));
        assert!(stops(&tb));
        assert_eq!(tb.tokens(), 0.0);
    }

    #[test]
    fn add_tokens_is_capped_and_consume_floors_at_zero() {
        let tb = TokenBucketStopper::new(2.0, 0.0, false, Duration::ZERO).with_clock(clock());
        tb.add_tokens(10.0);
        assert_eq!(tb.tokens(), 2.0);
        tb.consume(10.0);
        assert_eq!(tb.tokens(), 0.0);
        tb.add_tokens(-1.0);
        assert_eq!(tb.tokens(), 0.0);
    }

    #[test]
    fn reconfigure_trims_tokens_to_new_capacity() {
        let tb = TokenBucketStopper::new(10.0, 0.0, true, Duration::from_millis(200)).with_clock(clock());
        tb.reconfigure(4.0, 1.0);
        assert_eq!(tb.tokens(), 4.0);
        assert_eq!(tb.min_delay(), Duration::from_millis(200));
    }
}
