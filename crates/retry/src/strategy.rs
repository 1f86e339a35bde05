//! Backoff strategies.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::DynError;
use crate::hint::extract_retry_after;

/// Computes the nominal delay before the next attempt.
///
/// `attempt` is the 0-based index of the attempt that just failed and
/// `previous` is its failure. A zero delay means "retry immediately".
pub trait Strategy: Send + Sync {
    /// Delay to wait before attempt `attempt + 1`.
    fn next_delay(&self, attempt: u32, previous: &DynError) -> Duration;

    /// Clears internal state. Called once at the start of every retry loop.
    fn reset(&self) {}
}

/// Waits the same delay between every attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstantStrategy {
    pub delay: Duration,
}

impl ConstantStrategy {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Strategy for ConstantStrategy {
    fn next_delay(&self, _attempt: u32, _previous: &DynError) -> Duration {
        self.delay
    }
}

/// Grows the delay as `min(cap, base * factor^attempt)`.
///
/// A zero `cap` means uncapped. A `factor` below 1.0 is a configuration
/// error and is treated as a constant `base` delay so the wait never shrinks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialStrategy {
    pub base: Duration,
    pub factor: f64,
    pub cap: Duration,
}

impl ExponentialStrategy {
    pub fn new(base: Duration, factor: f64, cap: Duration) -> Self {
        Self { base, factor, cap }
    }

    fn clamp(&self, delay: Duration) -> Duration {
        if self.cap.is_zero() {
            delay
        } else {
            delay.min(self.cap)
        }
    }

    /// The largest delay this strategy can produce.
    fn ceiling(&self) -> Duration {
        if self.cap.is_zero() {
            Duration::MAX
        } else {
            self.cap
        }
    }
}

impl Default for ExponentialStrategy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(50),
            factor: 2.0,
            cap: Duration::from_secs(30),
        }
    }
}

impl Strategy for ExponentialStrategy {
    fn next_delay(&self, attempt: u32, _previous: &DynError) -> Duration {
        if attempt == 0 || self.base.is_zero() {
            return self.clamp(self.base);
        }
        if self.factor.is_nan() || self.factor < 1.0 {
            return self.clamp(self.base);
        }

        let secs = self.base.as_secs_f64() * self.factor.powf(f64::from(attempt));
        if !secs.is_finite() || secs >= self.ceiling().as_secs_f64() {
            return self.ceiling();
        }
        Duration::try_from_secs_f64(secs).map_or(self.ceiling(), |d| self.clamp(d))
    }
}

type Extractor = dyn Fn(&DynError) -> Option<Duration> + Send + Sync;
type Combiner = dyn Fn(Duration, Duration) -> Duration + Send + Sync;

/// Decorates a strategy with server-provided "retry after" hints.
///
/// When the previous failure carries a hint, the delay becomes
/// `combine(base_delay, hint)` (by default the larger of the two), then is
/// clamped to the optional cap.
#[derive(Clone)]
pub struct HintedStrategy {
    base: Arc<dyn Strategy>,
    cap: Option<Duration>,
    extract: Option<Arc<Extractor>>,
    combine: Option<Arc<Combiner>>,
}

impl HintedStrategy {
    /// Wraps `base`, honoring hints found by [`extract_retry_after`].
    pub fn new(base: impl Strategy + 'static) -> Self {
        Self::from_arc(Arc::new(base))
    }

    pub fn from_arc(base: Arc<dyn Strategy>) -> Self {
        Self {
            base,
            cap: None,
            extract: None,
            combine: None,
        }
    }

    /// Caps the final delay.
    pub fn with_cap(mut self, cap: Duration) -> Self {
        self.cap = Some(cap);
        self
    }

    /// Replaces the default hint extractor.
    pub fn with_extractor<F>(mut self, extract: F) -> Self
    where
        F: Fn(&DynError) -> Option<Duration> + Send + Sync + 'static,
    {
        self.extract = Some(Arc::new(extract));
        self
    }

    /// Replaces the default `max(base, hint)` combiner.
    pub fn with_combiner<F>(mut self, combine: F) -> Self
    where
        F: Fn(Duration, Duration) -> Duration + Send + Sync + 'static,
    {
        self.combine = Some(Arc::new(combine));
        self
    }

    fn hint(&self, previous: &DynError) -> Option<Duration> {
        match &self.extract {
            Some(extract) => extract(previous),
            None => extract_retry_after(previous),
        }
    }
}

impl fmt::Debug for HintedStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HintedStrategy")
            .field("cap", &self.cap)
            .field("custom_extractor", &self.extract.is_some())
            .field("custom_combiner", &self.combine.is_some())
            .finish_non_exhaustive()
    }
}

impl Strategy for HintedStrategy {
    fn next_delay(&self, attempt: u32, previous: &DynError) -> Duration {
        let mut delay = self.base.next_delay(attempt, previous);

        if let Some(hint) = self.hint(previous).filter(|h| !h.is_zero()) {
            delay = match &self.combine {
                Some(combine) => combine(delay, hint),
                None => delay.max(hint),
            };
        }

        match self.cap {
            Some(cap) if !cap.is_zero() => delay.min(cap),
            _ => delay,
        }
    }

    fn reset(&self) {
        self.base.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hint::RetryAfter;

    #[derive(Debug, thiserror::Error)]
    #[error("transient")]
    struct Transient;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn constant_returns_same_delay() {
        let s = ConstantStrategy::new(ms(100));
        assert_eq!(s.next_delay(0, &Transient), ms(100));
        assert_eq!(s.next_delay(7, &Transient), ms(100));
    }

    #[test]
    fn exponential_grows_until_cap() {
        let s = ExponentialStrategy::new(ms(100), 2.0, ms(1_000));
        assert_eq!(s.next_delay(0, &Transient), ms(100));
        assert_eq!(s.next_delay(1, &Transient), ms(200));
        assert_eq!(s.next_delay(2, &Transient), ms(400));
        assert_eq!(s.next_delay(3, &Transient), ms(800));
        assert_eq!(s.next_delay(4, &Transient), ms(1_000));
        assert_eq!(s.next_delay(60, &Transient), ms(1_000));
    }

    #[test]
    fn exponential_is_monotonic_and_bounded() {
        let s = ExponentialStrategy::new(ms(3), 1.7, Duration::from_secs(30));
        let mut previous = Duration::ZERO;
        for attempt in 0..200 {
            let d = s.next_delay(attempt, &Transient);
            assert!(d >= previous, "attempt {attempt} shrank: {d:?} < {previous:?}");
            assert!(d <= Duration::from_secs(30));
            previous = d;
        }
    }

    #[test]
    fn exponential_first_attempt_respects_cap() {
        let s = ExponentialStrategy::new(Duration::from_secs(5), 2.0, Duration::from_secs(1));
        assert_eq!(s.next_delay(0, &Transient), Duration::from_secs(1));
    }

    #[test]
    fn exponential_factor_below_one_never_shrinks() {
        let s = ExponentialStrategy::new(ms(100), 0.5, ms(1_000));
        assert_eq!(s.next_delay(0, &Transient), ms(100));
        assert_eq!(s.next_delay(5, &Transient), ms(100));
    }

    #[test]
    fn exponential_overflow_clamps_to_ceiling() {
        let capped = ExponentialStrategy::new(Duration::from_secs(1), 10.0, Duration::from_secs(60));
        assert_eq!(capped.next_delay(u32::MAX, &Transient), Duration::from_secs(60));

        let uncapped = ExponentialStrategy::new(Duration::from_secs(1), 10.0, Duration::ZERO);
        assert_eq!(uncapped.next_delay(10_000, &Transient), Duration::MAX);
    }

    #[test]
    fn hinted_takes_larger_of_base_and_hint() {
        let s = HintedStrategy::new(ConstantStrategy::new(ms(100)));
        let err = RetryAfter::new(Duration::from_secs(2), Transient);
        assert_eq!(s.next_delay(0, &err), Duration::from_secs(2));

        let small = RetryAfter::new(ms(10), Transient);
        assert_eq!(s.next_delay(0, &small), ms(100));
    }

    #[test]
    fn hinted_without_hint_uses_base() {
        let s = HintedStrategy::new(ConstantStrategy::new(ms(100)));
        assert_eq!(s.next_delay(3, &Transient), ms(100));
    }

    #[test]
    fn hinted_applies_cap_and_custom_combiner() {
        let err = RetryAfter::new(Duration::from_secs(120), Transient);

        let capped = HintedStrategy::new(ConstantStrategy::new(ms(100))).with_cap(Duration::from_secs(5));
        assert_eq!(capped.next_delay(0, &err), Duration::from_secs(5));

        let summed = HintedStrategy::new(ConstantStrategy::new(ms(100))).with_combiner(|b, h| b + h);
        assert_eq!(summed.next_delay(0, &err), Duration::from_secs(120) + ms(100));
    }

    #[test]
    fn hinted_custom_extractor() {
        let s = HintedStrategy::new(ConstantStrategy::new(ms(1)))
            .with_extractor(|err| (err.to_string() == "transient").then_some(ms(750)));
        assert_eq!(s.next_delay(0, &Transient), ms(750));
    }
}
