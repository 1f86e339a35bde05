//! Randomized perturbation of retry delays.
//!
//! Randomness comes from the thread-local generator, a cryptographically
//! secure ChaCha-based RNG reseeded from the OS, so concurrent retriers cannot
//! predict (and synchronize on) each other's delays.

use std::time::Duration;

use rand::Rng;

/// Perturbs a nominal delay.
pub trait Jitter: Send + Sync {
    fn apply(&self, nominal: Duration) -> Duration;
}

/// Leaves the delay untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoJitter;

impl Jitter for NoJitter {
    fn apply(&self, nominal: Duration) -> Duration {
        nominal
    }
}

/// Uniform in `[0, nominal]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FullJitter;

impl Jitter for FullJitter {
    fn apply(&self, nominal: Duration) -> Duration {
        uniform(Duration::ZERO, nominal)
    }
}

/// Uniform in `[nominal / 2, nominal]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EqualJitter;

impl Jitter for EqualJitter {
    fn apply(&self, nominal: Duration) -> Duration {
        uniform(nominal / 2, nominal)
    }
}

/// Uniform in `[nominal, min(cap, nominal * 3)]`.
///
/// Stateless approximation of decorrelated jitter: the upper bound follows
/// the nominal delay instead of the previous actual sleep.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecorrelatedJitter {
    /// Hard upper bound; `None` means uncapped.
    pub cap: Option<Duration>,
}

impl DecorrelatedJitter {
    pub fn with_cap(cap: Duration) -> Self {
        Self { cap: Some(cap) }
    }
}

impl Jitter for DecorrelatedJitter {
    fn apply(&self, nominal: Duration) -> Duration {
        if nominal.is_zero() {
            return Duration::ZERO;
        }
        let mut hi = nominal.saturating_mul(3);
        if let Some(cap) = self.cap.filter(|c| !c.is_zero()) {
            hi = hi.min(cap);
        }
        if hi <= nominal {
            return nominal;
        }
        uniform(nominal, hi)
    }
}

fn uniform(lo: Duration, hi: Duration) -> Duration {
    if hi <= lo {
        return lo;
    }
    let span = u64::try_from((hi - lo).as_nanos()).unwrap_or(u64::MAX);
    let offset = rand::rng().random_range(0..=span);
    lo.saturating_add(Duration::from_nanos(offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLES: usize = 500;

    #[test]
    fn no_jitter_is_identity() {
        let d = Duration::from_millis(123);
        assert_eq!(NoJitter.apply(d), d);
    }

    #[test]
    fn full_jitter_stays_in_range() {
        let nominal = Duration::from_millis(100);
        for _ in 0..SAMPLES {
            assert!(FullJitter.apply(nominal) <= nominal);
        }
    }

    #[test]
    fn equal_jitter_stays_in_upper_half() {
        let nominal = Duration::from_millis(100);
        for _ in 0..SAMPLES {
            let d = EqualJitter.apply(nominal);
            assert!(d >= nominal / 2 && d <= nominal, "{d:?}");
        }
    }

    #[test]
    fn decorrelated_jitter_respects_cap() {
        let nominal = Duration::from_millis(100);
        let jitter = DecorrelatedJitter::with_cap(Duration::from_millis(150));
        for _ in 0..SAMPLES {
            let d = jitter.apply(nominal);
            assert!(d >= nominal && d <= Duration::from_millis(150), "{d:?}");
        }
    }

    #[test]
    fn decorrelated_jitter_uncapped_upper_bound_is_triple() {
        let nominal = Duration::from_millis(10);
        for _ in 0..SAMPLES {
            let d = DecorrelatedJitter::default().apply(nominal);
            assert!(d >= nominal && d <= nominal * 3, "{d:?}");
        }
    }

    #[test]
    fn decorrelated_cap_below_nominal_returns_nominal() {
        let jitter = DecorrelatedJitter::with_cap(Duration::from_millis(5));
        assert_eq!(jitter.apply(Duration::from_millis(10)), Duration::from_millis(10));
    }

    #[test]
    fn zero_delay_stays_zero() {
        assert_eq!(FullJitter.apply(Duration::ZERO), Duration::ZERO);
        assert_eq!(EqualJitter.apply(Duration::ZERO), Duration::ZERO);
        assert_eq!(DecorrelatedJitter::default().apply(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn jitter_actually_varies() {
        let nominal = Duration::from_secs(10);
        let first = FullJitter.apply(nominal);
        assert!((0..SAMPLES).any(|_| FullJitter.apply(nominal) != first));
    }
}
