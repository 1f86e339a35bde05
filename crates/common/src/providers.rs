//! Injectable time and ID providers.
//!
//! The coordinator never reads the wall clock or generates IDs directly; it
//! asks a [`Clock`] and an [`IdGenerator`] so tests can substitute
//! deterministic implementations.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};

use crate::SagaId;

/// Source of the current wall-clock time.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Source of fresh saga identifiers.
pub trait IdGenerator: Send + Sync {
    /// Returns a new, unused saga ID.
    fn next_id(&self) -> SagaId;
}

/// Clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
///
/// Every call to [`Clock::now`] returns the current instant and then advances
/// it by `step`, which gives each recorded timestamp a distinct value.
#[derive(Debug)]
pub struct FixedClock {
    current: Mutex<DateTime<Utc>>,
    step: Duration,
}

impl FixedClock {
    /// Creates a clock starting at `start` that never advances on its own.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self::stepping(start, Duration::zero())
    }

    /// Creates a clock that advances by `step` after every read.
    pub fn stepping(start: DateTime<Utc>, step: Duration) -> Self {
        Self {
            current: Mutex::new(start),
            step,
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        *current += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        let now = *current;
        *current += self.step;
        now
    }
}

/// Generates random UUID-based saga IDs.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn next_id(&self) -> SagaId {
        SagaId::new()
    }
}

/// Generates `"{prefix}-1"`, `"{prefix}-2"`, ...
#[derive(Debug)]
pub struct SequentialIds {
    prefix: String,
    next: AtomicU64,
}

impl SequentialIds {
    /// Creates a generator producing IDs with the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }
}

impl IdGenerator for SequentialIds {
    fn next_id(&self) -> SagaId {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        SagaId::from(format!("{}-{}", self.prefix, n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn fixed_clock_does_not_move_without_step() {
        let start = Utc.with_ymd_and_hms(2025, 11, 6, 10, 0, 0).unwrap();
        let clock = FixedClock::new(start);
        assert_eq!(clock.now(), start);
        assert_eq!(clock.now(), start);

        clock.advance(Duration::seconds(5));
        assert_eq!(clock.now(), start + Duration::seconds(5));
    }

    #[test]
    fn stepping_clock_advances_after_each_read() {
        let start = Utc.with_ymd_and_hms(2025, 11, 6, 10, 0, 0).unwrap();
        let clock = FixedClock::stepping(start, Duration::seconds(1));
        assert_eq!(clock.now(), start);
        assert_eq!(clock.now(), start + Duration::seconds(1));
        assert_eq!(clock.now(), start + Duration::seconds(2));
    }

    #[test]
    fn sequential_ids_are_ordered() {
        let ids = SequentialIds::new("saga");
        assert_eq!(ids.next_id().as_str(), "saga-1");
        assert_eq!(ids.next_id().as_str(), "saga-2");
    }

    #[test]
    fn uuid_generator_produces_distinct_ids() {
        let ids = UuidGenerator;
        assert_ne!(ids.next_id(), ids.next_id());
    }
}
