//! Cancellable waiting and the notion of "now" used by the retry loop.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// A wait was cut short by cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("sleep interrupted by cancellation")]
pub struct Interrupted;

/// Abstracts waiting so tests can run on a virtual clock.
#[async_trait]
pub trait Sleeper: Send + Sync {
    /// Waits for `duration` unless `cancel` fires first.
    async fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> Result<(), Interrupted>;

    /// Current instant, used to measure elapsed retry time.
    fn now(&self) -> Instant;
}

/// Sleeps on the tokio timer.
///
/// Follows tokio's clock, so paused-time tests (`start_paused`) work too.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> Result<(), Interrupted> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Interrupted),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}

const MAX_OFFSET: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

#[derive(Debug, Default)]
struct VirtualTime {
    offset: Duration,
    sleeps: Vec<Duration>,
}

/// Virtual clock: sleeping returns immediately and moves time forward.
///
/// Every requested sleep is recorded so tests can assert on the exact wait
/// sequence a retry loop produced.
#[derive(Debug)]
pub struct ManualSleeper {
    origin: Instant,
    state: Mutex<VirtualTime>,
}

impl ManualSleeper {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            state: Mutex::new(VirtualTime::default()),
        }
    }

    /// Moves virtual time forward without recording a sleep.
    pub fn advance(&self, by: Duration) {
        let mut state = self.lock();
        state.offset = state.offset.saturating_add(by).min(MAX_OFFSET);
    }

    /// Sleeps requested so far, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.lock().sleeps.clone()
    }

    /// Total virtual time elapsed since creation.
    pub fn elapsed(&self) -> Duration {
        self.lock().offset
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VirtualTime> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ManualSleeper {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sleeper for ManualSleeper {
    async fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> Result<(), Interrupted> {
        if cancel.is_cancelled() {
            return Err(Interrupted);
        }
        {
            let mut state = self.lock();
            state.sleeps.push(duration);
            state.offset = state.offset.saturating_add(duration).min(MAX_OFFSET);
        }
        tokio::task::yield_now().await;
        if cancel.is_cancelled() {
            return Err(Interrupted);
        }
        Ok(())
    }

    fn now(&self) -> Instant {
        self.origin + self.lock().offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn manual_sleeper_records_and_advances() {
        let sleeper = ManualSleeper::new();
        let start = sleeper.now();
        let cancel = CancellationToken::new();

        sleeper.sleep(Duration::from_secs(2), &cancel).await.unwrap();
        sleeper.sleep(Duration::from_secs(3), &cancel).await.unwrap();
        sleeper.advance(Duration::from_secs(1));

        assert_eq!(sleeper.sleeps(), vec![Duration::from_secs(2), Duration::from_secs(3)]);
        assert_eq!(sleeper.now() - start, Duration::from_secs(6));
    }

    #[tokio::test]
    async fn manual_sleeper_honors_cancellation() {
        let sleeper = ManualSleeper::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_eq!(sleeper.sleep(Duration::from_secs(1), &cancel).await, Err(Interrupted));
        assert!(sleeper.sleeps().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_sleeper_waits() {
        let sleeper = TokioSleeper;
        let before = sleeper.now();
        sleeper
            .sleep(Duration::from_millis(250), &CancellationToken::new())
            .await
            .unwrap();
        assert!(sleeper.now() - before >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn tokio_sleeper_is_interrupted() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let result = TokioSleeper.sleep(Duration::from_secs(30), &cancel).await;
        assert_eq!(result, Err(Interrupted));
    }
}
