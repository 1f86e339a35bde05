//! Exclusive lease on a saga for the duration of one run.

use std::sync::Arc;
use std::time::Duration;

use common::SagaId;
use lock::Locker;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SagaError};

/// A held lease, optionally kept alive by a background renewal task.
///
/// The renewal task reports a lost lease at most once over a single-slot
/// channel which the step loop polls without blocking. [`Lease::release`]
/// stops the task and unlocks; if the lease is dropped without being
/// released, the task is stopped and the unlock is spawned.
pub(crate) struct Lease {
    locker: Arc<dyn Locker>,
    key: String,
    keepalive: Option<(CancellationToken, JoinHandle<()>)>,
    lost: mpsc::Receiver<()>,
    is_lost: bool,
    released: bool,
}

impl Lease {
    /// Takes the lease or fails with [`SagaError::Locked`].
    pub(crate) async fn acquire(locker: &Arc<dyn Locker>, saga_id: &SagaId, ttl: Duration) -> Result<Self> {
        let key = saga_id.lock_key();
        if !locker.try_lock(&key, ttl).await? {
            tracing::debug!(%saga_id, "saga is locked by another worker");
            return Err(SagaError::Locked(saga_id.clone()));
        }

        let (tx, lost) = mpsc::channel(1);
        let keepalive = (!ttl.is_zero() && locker.as_renewer().is_some()).then(|| {
            let stop = CancellationToken::new();
            let handle = tokio::spawn(keepalive(
                Arc::clone(locker),
                key.clone(),
                ttl,
                stop.clone(),
                tx,
            ));
            (stop, handle)
        });

        Ok(Self {
            locker: Arc::clone(locker),
            key,
            keepalive,
            lost,
            is_lost: false,
            released: false,
        })
    }

    /// Non-blocking check for a renewal failure. Sticky once reported.
    pub(crate) fn is_lost(&mut self) -> bool {
        if !self.is_lost && self.lost.try_recv().is_ok() {
            self.is_lost = true;
        }
        self.is_lost
    }

    /// Stops the renewal task and releases the lease.
    pub(crate) async fn release(mut self) {
        if let Some((stop, handle)) = self.keepalive.take() {
            stop.cancel();
            let _ = handle.await;
        }
        if let Err(e) = self.locker.unlock(&self.key).await {
            tracing::warn!(key = %self.key, error = %e, "failed to release saga lease");
        }
        self.released = true;
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Some((stop, _)) = self.keepalive.take() {
            stop.cancel();
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let locker = Arc::clone(&self.locker);
            let key = std::mem::take(&mut self.key);
            handle.spawn(async move {
                if let Err(e) = locker.unlock(&key).await {
                    tracing::warn!(%key, error = %e, "failed to release saga lease");
                }
            });
        }
    }
}

async fn keepalive(
    locker: Arc<dyn Locker>,
    key: String,
    ttl: Duration,
    stop: CancellationToken,
    lost: mpsc::Sender<()>,
) {
    let period = (ttl / 3).max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let Some(renewer) = locker.as_renewer() else {
            return;
        };
        match renewer.renew(&key, ttl).await {
            Ok(true) => continue,
            Ok(false) => tracing::warn!(%key, "saga lease is no longer held"),
            Err(e) => tracing::warn!(%key, error = %e, "saga lease renewal failed"),
        }
        metrics::counter!("saga_lease_lost_total").increment(1);
        let _ = lost.try_send(());
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lock::InMemoryLocker;

    fn id() -> SagaId {
        SagaId::from("saga-1")
    }

    #[tokio::test]
    async fn acquire_fails_when_held() {
        let locker: Arc<dyn Locker> = Arc::new(InMemoryLocker::new());
        let held = Lease::acquire(&locker, &id(), Duration::from_secs(10)).await.unwrap();

        let err = Lease::acquire(&locker, &id(), Duration::from_secs(10))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SagaError::Locked(_)));

        held.release().await;
        let again = Lease::acquire(&locker, &id(), Duration::from_secs(10)).await.unwrap();
        again.release().await;
    }

    #[tokio::test]
    async fn dropping_a_lease_unlocks_it() {
        let memory = InMemoryLocker::new();
        let locker: Arc<dyn Locker> = Arc::new(memory.clone());
        let lease = Lease::acquire(&locker, &id(), Duration::from_secs(10)).await.unwrap();
        drop(lease);

        for _ in 0..10 {
            if !memory.is_locked(&id().lock_key()) {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("lease still held after drop");
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_reports_loss_once() {
        let memory = InMemoryLocker::new();
        let locker: Arc<dyn Locker> = Arc::new(memory.clone());
        let mut lease = Lease::acquire(&locker, &id(), Duration::from_secs(3)).await.unwrap();
        assert!(!lease.is_lost());

        memory.revoke(&id().lock_key());
        tokio::time::sleep(Duration::from_millis(1_100)).await;

        assert!(lease.is_lost());
        assert!(lease.is_lost(), "loss is sticky");
        lease.release().await;
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_renews_while_held() {
        let memory = InMemoryLocker::new();
        let locker: Arc<dyn Locker> = Arc::new(memory.clone());
        let mut lease = Lease::acquire(&locker, &id(), Duration::from_secs(3)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!lease.is_lost());
        lease.release().await;
        assert!(!memory.is_locked(&id().lock_key()));
    }

    struct NoRenew(InMemoryLocker);

    #[async_trait::async_trait]
    impl Locker for NoRenew {
        async fn try_lock(&self, key: &str, ttl: Duration) -> lock::Result<bool> {
            self.0.try_lock(key, ttl).await
        }

        async fn unlock(&self, key: &str) -> lock::Result<()> {
            self.0.unlock(key).await
        }
    }

    #[tokio::test]
    async fn no_keepalive_without_renewer() {
        let locker: Arc<dyn Locker> = Arc::new(NoRenew(InMemoryLocker::new()));
        let lease = Lease::acquire(&locker, &id(), Duration::from_secs(3)).await.unwrap();
        assert!(lease.keepalive.is_none());
        lease.release().await;
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_error_counts_as_loss() {
        let memory = InMemoryLocker::new();
        let locker: Arc<dyn Locker> = Arc::new(memory.clone());
        let mut lease = Lease::acquire(&locker, &id(), Duration::from_secs(3)).await.unwrap();

        memory.set_fail_renewals(true);
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert!(lease.is_lost());
        lease.release().await;
    }
}
