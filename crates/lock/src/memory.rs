use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{Clock, SystemClock};

use crate::{LockError, Locker, Renewer, Result};

#[derive(Debug, Default)]
struct Leases {
    expiries: HashMap<String, DateTime<Utc>>,
    fail_renewals: bool,
}

/// Process-local locker with TTL expiry and renewal.
///
/// A zero TTL takes a lease that never expires on its own.
#[derive(Clone)]
pub struct InMemoryLocker {
    leases: Arc<Mutex<Leases>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryLocker {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            leases: Arc::new(Mutex::new(Leases::default())),
            clock,
        }
    }

    /// Returns true if `key` is currently leased.
    pub fn is_locked(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.lock()
            .expiries
            .get(key)
            .is_some_and(|expiry| *expiry > now)
    }

    /// Drops a lease regardless of who holds it, as an expiry would.
    pub fn revoke(&self, key: &str) {
        self.lock().expiries.remove(key);
    }

    /// Makes every renewal fail with a backend error (for testing).
    pub fn set_fail_renewals(&self, fail: bool) {
        self.lock().fail_renewals = fail;
    }

    fn expiry(&self, ttl: Duration) -> DateTime<Utc> {
        if ttl.is_zero() {
            return DateTime::<Utc>::MAX_UTC;
        }
        let now = self.clock.now();
        chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Leases> {
        self.leases.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for InMemoryLocker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryLocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryLocker")
            .field("leases", &self.lock().expiries.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Locker for InMemoryLocker {
    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = self.clock.now();
        let expiry = self.expiry(ttl);
        let mut leases = self.lock();
        if leases.expiries.get(key).is_some_and(|current| *current > now) {
            return Ok(false);
        }
        leases.expiries.insert(key.to_string(), expiry);
        tracing::trace!(key, "lease acquired");
        Ok(true)
    }

    async fn unlock(&self, key: &str) -> Result<()> {
        self.lock().expiries.remove(key);
        tracing::trace!(key, "lease released");
        Ok(())
    }

    fn as_renewer(&self) -> Option<&dyn Renewer> {
        Some(self)
    }
}

#[async_trait]
impl Renewer for InMemoryLocker {
    async fn renew(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = self.clock.now();
        let expiry = self.expiry(ttl);
        let mut leases = self.lock();
        if leases.fail_renewals {
            return Err(LockError::Backend("renewal rejected".to_string()));
        }
        match leases.expiries.get_mut(key) {
            Some(current) if *current > now => {
                *current = expiry;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
