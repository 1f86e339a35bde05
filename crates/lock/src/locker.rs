use std::time::Duration;

use async_trait::async_trait;

use crate::Result;

/// Hands out exclusive, time-bounded leases.
#[async_trait]
pub trait Locker: Send + Sync {
    /// Tries to take the lease on `key` for `ttl`. Never blocks waiting for
    /// the current holder; `Ok(false)` means someone else holds it.
    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Releases a lease previously acquired.
    async fn unlock(&self, key: &str) -> Result<()>;

    /// Returns the renewal capability, if this locker has one.
    fn as_renewer(&self) -> Option<&dyn Renewer> {
        None
    }
}

/// Extends leases before they expire.
#[async_trait]
pub trait Renewer: Send + Sync {
    /// Pushes the expiry of `key` to `ttl` from now. `Ok(false)` means the
    /// lease is no longer held and may belong to someone else.
    async fn renew(&self, key: &str, ttl: Duration) -> Result<bool>;
}
