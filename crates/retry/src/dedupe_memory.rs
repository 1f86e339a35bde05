//! Process-local dedupe store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{Clock, SystemClock};

use crate::idempotency::{DedupeError, DedupeStore};

/// Token to expiry map guarded by a mutex.
///
/// A committed token stays reserved until its TTL expires, so repeated runs
/// within the TTL are skipped. Rolled-back tokens are released at once.
pub struct InMemoryDedupeStore {
    tokens: Mutex<HashMap<String, DateTime<Utc>>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryDedupeStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Number of reserved tokens, expired ones included until the next
    /// [`begin`](DedupeStore::begin) or [`purge_expired`](Self::purge_expired).
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drops expired reservations.
    pub fn purge_expired(&self) {
        let now = self.clock.now();
        self.lock().retain(|_, expiry| *expiry > now);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, DateTime<Utc>>> {
        self.tokens.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for InMemoryDedupeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryDedupeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryDedupeStore")
            .field("tokens", &self.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DedupeStore for InMemoryDedupeStore {
    async fn begin(&self, token: &str, ttl: Duration) -> Result<bool, DedupeError> {
        let now = self.clock.now();
        let mut tokens = self.lock();
        tokens.retain(|_, expiry| *expiry > now);
        if tokens.contains_key(token) {
            return Ok(false);
        }
        let expiry = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        tokens.insert(token.to_string(), expiry);
        Ok(true)
    }

    async fn commit(&self, _token: &str) -> Result<(), DedupeError> {
        Ok(())
    }

    async fn rollback(&self, token: &str) -> Result<(), DedupeError> {
        self.lock().remove(token);
        Ok(())
    }
}
