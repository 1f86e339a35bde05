use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{Instance, Result, SagaId, Store, StoreError};

/// In-memory store for tests and demos.
///
/// Instances are cloned on every read and write so callers never alias the
/// stored copy.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    instances: Arc<RwLock<HashMap<SagaId, Instance>>>,
    fail_saves: Arc<AtomicBool>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored instances.
    pub async fn len(&self) -> usize {
        self.instances.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.instances.read().await.is_empty()
    }

    /// Returns the IDs of all stored instances, sorted.
    pub async fn ids(&self) -> Vec<SagaId> {
        let mut ids: Vec<_> = self.instances.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Makes every save fail with a backend error (for testing).
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create(&self, instance: &Instance) -> Result<()> {
        let mut instances = self.instances.write().await;
        if instances.contains_key(&instance.id) {
            return Err(StoreError::AlreadyExists(instance.id.clone()));
        }
        instances.insert(instance.id.clone(), instance.clone());
        Ok(())
    }

    async fn load(&self, id: &SagaId) -> Result<Instance> {
        self.instances
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn save(&self, instance: &mut Instance) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("save rejected".to_string()));
        }

        let mut instances = self.instances.write().await;
        let stored = instances
            .get_mut(&instance.id)
            .ok_or_else(|| StoreError::NotFound(instance.id.clone()))?;

        if stored.revision != instance.revision {
            return Err(StoreError::Conflict {
                id: instance.id.clone(),
                expected: instance.revision,
                actual: stored.revision,
            });
        }

        instance.increment_revision();
        *stored = instance.clone();
        Ok(())
    }
}
