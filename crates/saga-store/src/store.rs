use async_trait::async_trait;

use crate::{Instance, Result, SagaId};

/// Durable storage for saga instances.
#[async_trait]
pub trait Store: Send + Sync {
    /// Persists a new instance. Fails with `AlreadyExists` if the ID is taken.
    async fn create(&self, instance: &Instance) -> Result<()>;

    /// Loads an instance. Fails with `NotFound` if absent.
    async fn load(&self, id: &SagaId) -> Result<Instance>;

    /// Saves `instance` if its revision matches the stored one, then bumps
    /// `instance.revision`. Fails with `Conflict` on a stale revision.
    async fn save(&self, instance: &mut Instance) -> Result<()>;
}
