use thiserror::Error;

use crate::SagaId;

/// Errors that can occur when persisting saga state.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// No saga with this ID exists.
    #[error("Saga not found: {0}")]
    NotFound(SagaId),

    /// A saga with this ID already exists.
    #[error("Saga already exists: {0}")]
    AlreadyExists(SagaId),

    /// The saga was modified since it was loaded.
    #[error("Concurrency conflict for saga {id}: expected revision {expected}, found {actual}")]
    Conflict { id: SagaId, expected: u64, actual: u64 },

    /// The storage backend failed.
    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
