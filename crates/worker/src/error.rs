//! Worker error types.

use saga::SagaError;
use saga_store::SagaId;
use thiserror::Error;

/// Errors returned by the in-memory business services.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("Inventory service error: {0}")]
    Inventory(String),

    #[error("Payment service error: {0}")]
    Payment(String),

    #[error("Shipping service error: {0}")]
    Shipping(String),

    #[error("{service} service unavailable: {reason}")]
    Unavailable { service: &'static str, reason: String },

    #[error("Invalid order: {0}")]
    InvalidOrder(String),
}

impl ServiceError {
    /// Whether the same call may succeed if repeated.
    pub fn is_transient(&self) -> bool {
        matches!(self, ServiceError::Unavailable { .. })
    }
}

/// Errors surfaced by the saga driver.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Saga(#[from] SagaError),

    #[error("Saga {id} still running after {runs} runs")]
    GaveUp { id: SagaId, runs: u32 },

    #[error("Shutdown requested while saga {0} was running")]
    Shutdown(SagaId),
}

pub type Result<T> = std::result::Result<T, WorkerError>;
