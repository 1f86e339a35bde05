use thiserror::Error;

/// Errors that can occur when talking to a lock provider.
#[derive(Debug, Clone, Error)]
pub enum LockError {
    /// The lock provider could not be reached or rejected the request.
    #[error("Lock backend error: {0}")]
    Backend(String),
}

/// Result type for lock operations.
pub type Result<T> = std::result::Result<T, LockError>;
