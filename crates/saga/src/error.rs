//! Saga error types.

use std::time::Duration;

use common::{MultiError, SagaId};
use lock::LockError;
use retry::RetryError;
use saga_store::StoreError;
use thiserror::Error;

/// Error type returned by step actions and compensations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failure of a single step attempt, as seen by the retrier.
#[derive(Debug, Error)]
pub enum StepError {
    /// The action returned an error.
    #[error("{0}")]
    Action(#[source] BoxError),

    /// The action panicked; the panic was caught at the step boundary.
    #[error("step '{step}' panicked: {message}")]
    Panicked { step: String, message: String },

    /// The action did not finish within the step timeout.
    #[error("step '{step}' timed out after {timeout:?}")]
    TimedOut { step: String, timeout: Duration },

    /// The run was aborted (lease lost or state could not be persisted).
    #[error("run aborted: {0}")]
    Fatal(String),
}

impl StepError {
    /// Returns the error produced by the action, if any.
    pub fn action_error(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            StepError::Action(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

/// Failure of one step's compensation.
#[derive(Debug, Error)]
pub enum CompensationError {
    /// The compensation gave up.
    #[error("compensation of step '{step}' failed: {source}")]
    Step {
        step: String,
        #[source]
        source: RetryError<StepError>,
    },

    /// The compensation deadline passed before this step could be compensated.
    #[error("compensation deadline of {limit:?} exceeded before step '{step}'")]
    DeadlineExceeded { step: String, limit: Duration },
}

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// Another worker holds the lease on this saga.
    #[error("Saga {0} is locked by another worker")]
    Locked(SagaId),

    /// The lease could not be renewed mid-run.
    #[error("Lease on saga {0} was lost")]
    LeaseLost(SagaId),

    /// The saga was modified concurrently.
    #[error("Concurrency conflict for saga {id}: expected revision {expected}, found {actual}")]
    Conflict { id: SagaId, expected: u64, actual: u64 },

    /// No saga with this ID exists.
    #[error("Saga not found: {0}")]
    NotFound(SagaId),

    /// The saga already reached a terminal status.
    #[error("Saga {0} is already terminal")]
    AlreadyTerminal(SagaId),

    /// An empty saga ID was supplied.
    #[error("Saga ID is empty")]
    EmptySagaId,

    /// The persisted instance does not match the coordinator's definition.
    #[error("Saga {id} has {persisted} steps but definition '{definition}' has {expected}")]
    DefinitionMismatch {
        id: SagaId,
        definition: String,
        expected: usize,
        persisted: usize,
    },

    /// Storage error other than not-found and conflict.
    #[error("Store error: {0}")]
    Store(StoreError),

    /// Lock provider error.
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    /// A step gave up; reported to hooks before compensation starts.
    #[error("Saga step '{step}' failed: {source}")]
    StepFailed {
        step: String,
        #[source]
        source: RetryError<StepError>,
    },

    /// One or more compensations failed.
    #[error("Compensation failed: {0}")]
    Compensation(#[source] MultiError<CompensationError>),
}

impl From<StoreError> for SagaError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => SagaError::NotFound(id),
            StoreError::Conflict {
                id,
                expected,
                actual,
            } => SagaError::Conflict {
                id,
                expected,
                actual,
            },
            other => SagaError::Store(other),
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[derive(Debug, Error)]
    #[error("card declined")]
    struct Declined;

    #[test]
    fn store_errors_map_to_saga_errors() {
        let id = SagaId::from("saga-1");
        assert!(matches!(
            SagaError::from(StoreError::NotFound(id.clone())),
            SagaError::NotFound(_)
        ));
        assert!(matches!(
            SagaError::from(StoreError::Conflict {
                id: id.clone(),
                expected: 1,
                actual: 2
            }),
            SagaError::Conflict {
                expected: 1,
                actual: 2,
                ..
            }
        ));
        assert!(matches!(
            SagaError::from(StoreError::Backend("down".into())),
            SagaError::Store(_)
        ));
    }

    #[test]
    fn action_error_exposes_user_error_as_source() {
        let err = StepError::Action(Box::new(Declined));
        assert_eq!(err.to_string(), "card declined");
        assert!(err.source().is_some_and(|s| s.is::<Declined>()));
        assert!(err.action_error().is_some_and(|e| e.is::<Declined>()));
    }

    #[test]
    fn panicked_step_displays_message() {
        let err = StepError::Panicked {
            step: "charge".into(),
            message: "index out of bounds".into(),
        };
        assert_eq!(err.to_string(), "step 'charge' panicked: index out of bounds");
        assert!(err.action_error().is_none());
    }
}
