//! Saga orchestration.
//!
//! A [`Definition`] lists the steps of a long-running business transaction,
//! each with an optional compensation. The [`Coordinator`] persists one
//! [`Instance`](saga_store::Instance) per run, executes the steps in order
//! under a retrier, and when a step gives up, compensates the completed
//! steps in reverse order.
//!
//! Runs are serialized per saga by a lease taken from a
//! [`Locker`](lock::Locker) and kept alive in the background while the run
//! lasts. Persistence uses optimistic concurrency, so a stale writer fails
//! with [`SagaError::Conflict`] instead of overwriting newer state.

pub mod coordinator;
pub mod definition;
pub mod error;
pub mod execution;
pub mod hooks;
mod lease;
pub mod remote;
pub mod retry_factory;

pub use coordinator::{Coordinator, CoordinatorConfig};
pub use definition::{Definition, IdempotencyFn, Step, StepFn, StepFuture};
pub use error::{BoxError, CompensationError, Result, SagaError, StepError};
pub use execution::Execution;
pub use hooks::{NoopHooks, SagaHooks};
pub use remote::{
    CallType, CommandBus, LocalCommandBus, RemoteCommand, RemoteError, RemotePayload, RemoteReply,
    remote_action, remote_compensation,
};
pub use retry_factory::{CompensationRetryFactory, RetryFactory, StepRetryFactory};
