//! Persisted saga state.
//!
//! [`Instance`] and [`StepState`] are the durable record of one saga run. A
//! [`Store`] persists them with optimistic concurrency: every successful save
//! bumps [`Instance::revision`], and a save presented with a stale revision
//! fails with [`StoreError::Conflict`].

pub mod error;
pub mod instance;
pub mod memory;
pub mod status;
pub mod store;

pub use common::SagaId;
pub use error::{Result, StoreError};
pub use instance::{DataMap, Instance, StepState};
pub use memory::InMemoryStore;
pub use status::Status;
pub use store::Store;
