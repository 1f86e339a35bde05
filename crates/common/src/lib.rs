//! Shared types used across the saga engine crates.

pub mod multi_error;
pub mod providers;
pub mod types;

pub use multi_error::MultiError;
pub use providers::{Clock, FixedClock, IdGenerator, SequentialIds, SystemClock, UuidGenerator};
pub use types::SagaId;
