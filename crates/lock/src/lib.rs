//! Lease-based mutual exclusion.
//!
//! A [`Locker`] hands out time-bounded leases keyed by string. Lockers that
//! can extend a lease before it expires also implement [`Renewer`] and expose
//! it through [`Locker::as_renewer`].

pub mod error;
pub mod locker;
pub mod memory;

pub use error::{LockError, Result};
pub use locker::{Locker, Renewer};
pub use memory::InMemoryLocker;
