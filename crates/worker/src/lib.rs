//! Saga worker: wires the coordinator to storage, locking and the
//! order-fulfillment saga, and drives sagas to a terminal status.

pub mod config;
pub mod driver;
pub mod error;
pub mod fulfillment;
pub mod hooks;
pub mod services;

use std::sync::Arc;

use lock::Locker;
use saga::{Coordinator, CoordinatorConfig};
use saga_store::Store;

pub use config::WorkerConfig;
pub use driver::Driver;
pub use error::{Result, ServiceError, WorkerError};
pub use fulfillment::{FulfillmentServices, InMemoryFulfillment, OrderRequest};
pub use hooks::LoggingHooks;

/// Builds the coordinator configuration from worker settings.
pub fn coordinator_config(config: &WorkerConfig) -> CoordinatorConfig {
    let mut coordinator = CoordinatorConfig::default()
        .with_lock_ttl(config.lock_ttl)
        .with_hooks(Arc::new(LoggingHooks));
    if let Some(limit) = config.max_compensation_time {
        coordinator = coordinator.with_max_compensation_time(limit);
    }
    coordinator
}

/// Builds a fulfillment coordinator and its driver.
pub fn create_driver(
    config: &WorkerConfig,
    services: &FulfillmentServices,
    store: Arc<dyn Store>,
    locker: Arc<dyn Locker>,
) -> Driver {
    let coordinator = Coordinator::new(
        fulfillment::definition(services),
        store,
        locker,
        coordinator_config(config),
    );
    Driver::new(coordinator, config)
}
