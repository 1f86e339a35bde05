//! Carrier shipments for paid orders.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::error::ServiceError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shipment {
    pub tracking_number: String,
}

#[async_trait]
pub trait ShippingService: Send + Sync {
    async fn create_shipment(&self, order_id: &str, address: &str) -> Result<Shipment, ServiceError>;

    async fn cancel_shipment(&self, tracking_number: &str) -> Result<(), ServiceError>;
}

#[derive(Debug, Default)]
struct CarrierLedger {
    shipments: HashMap<String, (String, String)>,
    next_id: u32,
    fail_on_create: bool,
    transient_failures: u32,
}

/// In-memory shipping shipping.
#[derive(Debug, Clone, Default)]
pub struct InMemoryShipping {
    state: Arc<RwLock<CarrierLedger>>,
}

impl InMemoryShipping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every create call fail until reset.
    pub fn set_fail_on_create(&self, fail: bool) {
        self.write().fail_on_create = fail;
    }

    /// Fails the next `count` create calls with a retryable error.
    pub fn set_transient_failures(&self, count: u32) {
        self.write().transient_failures = count;
    }

    pub fn shipment_count(&self) -> usize {
        self.read().shipments.len()
    }

    pub fn has_shipment(&self, tracking_number: &str) -> bool {
        self.read().shipments.contains_key(tracking_number)
    }

    fn read(&self) -> RwLockReadGuard<'_, CarrierLedger> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, CarrierLedger> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ShippingService for InMemoryShipping {
    async fn create_shipment(&self, order_id: &str, address: &str) -> Result<Shipment, ServiceError> {
        let mut state = self.write();

        if state.fail_on_create {
            return Err(ServiceError::Shipping("No carrier available".to_string()));
        }
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(ServiceError::Unavailable {
                service: "shipping",
                reason: "carrier timed out".to_string(),
            });
        }

        state.next_id += 1;
        let tracking_number = format!("TRK-{:06}", state.next_id);
        state
            .shipments
            .insert(tracking_number.clone(), (order_id.to_string(), address.to_string()));

        Ok(Shipment { tracking_number })
    }

    async fn cancel_shipment(&self, tracking_number: &str) -> Result<(), ServiceError> {
        self.write().shipments.remove(tracking_number);
        Ok(())
    }
}
