//! Stock reservations for orders.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ServiceError;

/// Stock held for an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub reservation_id: String,
}

/// A line item to reserve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationItem {
    pub sku: String,
    pub quantity: u32,
}

#[async_trait]
pub trait InventoryService: Send + Sync {
    /// Reserves stock for an order.
    ///
    /// Repeated calls with the same `request_key` return the original
    /// reservation instead of reserving twice.
    async fn reserve(
        &self,
        request_key: &str,
        order_id: &str,
        items: &[ReservationItem],
    ) -> Result<Reservation, ServiceError>;

    /// Releases a reservation. Unknown ids are ignored.
    async fn release(&self, reservation_id: &str) -> Result<(), ServiceError>;
}

#[derive(Debug, Default)]
struct StockLedger {
    reservations: HashMap<String, (String, Vec<ReservationItem>)>,
    by_request: HashMap<String, String>,
    next_id: u32,
    fail_on_reserve: bool,
    fail_on_release: bool,
}

/// In-memory inventory inventory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryInventory {
    state: Arc<RwLock<StockLedger>>,
}

impl InMemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every reserve call fail until reset.
    pub fn set_fail_on_reserve(&self, fail: bool) {
        self.write().fail_on_reserve = fail;
    }

    /// Makes every release call fail until reset.
    pub fn set_fail_on_release(&self, fail: bool) {
        self.write().fail_on_release = fail;
    }

    pub fn reservation_count(&self) -> usize {
        self.read().reservations.len()
    }

    pub fn has_reservation(&self, reservation_id: &str) -> bool {
        self.read().reservations.contains_key(reservation_id)
    }

    fn read(&self) -> RwLockReadGuard<'_, StockLedger> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, StockLedger> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl InventoryService for InMemoryInventory {
    async fn reserve(
        &self,
        request_key: &str,
        order_id: &str,
        items: &[ReservationItem],
    ) -> Result<Reservation, ServiceError> {
        let mut state = self.write();

        if state.fail_on_reserve {
            return Err(ServiceError::Inventory("Insufficient stock".to_string()));
        }
        if let Some(existing) = state.by_request.get(request_key) {
            return Ok(Reservation {
                reservation_id: existing.clone(),
            });
        }

        state.next_id += 1;
        let reservation_id = format!("RES-{:04}", state.next_id);
        state
            .reservations
            .insert(reservation_id.clone(), (order_id.to_string(), items.to_vec()));
        state
            .by_request
            .insert(request_key.to_string(), reservation_id.clone());

        Ok(Reservation { reservation_id })
    }

    async fn release(&self, reservation_id: &str) -> Result<(), ServiceError> {
        let mut state = self.write();
        if state.fail_on_release {
            return Err(ServiceError::Inventory("Warehouse unreachable".to_string()));
        }
        state.reservations.remove(reservation_id);
        Ok(())
    }
}
