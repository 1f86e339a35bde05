//! Business services called by the fulfillment saga, with in-memory implementations.

pub mod inventory;
pub mod payment;
pub mod shipping;

pub use inventory::{InMemoryInventory, InventoryService, ReservationItem, Reservation};
pub use payment::{InMemoryPayments, Charge, PaymentService};
pub use shipping::{InMemoryShipping, Shipment, ShippingService};
