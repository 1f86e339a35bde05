//! Charges and refunds against a customer.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::error::ServiceError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Charge {
    pub payment_id: String,
}

#[async_trait]
pub trait PaymentService: Send + Sync {
    /// Charges `amount_cents` to the customer for an order.
    async fn charge(
        &self,
        order_id: &str,
        customer_id: &str,
        amount_cents: u64,
    ) -> Result<Charge, ServiceError>;

    /// Refunds a previous charge.
    async fn refund(&self, payment_id: &str) -> Result<(), ServiceError>;
}

#[derive(Debug, Default)]
struct ChargeLedger {
    payments: HashMap<String, (String, String, u64)>,
    refunded: Vec<String>,
    next_id: u32,
    fail_on_charge: bool,
}

/// In-memory payment payments.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPayments {
    state: Arc<RwLock<ChargeLedger>>,
}

impl InMemoryPayments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every charge call fail until reset.
    pub fn set_fail_on_charge(&self, fail: bool) {
        self.write().fail_on_charge = fail;
    }

    /// Number of charges not refunded.
    pub fn payment_count(&self) -> usize {
        self.read().payments.len()
    }

    pub fn has_payment(&self, payment_id: &str) -> bool {
        self.read().payments.contains_key(payment_id)
    }

    /// Payment ids refunded so far, in order.
    pub fn refunded(&self) -> Vec<String> {
        self.read().refunded.clone()
    }

    fn read(&self) -> RwLockReadGuard<'_, ChargeLedger> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, ChargeLedger> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl PaymentService for InMemoryPayments {
    async fn charge(
        &self,
        order_id: &str,
        customer_id: &str,
        amount_cents: u64,
    ) -> Result<Charge, ServiceError> {
        let mut state = self.write();

        if state.fail_on_charge {
            return Err(ServiceError::Payment("Payment declined".to_string()));
        }
        if amount_cents == 0 {
            return Err(ServiceError::Payment("Amount must be positive".to_string()));
        }

        state.next_id += 1;
        let payment_id = format!("PAY-{:04}", state.next_id);
        state.payments.insert(
            payment_id.clone(),
            (order_id.to_string(), customer_id.to_string(), amount_cents),
        );

        Ok(Charge { payment_id })
    }

    async fn refund(&self, payment_id: &str) -> Result<(), ServiceError> {
        let mut state = self.write();
        if state.payments.remove(payment_id).is_some() {
            state.refunded.push(payment_id.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_repeated_refund_is_ignored() {
        let payments = InMemoryPayments::new();

        let result = payments.charge("ORD-1", "CUST-1", 4_999).await.unwrap();
        assert_eq!(result.payment_id, "PAY-0001");
        assert!(payments.has_payment("PAY-0001"));

        payments.refund(&result.payment_id).await.unwrap();
        payments.refund(&result.payment_id).await.unwrap();
        assert_eq!(payments.payment_count(), 0);
        assert_eq!(payments.refunded(), ["PAY-0001"]);
    }

    #[tokio::test]
    async fn test_declined_charge_records_nothing() {
        let payments = InMemoryPayments::new();
        payments.set_fail_on_charge(true);

        let err = payments.charge("ORD-1", "CUST-1", 4_999).await.unwrap_err();
        assert_eq!(err.to_string(), "Payment service error: Payment declined");
        assert_eq!(payments.payment_count(), 0);
    }

    #[tokio::test]
    async fn test_zero_amount_rejected() {
        let payments = InMemoryPayments::new();
        assert!(payments.charge("ORD-1", "CUST-1", 0).await.is_err());
    }
}
