//! Order-fulfillment saga: reserve stock, charge the customer, ship the order.
//!
//! Inventory and shipping are called in-process. Payment is reached through a
//! [`CommandBus`](saga::CommandBus) so the charge and refund travel as remote
//! commands, the way a separate payment service would receive them.

use std::sync::Arc;
use std::time::Duration;

use retry::{DynError, ExponentialStrategy, RetryOn, RetryOptions};
use saga::{
    BoxError, Definition, Execution, LocalCommandBus, RemoteCommand, RemoteError, RemoteReply,
    Step, remote_action, remote_compensation,
};
use saga_store::DataMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ServiceError;
use crate::services::{
    InMemoryInventory, InMemoryPayments, InMemoryShipping, InventoryService,
    PaymentService, ReservationItem, ShippingService,
};

pub const SAGA_NAME: &str = "order_fulfillment";
pub const RESERVE_INVENTORY: &str = "reserve_inventory";
pub const CHARGE_PAYMENT: &str = "charge_payment";
pub const SHIP_ORDER: &str = "ship_order";

pub const PAYMENT_CHARGE_SUBJECT: &str = "payments.charge";
pub const PAYMENT_REFUND_SUBJECT: &str = "payments.refund";

/// Saga input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub order_id: String,
    pub customer_id: String,
    pub amount_cents: u64,
    pub items: Vec<ReservationItem>,
    pub address: String,
}

impl OrderRequest {
    pub fn into_input(self) -> Result<DataMap, serde_json::Error> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            _ => Ok(DataMap::new()),
        }
    }

    pub fn from_input(input: &DataMap) -> Result<Self, ServiceError> {
        serde_json::from_value(Value::Object(input.clone()))
            .map_err(|e| ServiceError::InvalidOrder(e.to_string()))
    }
}

/// The services the fulfillment steps call.
#[derive(Clone)]
pub struct FulfillmentServices {
    pub inventory: Arc<dyn InventoryService>,
    pub payment: Arc<dyn PaymentService>,
    pub shipping: Arc<dyn ShippingService>,
}

/// In-memory services with failure switches, for the demo and tests.
#[derive(Debug, Clone, Default)]
pub struct InMemoryFulfillment {
    pub inventory: InMemoryInventory,
    pub payment: InMemoryPayments,
    pub shipping: InMemoryShipping,
}

impl InMemoryFulfillment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn services(&self) -> FulfillmentServices {
        FulfillmentServices {
            inventory: Arc::new(self.inventory.clone()),
            payment: Arc::new(self.payment.clone()),
            shipping: Arc::new(self.shipping.clone()),
        }
    }

    /// Forces the named step to fail. Returns false for an unknown step.
    pub fn fail_step(&self, step: &str) -> bool {
        match step {
            RESERVE_INVENTORY => self.inventory.set_fail_on_reserve(true),
            CHARGE_PAYMENT => self.payment.set_fail_on_charge(true),
            SHIP_ORDER => self.shipping.set_fail_on_create(true),
            _ => return false,
        }
        true
    }
}

/// Builds the fulfillment saga definition.
pub fn definition(services: &FulfillmentServices) -> Definition {
    let bus = Arc::new(payment_bus(Arc::clone(&services.payment)));

    Definition::new(SAGA_NAME)
        .step(reserve_step(Arc::clone(&services.inventory)))
        .step(charge_step(bus))
        .step(ship_step(Arc::clone(&services.shipping)))
}

/// Registers the payment service's charge and refund handlers on a bus.
pub fn payment_bus(payment: Arc<dyn PaymentService>) -> LocalCommandBus {
    let bus = LocalCommandBus::new();

    let charger = Arc::clone(&payment);
    bus.handle(PAYMENT_CHARGE_SUBJECT, move |command| {
        let payment = Arc::clone(&charger);
        async move { Ok::<_, BoxError>(charge_reply(payment.as_ref(), command).await) }
    });
    bus.handle(PAYMENT_REFUND_SUBJECT, move |command| {
        let payment = Arc::clone(&payment);
        async move { Ok::<_, BoxError>(refund_reply(payment.as_ref(), command).await) }
    });

    bus
}

async fn charge_reply(payment: &dyn PaymentService, command: RemoteCommand) -> RemoteReply {
    let order = match OrderRequest::from_input(&command.payload.input) {
        Ok(order) => order,
        Err(e) => return RemoteReply::error(&command, e.to_string()),
    };

    match payment
        .charge(&order.order_id, &order.customer_id, order.amount_cents)
        .await
    {
        Ok(result) => {
            let mut outputs = DataMap::new();
            outputs.insert("payment_id".into(), Value::String(result.payment_id));
            RemoteReply::ok(&command, outputs)
        }
        Err(e) => RemoteReply::error(&command, e.to_string()),
    }
}

async fn refund_reply(payment: &dyn PaymentService, command: RemoteCommand) -> RemoteReply {
    let Some(payment_id) = command.payload.step_data.get("payment_id").and_then(Value::as_str) else {
        return RemoteReply::ok(&command, DataMap::new());
    };
    match payment.refund(payment_id).await {
        Ok(()) => RemoteReply::ok(&command, DataMap::new()),
        Err(e) => RemoteReply::error(&command, e.to_string()),
    }
}

fn reserve_step(inventory: Arc<dyn InventoryService>) -> Step {
    let releaser = Arc::clone(&inventory);
    Step::new(RESERVE_INVENTORY, move |ex| Box::pin(reserve(Arc::clone(&inventory), ex)))
        .with_compensation(move |ex| Box::pin(release(Arc::clone(&releaser), ex)))
        .with_idempotency_key(|ex| format!("{}:{}", ex.saga_id(), ex.step_name()))
        .with_timeout(Duration::from_secs(5))
        .with_retry(
            RetryOptions::new()
                .with_max_attempts(3)
                .with_classifier(RetryOn::new(is_transient)),
        )
}

fn charge_step(bus: Arc<LocalCommandBus>) -> Step {
    Step::from_fn(
        CHARGE_PAYMENT,
        remote_action(bus.clone(), PAYMENT_CHARGE_SUBJECT, Some(Duration::from_secs(10))),
    )
    .with_compensation_fn(remote_compensation(bus, PAYMENT_REFUND_SUBJECT, None))
    .with_idempotency_key(|ex| format!("{}:{}", ex.saga_id(), ex.step_name()))
    .with_retry(
        RetryOptions::new()
            .with_max_attempts(3)
            .with_classifier(RetryOn::new(|err| !is_rejection(err))),
    )
}

fn ship_step(shipping: Arc<dyn ShippingService>) -> Step {
    let canceller = Arc::clone(&shipping);
    Step::new(SHIP_ORDER, move |ex| Box::pin(ship(Arc::clone(&shipping), ex)))
        .with_compensation(move |ex| Box::pin(cancel_shipment(Arc::clone(&canceller), ex)))
        .with_timeout(Duration::from_secs(5))
        .with_retry(
            RetryOptions::new()
                .with_strategy(ExponentialStrategy::new(
                    Duration::from_millis(200),
                    2.0,
                    Duration::from_secs(2),
                ))
                .with_max_attempts(5)
                .with_classifier(RetryOn::new(is_transient)),
        )
}

async fn reserve(inventory: Arc<dyn InventoryService>, ex: &mut Execution) -> Result<(), BoxError> {
    let order = OrderRequest::from_input(ex.input())?;
    let result = inventory
        .reserve(&ex.idempotency_key(), &order.order_id, &order.items)
        .await?;
    tracing::info!(order_id = %order.order_id, reservation_id = %result.reservation_id, "inventory reserved");
    ex.set("reservation_id", result.reservation_id);
    Ok(())
}

async fn release(inventory: Arc<dyn InventoryService>, ex: &mut Execution) -> Result<(), BoxError> {
    let Some(reservation_id) = ex.get_as::<String>("reservation_id") else {
        return Ok(());
    };
    inventory.release(&reservation_id).await?;
    tracing::info!(%reservation_id, "inventory released");
    Ok(())
}

async fn ship(shipping: Arc<dyn ShippingService>, ex: &mut Execution) -> Result<(), BoxError> {
    let order = OrderRequest::from_input(ex.input())?;
    let paid = ex
        .step_data(CHARGE_PAYMENT)
        .is_some_and(|data| data.contains_key("payment_id"));
    if !paid {
        return Err(ServiceError::Shipping(format!("order {} has no payment", order.order_id)).into());
    }

    let result = shipping.create_shipment(&order.order_id, &order.address).await?;
    tracing::info!(order_id = %order.order_id, tracking_number = %result.tracking_number, "shipment created");
    ex.set("tracking_number", result.tracking_number);
    Ok(())
}

async fn cancel_shipment(shipping: Arc<dyn ShippingService>, ex: &mut Execution) -> Result<(), BoxError> {
    if let Some(tracking_number) = ex.get_as::<String>("tracking_number") {
        shipping.cancel_shipment(&tracking_number).await?;
        tracing::info!(%tracking_number, "shipment cancelled");
    }
    Ok(())
}

/// Walks the source chain for a transient [`ServiceError`].
fn is_transient(err: &DynError) -> bool {
    let mut current: Option<&DynError> = Some(err);
    while let Some(e) = current {
        if let Some(service) = e.downcast_ref::<ServiceError>() {
            return service.is_transient();
        }
        current = e.source();
    }
    false
}

fn is_rejection(err: &DynError) -> bool {
    let mut current: Option<&DynError> = Some(err);
    while let Some(e) = current {
        if let Some(RemoteError::Rejected { .. }) = e.downcast_ref::<RemoteError>() {
            return true;
        }
        current = e.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use saga::StepError;

    fn order() -> OrderRequest {
        OrderRequest {
            order_id: "ORD-1".to_string(),
            customer_id: "CUST-1".to_string(),
            amount_cents: 4_999,
            items: vec![ReservationItem {
                sku: "SKU-001".to_string(),
                quantity: 1,
            }],
            address: "1 Main St".to_string(),
        }
    }

    #[test]
    fn test_order_input_round_trip() {
        let input = order().into_input().unwrap();
        assert_eq!(input.get("order_id"), Some(&Value::String("ORD-1".into())));
        assert_eq!(OrderRequest::from_input(&input).unwrap(), order());
    }

    #[test]
    fn test_malformed_input_is_invalid_order() {
        let err = OrderRequest::from_input(&DataMap::new()).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidOrder(_)));
    }

    #[test]
    fn test_definition_step_order() {
        let services = InMemoryFulfillment::new().services();
        let definition = definition(&services);
        assert_eq!(definition.name, SAGA_NAME);
        assert_eq!(
            definition.step_names().collect::<Vec<_>>(),
            [RESERVE_INVENTORY, CHARGE_PAYMENT, SHIP_ORDER]
        );
        assert!(definition.steps.iter().all(Step::is_compensable));
    }

    #[test]
    fn test_transient_classification_follows_source_chain() {
        let transient = StepError::Action(Box::new(ServiceError::Unavailable {
            service: "shipping",
            reason: "carrier timed out".to_string(),
        }));
        let permanent = StepError::Action(Box::new(ServiceError::Shipping("No carrier".into())));

        assert!(is_transient(&transient));
        assert!(!is_transient(&permanent));
        assert!(!is_transient(&StepError::Fatal("lease lost".into())));
    }

    #[test]
    fn test_fail_step_switches() {
        let fulfillment = InMemoryFulfillment::new();
        assert!(fulfillment.fail_step(CHARGE_PAYMENT));
        assert!(!fulfillment.fail_step("gift_wrap"));
    }

    #[tokio::test]
    async fn test_payment_bus_replies() {
        let payment = InMemoryPayments::new();
        let bus = payment_bus(Arc::new(payment.clone()));

        let payload = saga::RemotePayload {
            saga_id: "saga-1".into(),
            step: CHARGE_PAYMENT.to_string(),
            call_type: saga::CallType::Action,
            attempt: 1,
            idempotency_key: String::new(),
            input: order().into_input().unwrap(),
            step_data: DataMap::new(),
            metadata: Default::default(),
        };
        let reply = saga::CommandBus::request(
            &bus,
            RemoteCommand::new(PAYMENT_CHARGE_SUBJECT, payload),
        )
        .await
        .unwrap();

        assert!(reply.ok);
        assert_eq!(reply.reply_type, "payments.charge.result");
        assert_eq!(reply.outputs.get("payment_id"), Some(&Value::String("PAY-0001".into())));
        assert_eq!(payment.payment_count(), 1);
    }
}
