//! Order processing steps over the in-memory store.
//!
//! The saga creates an order, announces it through the outbox and confirms
//! it:
//! 1. `CREATE_ORDER` inserts a `PENDING` order
//! 2. `SEND_MESSAGE` records `ORDER_CONFIRMED` in the outbox
//! 3. `UPDATE_ORDER_STATUS` moves the order to `CONFIRMED`
//!
//! Each step writes through its own unit of work, so business rows and
//! outbox rows always commit together. The order id comes from the saga
//! context, and every step checks the order row before writing, so running
//! a step again after a crash leaves the same state as running it once.

pub mod create_order;
pub mod send_message;
pub mod update_status;

use std::sync::Arc;

use store::InMemoryStore;

use crate::error::Result;
use crate::registry::StepRegistry;

pub use create_order::CreateOrderStep;
pub use send_message::SendMessageStep;
pub use update_status::UpdateOrderStatusStep;

/// The saga type for order processing.
pub const ORDER_SAGA_TYPE: &str = "ORDER_PROCESSING";

/// Business table holding orders.
pub const ORDERS_TABLE: &str = "orders";

/// Aggregate type used for order events.
pub const ORDER_AGGREGATE: &str = "Order";

/// Status of a freshly created order.
pub const ORDER_PENDING: &str = "PENDING";

pub const STEP_CREATE_ORDER: &str = "CREATE_ORDER";
pub const STEP_SEND_MESSAGE: &str = "SEND_MESSAGE";
pub const STEP_UPDATE_ORDER_STATUS: &str = "UPDATE_ORDER_STATUS";

/// Context keys read and written by the order steps.
pub mod keys {
    pub const CUSTOMER_NAME: &str = "customerName";
    pub const PRODUCT_NAME: &str = "productName";
    pub const AMOUNT: &str = "amount";
    pub const ORDER_ID: &str = "orderId";
    pub const MESSAGE_ID: &str = "messageId";
    pub const ORIGINAL_ORDER_STATUS: &str = "originalOrderStatus";
    pub const SHOULD_FAIL_MESSAGE: &str = "shouldFailMessage";
    pub const SHOULD_FAIL_UPDATE: &str = "shouldFailUpdate";
}

/// Builds a registry with the order steps and the order saga definition.
pub fn order_registry(store: InMemoryStore) -> Result<StepRegistry> {
    let mut registry = StepRegistry::new();
    registry.register(Arc::new(CreateOrderStep::new(store.clone())))?;
    registry.register(Arc::new(SendMessageStep::new(store.clone())))?;
    registry.register(Arc::new(UpdateOrderStatusStep::new(store)))?;
    registry.define(
        ORDER_SAGA_TYPE,
        [STEP_CREATE_ORDER, STEP_SEND_MESSAGE, STEP_UPDATE_ORDER_STATUS],
    )?;
    Ok(registry)
}
