use async_trait::async_trait;
use store::{InMemoryStore, TransactionalStore, UnitOfWork};

use super::{ORDER_PENDING, ORDERS_TABLE, STEP_CREATE_ORDER, keys};
use crate::data::SagaData;
use crate::error::Result;
use crate::step::{SagaStep, SagaStepResult};

/// Inserts a `PENDING` order under the context's `orderId`; compensation
/// deletes it.
///
/// An order row that already exists is left as is, so a replayed execute
/// does not create a second order.
#[derive(Debug, Clone)]
pub struct CreateOrderStep {
    store: InMemoryStore,
}

impl CreateOrderStep {
    pub fn new(store: InMemoryStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SagaStep for CreateOrderStep {
    fn step_name(&self) -> &str {
        STEP_CREATE_ORDER
    }

    async fn execute(&self, data: &SagaData) -> Result<SagaStepResult> {
        let (Some(order_id), Some(customer), Some(product), Some(amount)) = (
            data.get_str(keys::ORDER_ID),
            data.get_str(keys::CUSTOMER_NAME),
            data.get_str(keys::PRODUCT_NAME),
            data.get(keys::AMOUNT),
        ) else {
            return Ok(SagaStepResult::failure(
                "orderId, customerName, productName and amount are required",
            ));
        };

        let mut uow = self.store.begin().await?;
        if uow.get_row(ORDERS_TABLE, order_id).await.is_some() {
            tracing::info!(order_id, "order already exists");
            return Ok(SagaStepResult::success());
        }

        uow.put_row(
            ORDERS_TABLE,
            order_id,
            serde_json::json!({
                "id": order_id,
                "customerName": customer,
                "productName": product,
                "amount": amount,
                "status": ORDER_PENDING,
                "notified": false,
            }),
        );
        uow.commit().await?;

        tracing::info!(order_id, "order created");
        Ok(SagaStepResult::success())
    }

    async fn compensate(&self, data: &SagaData) -> Result<SagaStepResult> {
        let Some(order_id) = data.get_str(keys::ORDER_ID) else {
            return Ok(SagaStepResult::success());
        };

        let mut uow = self.store.begin().await?;
        uow.delete_row(ORDERS_TABLE, order_id);
        uow.commit().await?;

        tracing::info!(order_id, "order deleted");
        Ok(SagaStepResult::success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order_data() -> SagaData {
        SagaData::new()
            .with(keys::ORDER_ID, "o-1")
            .with(keys::CUSTOMER_NAME, "Ada")
            .with(keys::PRODUCT_NAME, "Widget")
            .with(keys::AMOUNT, 25)
    }

    #[tokio::test]
    async fn creates_and_deletes_order() {
        let store = InMemoryStore::new();
        let step = CreateOrderStep::new(store.clone());
        let data = order_data();

        let result = step.execute(&data).await.unwrap();
        assert!(result.is_success());

        let order = store.get_row(ORDERS_TABLE, "o-1").await.unwrap();
        assert_eq!(order["status"], "PENDING");
        assert_eq!(order["customerName"], "Ada");

        step.compensate(&data).await.unwrap();
        assert!(store.get_row(ORDERS_TABLE, "o-1").await.is_none());
    }

    #[tokio::test]
    async fn replayed_execute_keeps_the_existing_order() {
        let store = InMemoryStore::new();
        let step = CreateOrderStep::new(store.clone());
        step.execute(&order_data()).await.unwrap();

        let mut uow = store.begin().await.unwrap();
        uow.put_row(
            ORDERS_TABLE,
            "o-1",
            serde_json::json!({"id": "o-1", "status": "CONFIRMED"}),
        );
        uow.commit().await.unwrap();

        let result = step.execute(&order_data()).await.unwrap();
        assert!(result.is_success());
        assert_eq!(store.row_count(ORDERS_TABLE).await, 1);
        let order = store.get_row(ORDERS_TABLE, "o-1").await.unwrap();
        assert_eq!(order["status"], "CONFIRMED");
    }

    #[tokio::test]
    async fn missing_fields_fail_the_step() {
        let step = CreateOrderStep::new(InMemoryStore::new());
        let result = step.execute(&SagaData::new()).await.unwrap();
        assert!(!result.is_success());

        let without_id = SagaData::new()
            .with(keys::CUSTOMER_NAME, "Ada")
            .with(keys::PRODUCT_NAME, "Widget")
            .with(keys::AMOUNT, 25);
        let result = step.execute(&without_id).await.unwrap();
        assert!(!result.is_success());
    }
}
