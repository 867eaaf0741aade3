use async_trait::async_trait;
use store::{InMemoryStore, TransactionalStore, UnitOfWork};

use super::{ORDER_PENDING, ORDERS_TABLE, STEP_UPDATE_ORDER_STATUS, keys};
use crate::data::SagaData;
use crate::error::Result;
use crate::step::{SagaStep, SagaStepResult};

const CONFIRMED: &str = "CONFIRMED";

/// Moves the order from `PENDING` to `CONFIRMED`; compensation restores the
/// status it had before.
///
/// Running execute on an order that is already `CONFIRMED` reports `PENDING`
/// as the original status, which is what the first run saw.
#[derive(Debug, Clone)]
pub struct UpdateOrderStatusStep {
    store: InMemoryStore,
}

impl UpdateOrderStatusStep {
    pub fn new(store: InMemoryStore) -> Self {
        Self { store }
    }

    async fn set_status(&self, order_id: &str, status: &str) -> Result<Option<String>> {
        let mut uow = self.store.begin().await?;
        let Some(mut order) = uow.get_row(ORDERS_TABLE, order_id).await else {
            return Ok(None);
        };

        let previous = order["status"].as_str().unwrap_or_default().to_string();
        if previous == status {
            return Ok(Some(previous));
        }
        order["status"] = serde_json::Value::from(status);
        uow.put_row(ORDERS_TABLE, order_id, order);
        uow.commit().await?;
        Ok(Some(previous))
    }
}

#[async_trait]
impl SagaStep for UpdateOrderStatusStep {
    fn step_name(&self) -> &str {
        STEP_UPDATE_ORDER_STATUS
    }

    async fn execute(&self, data: &SagaData) -> Result<SagaStepResult> {
        if data.flag(keys::SHOULD_FAIL_UPDATE) {
            return Ok(SagaStepResult::failure("Forced update failure"));
        }
        let Some(order_id) = data.get_str(keys::ORDER_ID) else {
            return Ok(SagaStepResult::failure("orderId is required"));
        };

        match self.set_status(order_id, CONFIRMED).await? {
            Some(previous) => {
                let original = if previous == CONFIRMED {
                    ORDER_PENDING.to_string()
                } else {
                    previous
                };
                tracing::info!(order_id, from = %original, to = CONFIRMED, "order status updated");
                Ok(SagaStepResult::success_with(
                    SagaData::new().with(keys::ORIGINAL_ORDER_STATUS, original),
                ))
            }
            None => Ok(SagaStepResult::failure(format!("order {order_id} not found"))),
        }
    }

    async fn compensate(&self, data: &SagaData) -> Result<SagaStepResult> {
        let (Some(order_id), Some(original)) = (
            data.get_str(keys::ORDER_ID),
            data.get_str(keys::ORIGINAL_ORDER_STATUS),
        ) else {
            return Ok(SagaStepResult::success());
        };

        self.set_status(order_id, original).await?;
        tracing::info!(order_id, status = original, "order status restored");
        Ok(SagaStepResult::success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn confirms_and_restores_status() {
        let store = InMemoryStore::new();
        let mut uow = store.begin().await.unwrap();
        uow.put_row(ORDERS_TABLE, "o-1", serde_json::json!({"status": "PENDING"}));
        uow.commit().await.unwrap();

        let step = UpdateOrderStatusStep::new(store.clone());
        let mut data = SagaData::new().with(keys::ORDER_ID, "o-1");
        let result = step.execute(&data).await.unwrap();
        data.merge(result.updated_data.unwrap());

        assert_eq!(data.get_str(keys::ORIGINAL_ORDER_STATUS), Some("PENDING"));
        let order = store.get_row(ORDERS_TABLE, "o-1").await.unwrap();
        assert_eq!(order["status"], "CONFIRMED");

        step.compensate(&data).await.unwrap();
        let order = store.get_row(ORDERS_TABLE, "o-1").await.unwrap();
        assert_eq!(order["status"], "PENDING");
    }

    #[tokio::test]
    async fn replayed_execute_keeps_original_status() {
        let store = InMemoryStore::new();
        let mut uow = store.begin().await.unwrap();
        uow.put_row(ORDERS_TABLE, "o-1", serde_json::json!({"status": "PENDING"}));
        uow.commit().await.unwrap();

        let step = UpdateOrderStatusStep::new(store.clone());
        let mut data = SagaData::new().with(keys::ORDER_ID, "o-1");
        step.execute(&data).await.unwrap();
        let replay = step.execute(&data).await.unwrap().updated_data.unwrap();
        assert_eq!(replay.get_str(keys::ORIGINAL_ORDER_STATUS), Some("PENDING"));

        data.merge(replay);
        step.compensate(&data).await.unwrap();
        let order = store.get_row(ORDERS_TABLE, "o-1").await.unwrap();
        assert_eq!(order["status"], "PENDING");
    }

    #[tokio::test]
    async fn forced_failure_leaves_order_untouched() {
        let store = InMemoryStore::new();
        let data = SagaData::new()
            .with(keys::ORDER_ID, "o-1")
            .with(keys::SHOULD_FAIL_UPDATE, true);
        let result = UpdateOrderStatusStep::new(store)
            .execute(&data)
            .await
            .unwrap();
        assert!(!result.is_success());
    }
}
