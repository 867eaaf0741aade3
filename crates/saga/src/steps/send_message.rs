use async_trait::async_trait;
use outbox::OutboxRecorder;
use store::{InMemoryStore, TransactionalStore, UnitOfWork};

use super::{ORDER_AGGREGATE, ORDERS_TABLE, STEP_SEND_MESSAGE, keys};
use crate::data::SagaData;
use crate::error::Result;
use crate::step::{SagaStep, SagaStepResult};

pub const ORDER_CONFIRMED: &str = "ORDER_CONFIRMED";
pub const ORDER_CANCELLED: &str = "ORDER_CANCELLED";

/// Outcome of flipping an order's `notified` flag.
enum Announcement {
    Recorded(i64),
    /// The flag was already set; holds the outbox id recorded back then.
    AlreadyRecorded(Option<i64>),
    MissingOrder,
}

/// Announces the order through the outbox.
///
/// The outbox row and the order's `notified` flag commit in one unit of work.
/// Compensation records `ORDER_CANCELLED` the same way. An order whose flag
/// already matches gets no second outbox row.
#[derive(Debug, Clone)]
pub struct SendMessageStep {
    store: InMemoryStore,
    recorder: OutboxRecorder,
}

impl SendMessageStep {
    pub fn new(store: InMemoryStore) -> Self {
        Self {
            store,
            recorder: OutboxRecorder::new(),
        }
    }

    async fn announce(&self, order_id: &str, event_type: &str, notified: bool) -> Result<Announcement> {
        let mut uow = self.store.begin().await?;
        let Some(mut order) = uow.get_row(ORDERS_TABLE, order_id).await else {
            return Ok(Announcement::MissingOrder);
        };
        if order["notified"].as_bool().unwrap_or(false) == notified {
            return Ok(Announcement::AlreadyRecorded(order[MESSAGE_ID_FIELD].as_i64()));
        }

        let payload = serde_json::json!({
            "orderId": order_id,
            "customerName": order["customerName"],
            "productName": order["productName"],
            "amount": order["amount"],
            "status": order["status"],
        });
        let id = self
            .recorder
            .record_json(&mut uow, ORDER_AGGREGATE, order_id, event_type, &payload)
            .await?;

        order["notified"] = serde_json::Value::Bool(notified);
        order[MESSAGE_ID_FIELD] = serde_json::Value::from(id);
        uow.put_row(ORDERS_TABLE, order_id, order);
        uow.commit().await?;
        Ok(Announcement::Recorded(id))
    }
}

/// Order row field holding the id of the last announcement.
const MESSAGE_ID_FIELD: &str = "messageId";

#[async_trait]
impl SagaStep for SendMessageStep {
    fn step_name(&self) -> &str {
        STEP_SEND_MESSAGE
    }

    async fn execute(&self, data: &SagaData) -> Result<SagaStepResult> {
        if data.flag(keys::SHOULD_FAIL_MESSAGE) {
            return Ok(SagaStepResult::failure("Forced message failure"));
        }
        let Some(order_id) = data.get_str(keys::ORDER_ID) else {
            return Ok(SagaStepResult::failure("orderId is required"));
        };

        let message_id = match self.announce(order_id, ORDER_CONFIRMED, true).await? {
            Announcement::Recorded(id) => {
                tracing::info!(order_id, outbox_id = id, "order confirmation recorded");
                Some(id)
            }
            Announcement::AlreadyRecorded(id) => {
                tracing::info!(order_id, outbox_id = ?id, "order confirmation already recorded");
                id
            }
            Announcement::MissingOrder => {
                return Ok(SagaStepResult::failure(format!("order {order_id} not found")));
            }
        };

        Ok(match message_id {
            Some(id) => SagaStepResult::success_with(SagaData::new().with(keys::MESSAGE_ID, id)),
            None => SagaStepResult::success(),
        })
    }

    async fn compensate(&self, data: &SagaData) -> Result<SagaStepResult> {
        let Some(order_id) = data.get_str(keys::ORDER_ID) else {
            return Ok(SagaStepResult::success());
        };

        if let Announcement::Recorded(outbox_id) =
            self.announce(order_id, ORDER_CANCELLED, false).await?
        {
            tracing::info!(order_id, outbox_id, "order cancellation recorded");
        }
        Ok(SagaStepResult::success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::CreateOrderStep;

    async fn created_order(store: &InMemoryStore) -> SagaData {
        let data = SagaData::new()
            .with(keys::ORDER_ID, "o-1")
            .with(keys::CUSTOMER_NAME, "Ada")
            .with(keys::PRODUCT_NAME, "Widget")
            .with(keys::AMOUNT, 25);
        let result = CreateOrderStep::new(store.clone())
            .execute(&data)
            .await
            .unwrap();
        assert!(result.is_success());
        data
    }

    #[tokio::test]
    async fn records_confirmation_with_order_update() {
        let store = InMemoryStore::new();
        let data = created_order(&store).await;
        let step = SendMessageStep::new(store.clone());

        let result = step.execute(&data).await.unwrap();
        assert!(result.is_success());

        let records = store.outbox_records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event_type, ORDER_CONFIRMED);
        let order_id = data.get_str(keys::ORDER_ID).unwrap();
        assert_eq!(records[0].routing_key(), format!("Order.{order_id}"));
        let order = store.get_row(ORDERS_TABLE, order_id).await.unwrap();
        assert_eq!(order["notified"], true);

        step.compensate(&data).await.unwrap();
        let records = store.outbox_records().await;
        assert_eq!(records[1].event_type, ORDER_CANCELLED);
    }

    #[tokio::test]
    async fn replayed_steps_record_each_event_once() {
        let store = InMemoryStore::new();
        let data = created_order(&store).await;
        let step = SendMessageStep::new(store.clone());

        let first = step.execute(&data).await.unwrap().updated_data.unwrap();
        let second = step.execute(&data).await.unwrap();
        assert!(second.is_success());
        let second = second.updated_data.unwrap();
        assert!(first.get_i64(keys::MESSAGE_ID).is_some());
        assert_eq!(
            first.get_i64(keys::MESSAGE_ID),
            second.get_i64(keys::MESSAGE_ID)
        );
        assert_eq!(store.outbox_records().await.len(), 1);

        step.compensate(&data).await.unwrap();
        step.compensate(&data).await.unwrap();
        let events: Vec<_> = store
            .outbox_records()
            .await
            .into_iter()
            .map(|r| r.event_type)
            .collect();
        assert_eq!(events, vec![ORDER_CONFIRMED, ORDER_CANCELLED]);
    }

    #[tokio::test]
    async fn forced_failure_records_nothing() {
        let store = InMemoryStore::new();
        let data = created_order(&store)
            .await
            .with(keys::SHOULD_FAIL_MESSAGE, true);

        let result = SendMessageStep::new(store.clone())
            .execute(&data)
            .await
            .unwrap();
        assert!(!result.is_success());
        assert!(store.outbox_records().await.is_empty());
    }
}
