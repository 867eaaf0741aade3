//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container for efficiency.
//! Run with:
//!
//! ```bash
//! cargo test -p store --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;

use chrono::{Duration, Utc};
use serial_test::serial;
use sqlx::PgPool;
use store::{
    InboxStore, NewOutboxRecord, OutboxStatus, OutboxStore, PostgresStore, SagaRepository,
    SagaStatus, SagaTransaction, StoreError, TransactionalStore, UnitOfWork, Version,
};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!("../../../migrations/001_create_saga_tables.sql"))
                .execute(&temp_pool)
                .await
                .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh store with its own pool and cleared tables
async fn get_test_store() -> PostgresStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE saga_transactions, outbox, inbox RESTART IDENTITY")
        .execute(&pool)
        .await
        .unwrap();

    PostgresStore::new(pool)
}

fn new_saga(business_id: &str) -> SagaTransaction {
    SagaTransaction::new(
        "CREATE_ORDER",
        business_id,
        vec![
            "CREATE_ORDER".to_string(),
            "SEND_MESSAGE".to_string(),
            "UPDATE_ORDER_STATUS".to_string(),
        ],
        serde_json::json!({"schema_version": 1, "data": {"amount": 10}}),
    )
}

#[tokio::test]
#[serial]
async fn insert_and_load_saga() {
    let store = get_test_store().await;
    let saga = new_saga("order-1");
    store.insert_saga(&saga).await.unwrap();

    let loaded = store.load_saga(saga.id).await.unwrap().unwrap();
    assert_eq!(loaded.id, saga.id);
    assert_eq!(loaded.steps, saga.steps);
    assert_eq!(loaded.status, SagaStatus::Started);
    assert_eq!(loaded.context, saga.context);
    assert_eq!(loaded.version, Version::initial());

    let by_business = store.find_by_business_id("order-1").await.unwrap().unwrap();
    assert_eq!(by_business.id, saga.id);
}

#[tokio::test]
#[serial]
async fn duplicate_saga_insert_is_rejected() {
    let store = get_test_store().await;
    let saga = new_saga("order-1");
    store.insert_saga(&saga).await.unwrap();
    let result = store.insert_saga(&saga).await;
    assert!(matches!(result, Err(StoreError::DuplicateKey(_))));
}

#[tokio::test]
#[serial]
async fn stale_update_is_a_conflict() {
    let store = get_test_store().await;
    let mut saga = new_saga("order-1");
    store.insert_saga(&saga).await.unwrap();

    saga.status = SagaStatus::Executing;
    saga.current_step = 1;
    let v1 = store.update_saga(&saga).await.unwrap();
    assert_eq!(v1, Version::new(1));

    let result = store.update_saga(&saga).await;
    assert!(matches!(
        result,
        Err(StoreError::ConcurrencyConflict { actual, .. }) if actual == v1
    ));
}

#[tokio::test]
#[serial]
async fn update_of_deleted_saga_is_not_found() {
    let store = get_test_store().await;
    let saga = new_saga("order-1");
    let result = store.update_saga(&saga).await;
    assert!(matches!(result, Err(StoreError::SagaNotFound(_))));
}

#[tokio::test]
#[serial]
async fn concurrent_claims_have_one_winner() {
    let store = get_test_store().await;
    let mut saga = new_saga("order-1");
    saga.status = SagaStatus::Executing;
    saga.updated_at = Utc::now() - Duration::minutes(10);
    store.insert_saga(&saga).await.unwrap();

    let now = Utc::now();
    let (a, b) = tokio::join!(
        store.claim_saga(saga.id, saga.version, SagaStatus::Executing, now),
        store.claim_saga(saga.id, saga.version, SagaStatus::Executing, now),
    );
    let winners = [a.unwrap(), b.unwrap()]
        .into_iter()
        .filter(Option::is_some)
        .count();
    assert_eq!(winners, 1);
}

#[tokio::test]
#[serial]
async fn find_stale_and_retention() {
    let store = get_test_store().await;
    let old = Utc::now() - Duration::days(8);

    let mut stale = new_saga("a");
    stale.status = SagaStatus::Compensating;
    stale.updated_at = old;
    store.insert_saga(&stale).await.unwrap();

    let mut done = new_saga("b");
    done.status = SagaStatus::Completed;
    done.updated_at = old;
    store.insert_saga(&done).await.unwrap();

    let found = store
        .find_stale(&SagaStatus::RECOVERABLE, Utc::now() - Duration::minutes(5), 10)
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, stale.id);

    let deleted = store
        .delete_sagas_before(&SagaStatus::RETAINABLE, Utc::now() - Duration::days(7), 1000)
        .await
        .unwrap();
    assert_eq!(deleted, 1);

    let counts = store.count_sagas_by_status().await.unwrap();
    assert_eq!(counts.get(&SagaStatus::Compensating), Some(&1));
    assert_eq!(counts.get(&SagaStatus::Completed), None);
}

#[tokio::test]
#[serial]
async fn outbox_rows_commit_with_the_unit() {
    let store = get_test_store().await;

    let mut uow = store.begin().await.unwrap();
    let first = uow
        .insert_outbox(NewOutboxRecord::new("Order", "1", "ORDER_CREATED", b"{}".to_vec()))
        .await
        .unwrap();
    let second = uow
        .insert_outbox(NewOutboxRecord::new("Order", "1", "ORDER_CONFIRMED", b"{}".to_vec()))
        .await
        .unwrap();
    uow.commit().await.unwrap();
    assert!(first < second);

    let mut uow = store.begin().await.unwrap();
    uow.insert_outbox(NewOutboxRecord::new("Order", "2", "ORDER_CREATED", b"{}".to_vec()))
        .await
        .unwrap();
    uow.rollback().await.unwrap();

    let unsent = store.fetch_unsent(50).await.unwrap();
    assert_eq!(unsent.iter().map(|r| r.id).collect::<Vec<_>>(), vec![first, second]);

    store.record_failure(first, "timeout").await.unwrap();
    assert!(store.mark_sent(first, Utc::now()).await.unwrap());
    assert!(!store.mark_sent(first, Utc::now()).await.unwrap());

    let record = store.load_outbox(first).await.unwrap().unwrap();
    assert_eq!(record.status, OutboxStatus::Sent);
    assert_eq!(record.attempts, 1);
    assert!(record.sent_at.is_some());

    let removed = store
        .delete_sent_before(Utc::now() + Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(removed, 1);
    let counts = store.count_outbox_by_status().await.unwrap();
    assert_eq!(counts.get(&OutboxStatus::New), Some(&1));
}

#[tokio::test]
#[serial]
async fn business_write_and_outbox_share_the_transaction() {
    let store = get_test_store().await;
    sqlx::query("CREATE TABLE IF NOT EXISTS widgets (id TEXT PRIMARY KEY)")
        .execute(store.pool())
        .await
        .unwrap();
    sqlx::query("TRUNCATE TABLE widgets")
        .execute(store.pool())
        .await
        .unwrap();

    let mut uow = store.begin().await.unwrap();
    sqlx::query("INSERT INTO widgets (id) VALUES ('w-1')")
        .execute(uow.connection())
        .await
        .unwrap();
    uow.insert_outbox(NewOutboxRecord::new("Widget", "w-1", "WIDGET_CREATED", b"{}".to_vec()))
        .await
        .unwrap();
    drop(uow);

    let widgets: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM widgets")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(widgets, 0);
    assert!(store.fetch_unsent(10).await.unwrap().is_empty());
}

#[tokio::test]
#[serial]
async fn inbox_deduplicates_across_transactions() {
    let store = get_test_store().await;

    let mut uow = store.begin().await.unwrap();
    assert!(uow.insert_inbox("msg-1", Utc::now()).await.unwrap());
    uow.commit().await.unwrap();

    let mut uow = store.begin().await.unwrap();
    assert!(!uow.insert_inbox("msg-1", Utc::now()).await.unwrap());
    uow.rollback().await.unwrap();

    assert!(store.load_inbox("msg-1").await.unwrap().is_some());
    let removed = store
        .delete_processed_before(Utc::now() + Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(removed, 1);
}
