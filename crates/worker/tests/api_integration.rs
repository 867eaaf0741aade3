//! Integration tests for the worker's HTTP surface.

use std::sync::{Arc, OnceLock};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::steps::{ORDER_SAGA_TYPE, ORDERS_TABLE, order_registry};
use saga::{OrchestratorConfig, SagaOrchestrator};
use store::InMemoryStore;
use tower::ServiceExt;
use worker::AppState;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            builder
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

fn setup() -> (axum::Router, InMemoryStore) {
    let store = InMemoryStore::new();
    let registry = order_registry(store.clone()).unwrap();
    let orchestrator = SagaOrchestrator::new(store.clone(), OrchestratorConfig::default());
    let state = Arc::new(AppState::new(Arc::new(orchestrator), Arc::new(registry)));
    (worker::create_app(state, get_metrics_handle()), store)
}

async fn send(
    app: &axum::Router,
    request: Request<Body>,
) -> (StatusCode, serde_json::Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if body.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_saga(body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/sagas")
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

fn order_request(business_id: &str, extra: serde_json::Value) -> serde_json::Value {
    let mut context = serde_json::json!({
        "orderId": format!("o-{business_id}"),
        "customerName": "Ada",
        "productName": "Widget",
        "amount": 42.5,
    });
    if let (Some(ctx), Some(extra)) = (context.as_object_mut(), extra.as_object()) {
        ctx.extend(extra.clone());
    }
    serde_json::json!({
        "saga_type": ORDER_SAGA_TYPE,
        "business_id": business_id,
        "context": context,
    })
}

#[tokio::test]
async fn test_health_check() {
    let (app, _) = setup();

    let (status, json) = send(&app, get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["store"], "up");
}

#[tokio::test]
async fn test_start_order_saga_completes() {
    let (app, store) = setup();

    let (status, json) = send(&app, post_saga(order_request("order-1", serde_json::json!({})))).await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(json["status"], "COMPLETED");
    assert_eq!(json["business_id"], "order-1");
    assert_eq!(json["current_step"], 3);
    assert_eq!(
        json["steps"],
        serde_json::json!(["CREATE_ORDER", "SEND_MESSAGE", "UPDATE_ORDER_STATUS"])
    );
    assert!(json["completed_at"].is_string());

    let order_id = json["context"]["data"]["orderId"].as_str().unwrap();
    let order = store.get_row(ORDERS_TABLE, order_id).await.unwrap();
    assert_eq!(order["status"], "CONFIRMED");
    assert_eq!(store.outbox_records().await.len(), 1);
}

#[tokio::test]
async fn test_start_order_saga_compensates_on_failure() {
    let (app, store) = setup();

    let (status, json) = send(
        &app,
        post_saga(order_request(
            "order-2",
            serde_json::json!({ "shouldFailUpdate": true }),
        )),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(json["status"], "COMPENSATED");
    assert_eq!(json["current_step"], 0);
    assert!(json["error_message"].is_string());
    assert_eq!(store.row_count(ORDERS_TABLE).await, 0);
}

#[tokio::test]
async fn test_start_unknown_saga_type_is_bad_request() {
    let (app, store) = setup();

    let (status, json) = send(
        &app,
        post_saga(serde_json::json!({
            "saga_type": "REFUND",
            "business_id": "r-1",
        })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("REFUND"));
    assert_eq!(store.saga_count().await, 0);
}

#[tokio::test]
async fn test_start_without_business_id_is_bad_request() {
    let (app, _) = setup();

    let (status, _) = send(&app, post_saga(order_request("  ", serde_json::json!({})))).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_start_with_store_down_is_internal_error() {
    let (app, store) = setup();
    store.set_fail_on_saga_write(true);

    let (status, json) = send(&app, post_saga(order_request("order-3", serde_json::json!({})))).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(json["error"].is_string());
}

#[tokio::test]
async fn test_get_saga_by_id() {
    let (app, _) = setup();
    let (_, created) = send(&app, post_saga(order_request("order-4", serde_json::json!({})))).await;
    let id = created["id"].as_str().unwrap();

    let (status, json) = send(&app, get(&format!("/sagas/{id}"))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["id"], id);
    assert_eq!(json["saga_type"], ORDER_SAGA_TYPE);
    assert_eq!(json["status"], "COMPLETED");
    assert_eq!(json["version"], created["version"]);
}

#[tokio::test]
async fn test_get_saga_by_business_id() {
    let (app, _) = setup();
    let (_, created) = send(&app, post_saga(order_request("order-5", serde_json::json!({})))).await;

    let (status, json) = send(&app, get("/sagas/by-business/order-5")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["id"], created["id"]);

    let (status, _) = send(&app, get("/sagas/by-business/missing")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_get_unknown_saga_is_not_found() {
    let (app, _) = setup();

    let (status, json) = send(&app, get(&format!("/sagas/{}", common::SagaId::new()))).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(json["error"].is_string());
}

#[tokio::test]
async fn test_get_saga_with_malformed_id_is_bad_request() {
    let (app, _) = setup();

    let (status, _) = send(&app, get("/sagas/not-a-uuid")).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_saga_stats() {
    let (app, _) = setup();
    send(&app, post_saga(order_request("s-1", serde_json::json!({})))).await;
    send(&app, post_saga(order_request("s-2", serde_json::json!({})))).await;
    send(
        &app,
        post_saga(order_request(
            "s-3",
            serde_json::json!({ "shouldFailMessage": true }),
        )),
    )
    .await;

    let (status, json) = send(&app, get("/sagas/stats")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["total"], 3);
    assert_eq!(json["by_status"]["COMPLETED"], 2);
    assert_eq!(json["by_status"]["COMPENSATED"], 1);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let (app, _) = setup();
    send(&app, post_saga(order_request("m-1", serde_json::json!({})))).await;

    let response = app.oneshot(get("/metrics")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.starts_with("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("saga_started_total"));
}
