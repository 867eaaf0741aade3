//! Saga worker: runs the background machinery around the saga engine and
//! exposes an operational HTTP surface.
//!
//! Background tasks (each single-flight):
//! - outbox relay and sent-row retention
//! - inbox dedup-key cleanup
//! - stale saga recovery, terminal saga retention and statistics logging
//!
//! HTTP endpoints: `/health`, `/metrics`, and `/sagas` for starting and
//! inspecting sagas.

pub mod config;
pub mod consumer;
pub mod error;
pub mod routes;
pub mod scheduler;
pub mod tasks;

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use outbox::{ChannelTransport, InboxDeduplicator};
use saga::{SagaOrchestrator, StepRegistry};
use store::{InboxStore, OutboxStore, SagaRepository, TransactionalStore};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;

/// Shared application state accessible from all handlers.
pub struct AppState<R: SagaRepository> {
    pub orchestrator: Arc<SagaOrchestrator<R>>,
    pub registry: Arc<StepRegistry>,
}

impl<R: SagaRepository> AppState<R> {
    pub fn new(orchestrator: Arc<SagaOrchestrator<R>>, registry: Arc<StepRegistry>) -> Self {
        Self {
            orchestrator,
            registry,
        }
    }
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<R: SagaRepository + 'static>(
    state: Arc<AppState<R>>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check::<R>))
        .route("/sagas", post(routes::sagas::start::<R>))
        .route("/sagas/stats", get(routes::sagas::stats::<R>))
        .route("/sagas/{id}", get(routes::sagas::get::<R>))
        .route(
            "/sagas/by-business/{business_id}",
            get(routes::sagas::get_by_business_id::<R>),
        )
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Runs the worker against `store` until `shutdown` resolves.
///
/// Serves HTTP, spawns the background tasks and the local event consumer,
/// then on shutdown stops the server, signals every task and waits for
/// in-flight runs to finish.
pub async fn run<S>(
    config: Config,
    store: S,
    registry: StepRegistry,
    metrics_handle: PrometheusHandle,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()>
where
    S: SagaRepository + OutboxStore + InboxStore + TransactionalStore + Clone + 'static,
{
    let orchestrator = Arc::new(SagaOrchestrator::new(
        store.clone(),
        config.orchestrator_config(),
    ));
    let registry = Arc::new(registry);
    let (transport, receiver) = ChannelTransport::new(config.outbox_batch_size.max(1));
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let mut handles = tasks::spawn_background_tasks(
        &config,
        store.clone(),
        Arc::clone(&orchestrator),
        Arc::clone(&registry),
        transport,
        shutdown_rx.clone(),
    );
    handles.push(consumer::spawn_consumer(
        InboxDeduplicator::new(store),
        receiver,
        shutdown_rx,
    ));

    let state = Arc::new(AppState::new(orchestrator, registry));
    let app = create_app(state, metrics_handle);

    let addr = config.addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "starting saga worker");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;

    // Stop background work even if the server failed
    let _ = shutdown_tx.send(true);
    for result in futures_util::future::join_all(handles).await {
        if let Err(e) = result {
            tracing::error!(error = %e, "background task panicked");
        }
    }

    served
}
