//! Saga inspection and start endpoints.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use common::SagaId;
use saga::{SagaData, saga_statistics};
use serde::{Deserialize, Serialize};
use store::{SagaRepository, SagaTransaction};

use crate::AppState;
use crate::error::ApiError;

// -- Request types --

#[derive(Deserialize)]
pub struct StartSagaRequest {
    pub saga_type: String,
    pub business_id: String,
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
}

// -- Response types --

#[derive(Serialize)]
pub struct SagaResponse {
    pub id: String,
    pub saga_type: String,
    pub business_id: String,
    pub status: String,
    pub steps: Vec<String>,
    pub current_step: usize,
    pub context: serde_json::Value,
    pub error_message: Option<String>,
    pub failed_compensations: Vec<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<SagaTransaction> for SagaResponse {
    fn from(saga: SagaTransaction) -> Self {
        Self {
            id: saga.id.to_string(),
            saga_type: saga.saga_type,
            business_id: saga.business_id,
            status: saga.status.to_string(),
            steps: saga.steps,
            current_step: saga.current_step,
            context: saga.context,
            error_message: saga.error_message,
            failed_compensations: saga.failed_compensations,
            version: saga.version.as_i64(),
            created_at: saga.created_at,
            updated_at: saga.updated_at,
            completed_at: saga.completed_at,
        }
    }
}

#[derive(Serialize)]
pub struct SagaStatsResponse {
    pub total: u64,
    pub by_status: BTreeMap<String, u64>,
}

// -- Handlers --

/// POST /sagas: starts a saga of a registered type and runs it to a
/// terminal state.
pub async fn start<R: SagaRepository + 'static>(
    State(state): State<Arc<AppState<R>>>,
    Json(req): Json<StartSagaRequest>,
) -> Result<(StatusCode, Json<SagaResponse>), ApiError> {
    if req.business_id.trim().is_empty() {
        return Err(ApiError::BadRequest("business_id is required".to_string()));
    }

    let context = SagaData::from(req.context);
    let saga = state
        .orchestrator
        .start_registered(&state.registry, &req.saga_type, &req.business_id, context)
        .await?;

    Ok((StatusCode::CREATED, Json(SagaResponse::from(saga))))
}

/// GET /sagas/{id}: returns the durable saga record.
pub async fn get<R: SagaRepository + 'static>(
    State(state): State<Arc<AppState<R>>>,
    Path(id): Path<String>,
) -> Result<Json<SagaResponse>, ApiError> {
    let saga_id =
        SagaId::parse(&id).map_err(|e| ApiError::BadRequest(format!("invalid saga id: {e}")))?;

    let saga = state
        .orchestrator
        .repository()
        .load_saga(saga_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("saga {id} not found")))?;

    Ok(Json(SagaResponse::from(saga)))
}

/// GET /sagas/by-business/{business_id}: looks a saga up by its
/// correlation key.
pub async fn get_by_business_id<R: SagaRepository + 'static>(
    State(state): State<Arc<AppState<R>>>,
    Path(business_id): Path<String>,
) -> Result<Json<SagaResponse>, ApiError> {
    let saga = state
        .orchestrator
        .repository()
        .find_by_business_id(&business_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no saga for business id {business_id}")))?;

    Ok(Json(SagaResponse::from(saga)))
}

/// GET /sagas/stats: saga counts per status.
pub async fn stats<R: SagaRepository + 'static>(
    State(state): State<Arc<AppState<R>>>,
) -> Result<Json<SagaStatsResponse>, ApiError> {
    let stats = saga_statistics(state.orchestrator.repository()).await?;
    Ok(Json(SagaStatsResponse {
        total: stats.total,
        by_status: stats.by_status,
    }))
}
