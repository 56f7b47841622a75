use axum::{
    extract::{Path, Query, State},
    Json,
};
use engine::{ExecutionRecord, ExecutionSummary};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{ApiError, AppState};

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub workflow: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub execution_id: Uuid,
    pub cancelled: bool,
}

pub async fn list(
    Query(query): Query<ListQuery>,
    State(state): State<AppState>,
) -> Result<Json<Vec<ExecutionSummary>>, ApiError> {
    Ok(Json(state.coordinator.status(query.workflow.as_deref()).await?))
}

pub async fn get(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<ExecutionRecord>, ApiError> {
    Ok(Json(state.coordinator.execution(id).await?))
}

pub async fn cancel(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<CancelResponse>, ApiError> {
    let cancelled = state.coordinator.cancel(id).await?;
    Ok(Json(CancelResponse {
        execution_id: id,
        cancelled,
    }))
}
