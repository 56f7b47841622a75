use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use engine::{ExecutionSummary, RunContext, TriggerType};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{ApiError, AppState};

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkflowListing {
    pub name: String,
    pub version: u64,
    pub trigger: TriggerType,
    pub steps: usize,
    pub running: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct RunWorkflowDto {
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RunAccepted {
    pub execution_id: Uuid,
}

pub async fn list(State(state): State<AppState>) -> Json<Vec<WorkflowListing>> {
    let coordinator = &state.coordinator;
    let listings = coordinator
        .definitions()
        .list()
        .into_iter()
        .map(|def| WorkflowListing {
            running: coordinator.is_running(&def.name),
            name: def.name.clone(),
            version: def.version,
            trigger: def.trigger.kind.trigger_type(),
            steps: def.steps.len(),
        })
        .collect();
    Json(listings)
}

pub async fn run(
    Path(name): Path<String>,
    State(state): State<AppState>,
    body: Option<Json<RunWorkflowDto>>,
) -> Result<(StatusCode, Json<RunAccepted>), ApiError> {
    let dto = body.map(|Json(dto)| dto).unwrap_or_default();
    let ctx = RunContext::manual().with_params(dto.params);
    let execution_id = state.coordinator.trigger(&name, ctx).await?;
    Ok((StatusCode::ACCEPTED, Json(RunAccepted { execution_id })))
}

pub async fn executions(
    Path(name): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Vec<ExecutionSummary>>, ApiError> {
    Ok(Json(state.coordinator.status(Some(&name)).await?))
}
