use axum::{extract::State, http::StatusCode, Json};
use engine::{ScheduledTask, TaskSpec};

use crate::{ApiError, AppState};

pub async fn list(State(state): State<AppState>) -> Json<Vec<ScheduledTask>> {
    Json(state.scheduler.list_tasks())
}

pub async fn create(
    State(state): State<AppState>,
    Json(spec): Json<TaskSpec>,
) -> Result<(StatusCode, Json<ScheduledTask>), ApiError> {
    let task = state.scheduler.schedule_task(spec).await?;
    Ok((StatusCode::CREATED, Json(task)))
}
