use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use engine::{EventOutcome, TriggerEvent};
use serde::Deserialize;
use serde_json::Value;

use crate::{ApiError, AppState};

#[derive(Debug, Deserialize)]
pub struct GitPushDto {
    /// Branch name; a full `refs/heads/...` ref is accepted too.
    #[serde(alias = "ref")]
    pub branch: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

pub async fn handle_webhook(
    Path(path): Path<String>,
    State(state): State<AppState>,
    body: Option<Json<Value>>,
) -> Result<(StatusCode, Json<Vec<EventOutcome>>), ApiError> {
    let event = TriggerEvent::Webhook {
        path: path.clone(),
        params: body.map(|Json(v)| flatten_params(&v)).unwrap_or_default(),
    };

    if state.coordinator.definitions().matching(&event).is_empty() {
        return Err(ApiError::NotFound(format!("no workflow listens on webhook path '{path}'")));
    }

    respond(state.coordinator.handle_event(event).await)
}

pub async fn git_push(
    State(state): State<AppState>,
    Json(dto): Json<GitPushDto>,
) -> Result<(StatusCode, Json<Vec<EventOutcome>>), ApiError> {
    let branch = dto
        .branch
        .strip_prefix("refs/heads/")
        .unwrap_or(&dto.branch)
        .to_string();
    if branch.is_empty() {
        return Err(ApiError::BadRequest("branch must not be empty".into()));
    }

    let event = TriggerEvent::GitPush {
        branch,
        params: dto.params,
    };
    respond(state.coordinator.handle_event(event).await)
}

/// 409 when every matched workflow was already running, 202 otherwise.
fn respond(outcomes: Vec<EventOutcome>) -> Result<(StatusCode, Json<Vec<EventOutcome>>), ApiError> {
    let all_rejected = !outcomes.is_empty() && outcomes.iter().all(|o| o.execution_id.is_none());
    let status = if all_rejected {
        StatusCode::CONFLICT
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(outcomes)))
}

/// Top-level fields of a JSON object body become run parameters. Strings
/// are taken as-is, everything else in its JSON form.
fn flatten_params(body: &Value) -> BTreeMap<String, String> {
    let Some(object) = body.as_object() else {
        return BTreeMap::new();
    };
    object
        .iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (key.clone(), value)
        })
        .collect()
}
