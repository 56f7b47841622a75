//! HTTP error mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use engine::EngineError;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Engine(err) => match err {
                EngineError::UnknownWorkflow(_)
                | EngineError::UnknownExecution(_)
                | EngineError::UnknownTask(_) => StatusCode::NOT_FOUND,
                EngineError::WorkflowLocked(_) => StatusCode::CONFLICT,
                EngineError::InvalidCronExpression { .. }
                | EngineError::InvalidCondition { .. }
                | EngineError::InvalidDefinition { .. }
                | EngineError::Parse { .. } => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("request failed: {self}");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
