//! Engine-level error types.

use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

/// Errors produced by the orchestration engine.
///
/// Only trigger-time and configuration problems surface through this type.
/// Step failures, rollback failures and notification failures are recorded
/// on the [`ExecutionRecord`](crate::models::ExecutionRecord) or logged; they
/// never abort the caller of `trigger`.
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Validation errors ------

    /// A cron expression could not be parsed or can never fire.
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    /// A step or trigger condition could not be parsed.
    #[error("invalid condition '{expression}': {reason}")]
    InvalidCondition { expression: String, reason: String },

    /// A workflow or scheduled task definition violates a structural rule.
    #[error("invalid definition '{name}': {reason}")]
    InvalidDefinition { name: String, reason: String },

    /// A definition file could not be parsed.
    #[error("cannot parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    // ------ Trigger errors ------

    /// No workflow with this name is loaded.
    #[error("unknown workflow '{0}'")]
    UnknownWorkflow(String),

    /// A run of this workflow is already in progress.
    #[error("workflow '{0}' is already running")]
    WorkflowLocked(String),

    // ------ Lookup errors ------

    #[error("unknown execution '{0}'")]
    UnknownExecution(Uuid),

    #[error("unknown scheduled task '{0}'")]
    UnknownTask(String),

    // ------ Infrastructure errors ------

    /// Persistence error from the db crate.
    #[error("database error: {0}")]
    Database(#[from] db::DbError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The task driving an execution panicked or was aborted.
    #[error("execution task failed: {0}")]
    Join(String),
}

impl EngineError {
    pub(crate) fn invalid(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidDefinition {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn cron(expression: &str, reason: impl Into<String>) -> Self {
        Self::InvalidCronExpression {
            expression: expression.to_string(),
            reason: reason.into(),
        }
    }
}
