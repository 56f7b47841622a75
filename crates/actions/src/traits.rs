//! The `ActionRunner` trait: the contract every action implementation must fulfil.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{ActionError, StepAction};

/// Context passed to every runner for one attempt of one step.
///
/// Defined here (in the actions crate) so both the engine and the runner
/// implementations can import it without a circular dependency.
#[derive(Debug, Clone)]
pub struct ActionContext {
    /// Name of the workflow (or scheduled task) being executed.
    pub workflow_name: String,
    /// ID of the current execution run.
    pub execution_id: uuid::Uuid,
    /// Name of the step being executed.
    pub step_name: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Trigger parameters (branch, overrides, webhook fields, ...).
    pub params: BTreeMap<String, String>,
    /// Extra environment variables for spawned processes.
    pub environment: BTreeMap<String, String>,
    /// Directory relative script paths are resolved against.
    pub working_dir: Option<PathBuf>,
}

impl ActionContext {
    pub fn new(workflow_name: impl Into<String>, execution_id: uuid::Uuid) -> Self {
        Self {
            workflow_name: workflow_name.into(),
            execution_id,
            step_name: String::new(),
            attempt: 1,
            params: BTreeMap::new(),
            environment: BTreeMap::new(),
            working_dir: None,
        }
    }

    /// Environment handed to child processes: the configured variables plus
    /// `ORCHESTRATOR_*` run metadata and one `ORCHESTRATOR_PARAM_<KEY>` per
    /// trigger parameter.
    pub fn process_env(&self) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = self
            .environment
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        env.push(("ORCHESTRATOR_WORKFLOW".into(), self.workflow_name.clone()));
        env.push(("ORCHESTRATOR_EXECUTION_ID".into(), self.execution_id.to_string()));
        env.push(("ORCHESTRATOR_STEP".into(), self.step_name.clone()));
        env.push(("ORCHESTRATOR_ATTEMPT".into(), self.attempt.to_string()));

        for (key, value) in &self.params {
            let key: String = key
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
                .collect();
            env.push((format!("ORCHESTRATOR_PARAM_{key}"), value.clone()));
        }

        env
    }
}

/// What a successful action produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionOutput {
    /// Captured (and possibly truncated) output.
    pub output: String,
    /// Process exit code, when the action spawned a process.
    pub exit_code: Option<i32>,
}

impl ActionOutput {
    pub fn text(output: impl Into<String>) -> Self {
        Self { output: output.into(), exit_code: None }
    }
}

/// The core action trait.
///
/// Implementations must be cancel-safe: the step executor enforces timeouts
/// and operator aborts by dropping the returned future, so any spawned
/// process has to die with it.
#[async_trait]
pub trait ActionRunner: Send + Sync {
    async fn run(
        &self,
        action: &StepAction,
        ctx: &ActionContext,
    ) -> Result<ActionOutput, ActionError>;
}
