//! Failure-triggered rollback.

use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use actions::ActionContext;

use crate::executor::StepExecutor;
use crate::models::{Step, StepResult, StepStatus};

/// Runs a workflow's rollback steps after a forward failure.
///
/// Every rollback step runs, in the order listed, whatever happened to the
/// ones before it. Step conditions are not evaluated and the run's
/// cancellation token does not apply, so an operator abort still gets its
/// cleanup.
#[derive(Debug, Clone)]
pub struct RollbackManager {
    executor: StepExecutor,
}

impl RollbackManager {
    pub fn new(executor: StepExecutor) -> Self {
        Self { executor }
    }

    #[instrument(skip_all, fields(workflow = %ctx.workflow_name, execution_id = %ctx.execution_id))]
    pub async fn rollback(&self, steps: &[Step], ctx: &ActionContext) -> Vec<StepResult> {
        info!(steps = steps.len(), "rolling back");

        let detached = CancellationToken::new();
        let mut results = Vec::with_capacity(steps.len());

        for step in steps {
            let result = self.executor.execute(step, ctx, &detached).await;
            if result.status == StepStatus::Failed {
                let message = result.error.as_ref().map(|e| e.message.as_str()).unwrap_or_default();
                error!(step = %step.name, "rollback step failed: {message}");
            }
            results.push(result);
        }

        results
    }
}
