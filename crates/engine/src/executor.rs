//! Step execution engine.
//!
//! `StepExecutor` runs exactly one step:
//! 1. Looks up the `ActionRunner` registered for the step's action kind.
//! 2. Runs each attempt under the step timeout. On expiry the action
//!    future is dropped, which kills any child process.
//! 3. Retries `Failed` and `Timeout` attempts up to `max_attempts`, sleeping
//!    `backoff_ms * 2^(n-1)` between attempts.
//! 4. Never retries `Fatal` errors or cancellation.
//!
//! It never returns an error: every outcome is a [`StepResult`]. A runner
//! that panics fails its step as `Fatal`; the panic does not reach the run.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use actions::{ActionContext, ActionRegistry};

use crate::models::{Step, StepError, StepErrorKind, StepResult};

/// Runs single steps through the action registry.
#[derive(Debug, Clone)]
pub struct StepExecutor {
    registry: Arc<ActionRegistry>,
}

impl StepExecutor {
    pub fn new(registry: Arc<ActionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    /// Run `step` to completion (success, final failure, or cancellation).
    ///
    /// `base` carries the run-level context; the step name and attempt
    /// number are filled in per attempt. The returned duration covers every
    /// attempt and the backoff sleeps between them.
    pub async fn execute(
        &self,
        step: &Step,
        base: &ActionContext,
        cancel: &CancellationToken,
    ) -> StepResult {
        let started = Instant::now();

        let Some(runner) = self.registry.runner_for(&step.action) else {
            let err = StepError::new(
                StepErrorKind::Fatal,
                format!("no runner registered for action '{}'", step.action.kind()),
            );
            warn!(step = %step.name, "{}", err.message);
            return StepResult::failed(&step.name, err, started.elapsed(), 0);
        };

        let timeout = step.timeout();
        let max_attempts = step.max_attempts();
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let mut ctx = base.clone();
            ctx.step_name = step.name.clone();
            ctx.attempt = attempt;

            debug!(step = %step.name, attempt, max_attempts, "starting attempt");

            let attempt_future = AssertUnwindSafe(runner.run(&step.action, &ctx)).catch_unwind();
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(StepError::cancelled()),
                res = tokio::time::timeout(timeout, attempt_future) => match res {
                    Ok(Ok(Ok(output))) => Ok(output),
                    Ok(Ok(Err(err))) => Err(StepError::from(err)),
                    Ok(Err(panic)) => Err(StepError::new(
                        StepErrorKind::Fatal,
                        format!("action panicked: {}", panic_message(panic.as_ref())),
                    )),
                    Err(_) => Err(StepError::timeout(timeout)),
                },
            };

            let err = match outcome {
                Ok(output) => {
                    info!(step = %step.name, attempt, "step succeeded");
                    return StepResult::succeeded(&step.name, output.output, started.elapsed(), attempt);
                }
                Err(err) => err,
            };

            if attempt >= max_attempts || !err.kind.is_retryable() {
                warn!(step = %step.name, attempt, kind = ?err.kind, "step failed: {}", err.message);
                return StepResult::failed(&step.name, err, started.elapsed(), attempt);
            }

            let delay = step
                .retry
                .map(|policy| policy.delay_after(attempt))
                .unwrap_or_default();

            warn!(
                step = %step.name,
                attempt,
                max_attempts,
                kind = ?err.kind,
                "attempt failed, retrying in {:?}: {}",
                delay,
                err.message
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return StepResult::failed(&step.name, StepError::cancelled(), started.elapsed(), attempt);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
