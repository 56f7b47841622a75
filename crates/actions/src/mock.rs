//! `MockAction` — a test double for `ActionRunner`.
//!
//! Useful in unit and integration tests where spawning real processes is
//! either unavailable or irrelevant. Behaviour is scripted per step name,
//! with a default for steps that have no explicit script.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{ActionContext, ActionError, ActionOutput, ActionRunner, StepAction};

/// Behaviour injected into `MockAction` at construction time.
#[derive(Debug, Clone)]
pub enum MockBehaviour {
    /// Succeed with the given output.
    Succeed(String),
    /// Fail with a `Retryable` error.
    FailRetryable(String),
    /// Fail with a `Fatal` error.
    FailFatal(String),
    /// Sleep (on the tokio clock), then succeed.
    Sleep(Duration),
    /// Fail with a `Retryable` error for the first `n` calls, then succeed.
    FailTimes(u32, String),
    /// Panic with the given message, like a buggy runner would.
    Panic(String),
}

/// One recorded invocation.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub step: String,
    pub attempt: u32,
    pub action: StepAction,
}

/// A mock runner that records every call it receives and behaves as scripted.
#[derive(Clone)]
pub struct MockAction {
    default: MockBehaviour,
    per_step: HashMap<String, MockBehaviour>,
    calls: Arc<Mutex<Vec<MockCall>>>,
}

impl Default for MockAction {
    fn default() -> Self {
        Self::succeeding()
    }
}

impl MockAction {
    /// Every step succeeds with output `"ok"`.
    pub fn succeeding() -> Self {
        Self::with_default(MockBehaviour::Succeed("ok".into()))
    }

    pub fn with_default(default: MockBehaviour) -> Self {
        Self {
            default,
            per_step: HashMap::new(),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Script the behaviour of one step by name.
    pub fn on_step(mut self, step: impl Into<String>, behaviour: MockBehaviour) -> Self {
        self.per_step.insert(step.into(), behaviour);
        self
    }

    /// Every call, in order.
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    /// Names of executed steps, in call order (retries repeat the name).
    pub fn executed_steps(&self) -> Vec<String> {
        self.calls.lock().iter().map(|c| c.step.clone()).collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn call_count_for(&self, step: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.step == step).count()
    }
}

#[async_trait]
impl ActionRunner for MockAction {
    async fn run(
        &self,
        action: &StepAction,
        ctx: &ActionContext,
    ) -> Result<ActionOutput, ActionError> {
        let previous = {
            let mut calls = self.calls.lock();
            let previous = calls.iter().filter(|c| c.step == ctx.step_name).count() as u32;
            calls.push(MockCall {
                step: ctx.step_name.clone(),
                attempt: ctx.attempt,
                action: action.clone(),
            });
            previous
        };

        let behaviour = self.per_step.get(&ctx.step_name).unwrap_or(&self.default);

        match behaviour {
            MockBehaviour::Succeed(out) => Ok(ActionOutput::text(out.clone())),
            MockBehaviour::FailRetryable(msg) => Err(ActionError::Retryable(msg.clone())),
            MockBehaviour::FailFatal(msg) => Err(ActionError::Fatal(msg.clone())),
            MockBehaviour::Sleep(d) => {
                tokio::time::sleep(*d).await;
                Ok(ActionOutput::text(format!("slept {}ms", d.as_millis())))
            }
            MockBehaviour::FailTimes(n, msg) if previous < *n => {
                Err(ActionError::Retryable(msg.clone()))
            }
            MockBehaviour::FailTimes(..) => Ok(ActionOutput::text("ok")),
            MockBehaviour::Panic(msg) => panic!("{msg}"),
        }
    }
}
