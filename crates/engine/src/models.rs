//! Core domain models for the orchestration engine.
//!
//! Definitions (`WorkflowDefinition`, `TaskSpec`) are what the operator
//! writes in YAML or JSON. Runtime types (`ExecutionRecord`, `StepResult`,
//! `ScheduledTask`) are what the engine produces and persists.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use actions::{ActionError, StepAction};

use crate::condition::Condition;

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

/// How a workflow is started.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerKind {
    /// Started by an operator through the CLI or the REST API.
    #[default]
    Manual,
    /// Started by a push to `branch`.
    GitPush { branch: String },
    /// Started by the scheduler.
    Scheduled { cron: String },
    /// Started by an HTTP request to `/api/v1/webhook/{path}`.
    Webhook { path: String },
}

impl TriggerKind {
    pub fn trigger_type(&self) -> TriggerType {
        match self {
            Self::Manual => TriggerType::Manual,
            Self::GitPush { .. } => TriggerType::GitPush,
            Self::Scheduled { .. } => TriggerType::Scheduled,
            Self::Webhook { .. } => TriggerType::Webhook,
        }
    }
}

/// A trigger plus the conditions an incoming event must satisfy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    #[serde(flatten)]
    pub kind: TriggerKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl Trigger {
    pub fn manual() -> Self {
        Self::default()
    }

    pub fn new(kind: TriggerKind) -> Self {
        Self { kind, conditions: Vec::new() }
    }

    /// `true` when every condition holds for `vars`.
    pub fn accepts(&self, vars: &BTreeMap<String, String>) -> bool {
        self.conditions.iter().all(|c| c.evaluate(vars))
    }
}

/// What actually started an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    GitPush,
    Scheduled,
    Webhook,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::GitPush => "git_push",
            Self::Scheduled => "scheduled",
            Self::Webhook => "webhook",
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// An external event the coordinator resolves to zero or more workflows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerEvent {
    GitPush {
        branch: String,
        #[serde(default)]
        params: BTreeMap<String, String>,
    },
    Webhook {
        path: String,
        #[serde(default)]
        params: BTreeMap<String, String>,
    },
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 300;

fn default_timeout() -> u64 {
    DEFAULT_STEP_TIMEOUT_SECS
}

/// One unit of work inside a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    #[serde(flatten)]
    pub action: StepAction,
    /// Per-attempt timeout in seconds.
    #[serde(rename = "timeout", alias = "timeout_seconds", default = "default_timeout")]
    pub timeout_seconds: u64,
    /// The step is skipped when this evaluates to false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

impl Step {
    pub fn new(name: impl Into<String>, action: StepAction) -> Self {
        Self {
            name: name.into(),
            action,
            timeout_seconds: DEFAULT_STEP_TIMEOUT_SECS,
            condition: None,
            retry: None,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_seconds = secs;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn max_attempts(&self) -> u32 {
        self.retry.as_ref().map_or(1, |r| r.max_attempts.max(1))
    }
}

pub const DEFAULT_MAX_BACKOFF_MS: u64 = 60_000;

fn default_max_attempts() -> u32 {
    1
}

fn default_max_backoff() -> u64 {
    DEFAULT_MAX_BACKOFF_MS
}

/// How often and how patiently a failing step is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles after each further failure.
    #[serde(default)]
    pub backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff_ms,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
        }
    }

    /// Delay after failed attempt number `attempt` (1-based):
    /// `backoff_ms * 2^(attempt-1)`, capped at `max_backoff_ms`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        let ms = self.backoff_ms.saturating_mul(factor).min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// Lifecycle events a workflow can notify on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationEvent {
    OnStart,
    OnSuccess,
    OnFailure,
}

impl NotificationEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OnStart => "on_start",
            Self::OnSuccess => "on_success",
            Self::OnFailure => "on_failure",
        }
    }
}

impl fmt::Display for NotificationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// A notification target: `slack`, `email`, `webhook`, ...
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    #[serde(rename = "type")]
    pub kind: String,
    /// Channel name, URL or address, depending on `kind`.
    #[serde(default, alias = "channel", alias = "url", skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recipients: Vec<String>,
}

impl Channel {
    pub fn new(kind: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            destination: Some(destination.into()),
            recipients: Vec::new(),
        }
    }

    /// Every address this channel delivers to.
    pub fn targets(&self) -> Vec<&str> {
        self.destination
            .iter()
            .map(String::as_str)
            .chain(self.recipients.iter().map(String::as_str))
            .collect()
    }
}

/// Channels per lifecycle event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRules {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_start: Vec<Channel>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_success: Vec<Channel>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_failure: Vec<Channel>,
}

impl NotificationRules {
    pub fn channels_for(&self, event: NotificationEvent) -> &[Channel] {
        match event {
            NotificationEvent::OnStart => &self.on_start,
            NotificationEvent::OnSuccess => &self.on_success,
            NotificationEvent::OnFailure => &self.on_failure,
        }
    }

    pub fn all(&self) -> impl Iterator<Item = &Channel> {
        self.on_start.iter().chain(&self.on_success).chain(&self.on_failure)
    }
}

// ---------------------------------------------------------------------------
// WorkflowDefinition
// ---------------------------------------------------------------------------

/// A complete workflow definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub trigger: Trigger,
    pub steps: Vec<Step>,
    /// Steps run, in order, when a forward step fails.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rollback: Vec<Step>,
    #[serde(default)]
    pub notifications: NotificationRules,
    /// Extra environment variables for every step's process.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    /// Stamped by the definition store on every (re)load.
    #[serde(default)]
    pub version: u64,
}

impl WorkflowDefinition {
    /// Convenience constructor for testing.
    pub fn new(name: impl Into<String>, trigger: TriggerKind, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            trigger: Trigger::new(trigger),
            steps,
            rollback: Vec::new(),
            notifications: NotificationRules::default(),
            environment: BTreeMap::new(),
            version: 0,
        }
    }

    pub fn with_rollback(mut self, rollback: Vec<Step>) -> Self {
        self.rollback = rollback;
        self
    }

    pub fn with_notifications(mut self, notifications: NotificationRules) -> Self {
        self.notifications = notifications;
        self
    }
}

// ---------------------------------------------------------------------------
// Scheduled tasks
// ---------------------------------------------------------------------------

/// What a scheduled task runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskCommand {
    ExecuteScript {
        #[serde(alias = "script")]
        path: String,
        #[serde(default, alias = "parameters")]
        args: Vec<String>,
    },
    Deploy { environment: String },
    RemoteCommand { host: String, command: String },
    UploadFiles { src: String, dst: String },
    /// Trigger a loaded workflow by name.
    RunWorkflow { workflow: String },
}

impl TaskCommand {
    /// The equivalent step action, or `None` for `RunWorkflow`.
    pub fn as_action(&self) -> Option<StepAction> {
        Some(match self {
            Self::ExecuteScript { path, args } => StepAction::ExecuteScript {
                path: path.clone(),
                args: args.clone(),
            },
            Self::Deploy { environment } => StepAction::Deploy {
                environment: environment.clone(),
            },
            Self::RemoteCommand { host, command } => StepAction::RemoteCommand {
                host: host.clone(),
                command: command.clone(),
            },
            Self::UploadFiles { src, dst } => StepAction::UploadFiles {
                src: src.clone(),
                dst: dst.clone(),
            },
            Self::RunWorkflow { .. } => return None,
        })
    }
}

/// A scheduled task as written in configuration or submitted by an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    pub cron: String,
    pub command: TaskCommand,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub notifications: NotificationRules,
    #[serde(rename = "timeout", alias = "timeout_seconds", default = "default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, cron: impl Into<String>, command: TaskCommand) -> Self {
        Self {
            name: name.into(),
            cron: cron.into(),
            command,
            environment: BTreeMap::new(),
            notifications: NotificationRules::default(),
            timeout_seconds: DEFAULT_STEP_TIMEOUT_SECS,
            retry: None,
        }
    }

    /// The single-step workflow a command task runs as. `None` for
    /// `RunWorkflow` tasks, which trigger an existing workflow instead.
    pub fn as_workflow(&self) -> Option<WorkflowDefinition> {
        let action = self.command.as_action()?;
        let mut step = Step::new(self.name.clone(), action).with_timeout(self.timeout_seconds);
        step.retry = self.retry;

        let mut def = WorkflowDefinition::new(
            self.name.clone(),
            TriggerKind::Scheduled { cron: self.cron.clone() },
            vec![step],
        );
        def.notifications = self.notifications.clone();
        def.environment = self.environment.clone();
        Some(def)
    }

    /// The name of the workflow a fire of this task triggers.
    pub fn target_workflow(&self) -> &str {
        match &self.command {
            TaskCommand::RunWorkflow { workflow } => workflow,
            _ => &self.name,
        }
    }
}

/// A registered scheduled task with the scheduler's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    #[serde(flatten)]
    pub spec: TaskSpec,
    pub next_fire_time: Option<DateTime<Utc>>,
    pub last_fired_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Execution records
// ---------------------------------------------------------------------------

/// Overall status of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Succeeded,
    Failed,
    RolledBack,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => db::models::status::RUNNING,
            Self::Succeeded => db::models::status::SUCCEEDED,
            Self::Failed => db::models::status::FAILED,
            Self::RolledBack => db::models::status::ROLLED_BACK,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// Why a step attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepErrorKind {
    /// The action failed in a way worth retrying.
    Failed,
    /// The action failed and retrying will not help.
    Fatal,
    /// The attempt exceeded the step timeout.
    Timeout,
    /// The execution was cancelled by an operator.
    Cancelled,
}

impl StepErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed | Self::Timeout)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    pub kind: StepErrorKind,
    pub message: String,
}

impl StepError {
    pub fn new(kind: StepErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(StepErrorKind::Timeout, format!("timed out after {}s", after.as_secs()))
    }

    pub fn cancelled() -> Self {
        Self::new(StepErrorKind::Cancelled, "execution cancelled")
    }
}

impl From<ActionError> for StepError {
    fn from(err: ActionError) -> Self {
        match err {
            ActionError::Retryable(msg) => Self::new(StepErrorKind::Failed, msg),
            ActionError::Fatal(msg) | ActionError::Spawn(msg) => Self::new(StepErrorKind::Fatal, msg),
        }
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Outcome of one step (forward or rollback).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    pub name: String,
    pub status: StepStatus,
    /// Wall time across all attempts, in milliseconds.
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    pub attempts: u32,
}

impl StepResult {
    pub fn succeeded(name: impl Into<String>, output: String, duration: Duration, attempts: u32) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::Succeeded,
            duration_ms: duration_ms(duration),
            output,
            error: None,
            attempts,
        }
    }

    pub fn failed(name: impl Into<String>, error: StepError, duration: Duration, attempts: u32) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::Failed,
            duration_ms: duration_ms(duration),
            output: String::new(),
            error: Some(error),
            attempts,
        }
    }

    pub fn skipped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::Skipped,
            duration_ms: 0,
            output: String::new(),
            error: None,
            attempts: 0,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn error_kind(&self) -> Option<StepErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// The full history of one workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub workflow_name: String,
    #[serde(default)]
    pub workflow_version: u64,
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub steps: Vec<StepResult>,
    #[serde(default)]
    pub rollback_results: Vec<StepResult>,
    /// Set when the run ended for a reason outside any step (e.g. the
    /// process died while it was running).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionRecord {
    pub fn start(def: &WorkflowDefinition, ctx: &RunContext, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_name: def.name.clone(),
            workflow_version: def.version,
            trigger_type: ctx.trigger_type,
            params: ctx.params.clone(),
            start_time: now,
            end_time: None,
            status: ExecutionStatus::Running,
            steps: Vec::new(),
            rollback_results: Vec::new(),
            error: None,
        }
    }

    pub fn finish(&mut self, status: ExecutionStatus, now: DateTime<Utc>) {
        self.status = status;
        self.end_time = Some(now);
    }

    /// The forward step that failed, if any.
    pub fn failed_step(&self) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.status == StepStatus::Failed)
    }

    pub fn summary(&self) -> ExecutionSummary {
        ExecutionSummary {
            id: self.id,
            workflow_name: self.workflow_name.clone(),
            trigger_type: self.trigger_type,
            status: self.status,
            start_time: self.start_time,
            end_time: self.end_time,
            failed_step: self.failed_step().map(|s| s.name.clone()),
            rollback_failures: self
                .rollback_results
                .iter()
                .filter(|s| s.status == StepStatus::Failed)
                .count(),
        }
    }
}

/// What `workflow-status` reports per execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub id: Uuid,
    pub workflow_name: String,
    pub trigger_type: TriggerType,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    pub rollback_failures: usize,
}

// ---------------------------------------------------------------------------
// RunContext
// ---------------------------------------------------------------------------

/// Everything a trigger hands to a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunContext {
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl RunContext {
    pub fn new(trigger_type: TriggerType) -> Self {
        Self { trigger_type, params: BTreeMap::new() }
    }

    pub fn manual() -> Self {
        Self::new(TriggerType::Manual)
    }

    pub fn scheduled() -> Self {
        Self::new(TriggerType::Scheduled)
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_params(mut self, params: BTreeMap<String, String>) -> Self {
        self.params.extend(params);
        self
    }

    /// Variables visible to conditions: the params plus `trigger`.
    pub fn variables(&self) -> BTreeMap<String, String> {
        let mut vars = self.params.clone();
        vars.entry("trigger".into())
            .or_insert_with(|| self.trigger_type.as_str().to_string());
        vars
    }
}
