//! Loading and validating workflow and scheduled-task definitions.
//!
//! A definition file is YAML (`.yaml`, `.yml`) or JSON (`.json`) and holds
//! either a bundle
//!
//! ```yaml
//! workflows: [ ... ]
//! scheduled_tasks: [ ... ]
//! ```
//!
//! or a single workflow document. Everything is parsed into typed
//! definitions and validated up front, so a run never meets a malformed
//! step, condition or cron expression.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cron::CronSchedule;
use crate::models::{
    Channel, NotificationRules, Step, TaskCommand, TaskSpec, TriggerEvent, TriggerKind,
    WorkflowDefinition,
};
use crate::EngineError;

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Workflows and tasks read from one or more definition files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefinitionSet {
    #[serde(default)]
    pub workflows: Vec<WorkflowDefinition>,
    #[serde(default)]
    pub scheduled_tasks: Vec<TaskSpec>,
}

impl DefinitionSet {
    /// Parse definition text. `path` picks the format by extension and is
    /// used in error messages.
    pub fn parse(source: &str, path: &Path) -> Result<Self, EngineError> {
        let parse_err = |message: String| EngineError::Parse {
            path: path.to_path_buf(),
            message,
        };

        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));

        let value: serde_json::Value = if is_json {
            serde_json::from_str(source).map_err(|e| parse_err(e.to_string()))?
        } else {
            serde_yml::from_str(source).map_err(|e| parse_err(e.to_string()))?
        };

        let is_bundle = value
            .as_object()
            .is_some_and(|m| m.contains_key("workflows") || m.contains_key("scheduled_tasks"));

        if is_bundle {
            serde_json::from_value(value).map_err(|e| parse_err(e.to_string()))
        } else {
            let workflow: WorkflowDefinition =
                serde_json::from_value(value).map_err(|e| parse_err(e.to_string()))?;
            Ok(Self {
                workflows: vec![workflow],
                scheduled_tasks: Vec::new(),
            })
        }
    }

    /// Read and parse one file. Does not validate.
    pub fn load_file(path: &Path) -> Result<Self, EngineError> {
        let source = std::fs::read_to_string(path).map_err(|source| EngineError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&source, path)
    }

    /// Read every `.yaml`, `.yml` and `.json` file in `dir` (not recursive),
    /// in file name order, and validate the combined set.
    pub fn load_dir(dir: &Path) -> Result<Self, EngineError> {
        let io_err = |source| EngineError::Io {
            path: dir.to_path_buf(),
            source,
        };

        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(io_err)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && is_definition_file(p))
            .collect();
        files.sort();

        let mut set = Self::default();
        for file in &files {
            debug!(path = %file.display(), "loading definitions");
            set.merge(Self::load_file(file)?);
        }
        set.validate()?;

        info!(
            dir = %dir.display(),
            workflows = set.workflows.len(),
            tasks = set.scheduled_tasks.len(),
            "definitions loaded"
        );
        Ok(set)
    }

    pub fn merge(&mut self, other: Self) {
        self.workflows.extend(other.workflows);
        self.scheduled_tasks.extend(other.scheduled_tasks);
    }

    /// Validate every definition and the cross-definition rules: unique
    /// workflow names, unique task names not shadowing a workflow, unique
    /// webhook paths.
    pub fn validate(&self) -> Result<(), EngineError> {
        let mut names = HashSet::new();
        let mut hooks = HashSet::new();

        for wf in &self.workflows {
            validate_workflow(wf)?;
            if !names.insert(wf.name.as_str()) {
                return Err(EngineError::invalid(&wf.name, "duplicate workflow name"));
            }
            if let TriggerKind::Webhook { path } = &wf.trigger.kind {
                if !hooks.insert(normalize_path(path)) {
                    return Err(EngineError::invalid(
                        &wf.name,
                        format!("webhook path '{path}' is used by another workflow"),
                    ));
                }
            }
        }

        let mut task_names = HashSet::new();
        for task in &self.scheduled_tasks {
            validate_task(task)?;
            if !task_names.insert(task.name.as_str()) {
                return Err(EngineError::invalid(&task.name, "duplicate scheduled task name"));
            }
            if names.contains(task.name.as_str()) {
                return Err(EngineError::invalid(
                    &task.name,
                    "scheduled task name clashes with a workflow name",
                ));
            }
        }

        Ok(())
    }
}

fn is_definition_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml" | "yml" | "json")
    )
}

/// Webhook paths compare without surrounding slashes.
pub(crate) fn normalize_path(path: &str) -> &str {
    path.trim_matches('/')
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Check the structural rules of a single workflow.
pub fn validate_workflow(wf: &WorkflowDefinition) -> Result<(), EngineError> {
    let name = wf.name.as_str();
    if name.trim().is_empty() {
        return Err(EngineError::invalid(name, "workflow name must not be empty"));
    }
    if wf.steps.is_empty() {
        return Err(EngineError::invalid(name, "workflow has no steps"));
    }

    validate_steps(name, &wf.steps, "step")?;
    validate_steps(name, &wf.rollback, "rollback step")?;

    match &wf.trigger.kind {
        TriggerKind::Manual => {}
        TriggerKind::GitPush { branch } if branch.trim().is_empty() => {
            return Err(EngineError::invalid(name, "git_push trigger needs a branch"));
        }
        TriggerKind::GitPush { .. } => {}
        TriggerKind::Scheduled { cron } => check_cron(cron)?,
        TriggerKind::Webhook { path } if normalize_path(path).is_empty() => {
            return Err(EngineError::invalid(name, "webhook trigger needs a path"));
        }
        TriggerKind::Webhook { .. } => {}
    }

    validate_channels(name, &wf.notifications)
}

/// Check a scheduled task definition.
pub fn validate_task(task: &TaskSpec) -> Result<(), EngineError> {
    let name = task.name.as_str();
    if name.trim().is_empty() {
        return Err(EngineError::invalid(name, "task name must not be empty"));
    }
    check_cron(&task.cron)?;
    if task.timeout_seconds == 0 {
        return Err(EngineError::invalid(name, "timeout must be greater than zero"));
    }
    if task.retry.is_some_and(|r| r.max_attempts == 0) {
        return Err(EngineError::invalid(name, "retry.max_attempts must be at least 1"));
    }
    if let TaskCommand::RunWorkflow { workflow } = &task.command {
        if workflow.trim().is_empty() {
            return Err(EngineError::invalid(name, "run_workflow command needs a workflow"));
        }
    }
    validate_channels(name, &task.notifications)
}

fn validate_steps(workflow: &str, steps: &[Step], what: &str) -> Result<(), EngineError> {
    let mut seen = HashSet::new();
    for step in steps {
        if step.name.trim().is_empty() {
            return Err(EngineError::invalid(workflow, format!("{what} name must not be empty")));
        }
        if !seen.insert(step.name.as_str()) {
            return Err(EngineError::invalid(
                workflow,
                format!("duplicate {what} name '{}'", step.name),
            ));
        }
        if step.timeout_seconds == 0 {
            return Err(EngineError::invalid(
                workflow,
                format!("{what} '{}' timeout must be greater than zero", step.name),
            ));
        }
        if step.retry.is_some_and(|r| r.max_attempts == 0) {
            return Err(EngineError::invalid(
                workflow,
                format!("{what} '{}' retry.max_attempts must be at least 1", step.name),
            ));
        }
    }
    Ok(())
}

fn validate_channels(owner: &str, rules: &NotificationRules) -> Result<(), EngineError> {
    let bad = |c: &Channel| c.kind.trim().is_empty() || c.targets().is_empty();
    if let Some(channel) = rules.all().find(|&c| bad(c)) {
        return Err(EngineError::invalid(
            owner,
            format!("notification channel '{}' has no destination", channel.kind),
        ));
    }
    Ok(())
}

/// A cron expression is valid if it parses and fires at least once.
fn check_cron(expression: &str) -> Result<(), EngineError> {
    CronSchedule::parse(expression)?
        .next_after(DateTime::<Utc>::default())
        .map(|_| ())
}

// ---------------------------------------------------------------------------
// DefinitionStore
// ---------------------------------------------------------------------------

/// The loaded workflows, keyed by name.
///
/// Replacing a workflow installs a new `Arc` with a higher `version`; runs
/// already in flight keep the snapshot they started with.
#[derive(Debug, Default)]
pub struct DefinitionStore {
    workflows: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
    version: AtomicU64,
}

impl DefinitionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and install (or replace) one workflow.
    pub fn insert(&self, mut def: WorkflowDefinition) -> Result<Arc<WorkflowDefinition>, EngineError> {
        validate_workflow(&def)?;

        let mut workflows = self.workflows.write();
        if let TriggerKind::Webhook { path } = &def.trigger.kind {
            let path = normalize_path(path);
            let clash = workflows.values().any(|other| {
                other.name != def.name
                    && matches!(&other.trigger.kind,
                        TriggerKind::Webhook { path: p } if normalize_path(p) == path)
            });
            if clash {
                return Err(EngineError::invalid(
                    &def.name,
                    format!("webhook path '{path}' is used by another workflow"),
                ));
            }
        }

        def.version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let def = Arc::new(def);
        workflows.insert(def.name.clone(), Arc::clone(&def));

        info!(workflow = %def.name, version = def.version, "workflow definition installed");
        Ok(def)
    }

    /// Validate a whole set, then install all of its workflows.
    pub fn install(&self, set: &DefinitionSet) -> Result<Vec<Arc<WorkflowDefinition>>, EngineError> {
        set.validate()?;
        set.workflows.iter().cloned().map(|wf| self.insert(wf)).collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<WorkflowDefinition>> {
        self.workflows.read().get(name).cloned()
    }

    pub fn remove(&self, name: &str) -> Option<Arc<WorkflowDefinition>> {
        self.workflows.write().remove(name)
    }

    /// All workflows, sorted by name.
    pub fn list(&self) -> Vec<Arc<WorkflowDefinition>> {
        let mut all: Vec<_> = self.workflows.read().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Workflows whose trigger kind matches `event`. Trigger conditions are
    /// not evaluated here.
    pub fn matching(&self, event: &TriggerEvent) -> Vec<Arc<WorkflowDefinition>> {
        self.list()
            .into_iter()
            .filter(|wf| match (&wf.trigger.kind, event) {
                (TriggerKind::GitPush { branch }, TriggerEvent::GitPush { branch: pushed, .. }) => {
                    branch == pushed || branch == "*"
                }
                (TriggerKind::Webhook { path }, TriggerEvent::Webhook { path: hit, .. }) => {
                    normalize_path(path) == normalize_path(hit)
                }
                _ => false,
            })
            .collect()
    }
}
