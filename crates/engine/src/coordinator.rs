//! Workflow execution coordinator.
//!
//! `ExecutionCoordinator` is the central orchestrator:
//! 1. Resolves a trigger to a workflow definition snapshot.
//! 2. Takes the per-workflow run lock (fail fast, no queueing). The lock is
//!    held twice: in this process's run table, and in the store, which
//!    accepts one `Running` record per workflow across every process
//!    sharing the database.
//! 3. Persists a `Running` record and drives the run on its own task:
//!    steps in order, conditions, retries and timeouts via `StepExecutor`.
//! 4. On the first failed step, skips the rest and runs the rollback steps.
//! 5. Emits the terminal notification, persists the final record and only
//!    then releases the lock.
//!
//! Runtime failures never surface to the caller of `trigger`; they live in
//! the `ExecutionRecord`.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use actions::{ActionContext, ActionRegistry};

use crate::clock::{SharedClock, SystemClock};
use crate::definitions::DefinitionStore;
use crate::executor::StepExecutor;
use crate::models::{
    ExecutionRecord, ExecutionStatus, ExecutionSummary, NotificationEvent, RunContext, StepError,
    StepResult, StepStatus, TriggerEvent, TriggerType, WorkflowDefinition,
};
use crate::notify::{ChannelRouter, NotificationDispatcher, Notifier, DEFAULT_DELIVERY_TIMEOUT};
use crate::rollback::RollbackManager;
use crate::store::RecordStore;
use crate::EngineError;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Maximum number of executions `status` returns.
    pub history_limit: usize,
    /// Directory relative script paths resolve against.
    pub working_dir: Option<PathBuf>,
    /// Environment variables added to every step process.
    pub environment: BTreeMap<String, String>,
    /// Upper bound on a single notification delivery.
    pub delivery_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            history_limit: 50,
            working_dir: None,
            environment: BTreeMap::new(),
            delivery_timeout: DEFAULT_DELIVERY_TIMEOUT,
        }
    }
}

// ---------------------------------------------------------------------------
// Run lock
// ---------------------------------------------------------------------------

struct RunningExecution {
    execution_id: Uuid,
    cancel: CancellationToken,
    /// Every step has finished; a cancel can no longer change the outcome.
    settled: bool,
}

type RunTable = Arc<Mutex<HashMap<String, RunningExecution>>>;

/// Held by a run for its whole lifetime; dropping it frees the workflow.
struct RunLock {
    table: RunTable,
    workflow: String,
}

impl RunLock {
    fn settle(&self) {
        if let Some(run) = self.table.lock().get_mut(&self.workflow) {
            run.settled = true;
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        self.table.lock().remove(&self.workflow);
        debug!(workflow = %self.workflow, "run lock released");
    }
}

/// Result of resolving one external event against one workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventOutcome {
    pub workflow: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// ExecutionCoordinator
// ---------------------------------------------------------------------------

struct Inner {
    definitions: Arc<DefinitionStore>,
    executor: StepExecutor,
    rollback: RollbackManager,
    notifier: NotificationDispatcher,
    store: Arc<dyn RecordStore>,
    clock: SharedClock,
    config: CoordinatorConfig,
    running: RunTable,
}

/// Cheap to clone; all clones share the same run table.
#[derive(Clone)]
pub struct ExecutionCoordinator {
    inner: Arc<Inner>,
}

/// Builds an [`ExecutionCoordinator`]. Notifier, clock and config default to
/// [`ChannelRouter::with_defaults`], [`SystemClock`] and
/// [`CoordinatorConfig::default`].
pub struct CoordinatorBuilder {
    definitions: Arc<DefinitionStore>,
    registry: Arc<ActionRegistry>,
    store: Arc<dyn RecordStore>,
    notifier: Option<Arc<dyn Notifier>>,
    clock: Option<SharedClock>,
    config: CoordinatorConfig,
}

impl CoordinatorBuilder {
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> ExecutionCoordinator {
        let executor = StepExecutor::new(self.registry);
        let notifier = self
            .notifier
            .unwrap_or_else(|| Arc::new(ChannelRouter::with_defaults()) as Arc<dyn Notifier>);

        ExecutionCoordinator {
            inner: Arc::new(Inner {
                definitions: self.definitions,
                rollback: RollbackManager::new(executor.clone()),
                executor,
                notifier: NotificationDispatcher::new(notifier)
                    .with_delivery_timeout(self.config.delivery_timeout),
                store: self.store,
                clock: self
                    .clock
                    .unwrap_or_else(|| Arc::new(SystemClock) as SharedClock),
                config: self.config,
                running: RunTable::default(),
            }),
        }
    }
}

impl ExecutionCoordinator {
    pub fn builder(
        definitions: Arc<DefinitionStore>,
        registry: Arc<ActionRegistry>,
        store: Arc<dyn RecordStore>,
    ) -> CoordinatorBuilder {
        CoordinatorBuilder {
            definitions,
            registry,
            store,
            notifier: None,
            clock: None,
            config: CoordinatorConfig::default(),
        }
    }

    pub fn definitions(&self) -> &Arc<DefinitionStore> {
        &self.inner.definitions
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.inner.store
    }

    pub fn clock(&self) -> &SharedClock {
        &self.inner.clock
    }

    /// Validate and install a workflow definition.
    pub fn setup_workflow(&self, def: WorkflowDefinition) -> Result<Arc<WorkflowDefinition>, EngineError> {
        self.inner.definitions.insert(def)
    }

    // -----------------------------------------------------------------------
    // Triggering
    // -----------------------------------------------------------------------

    /// Start a run of the named workflow and return its execution id.
    ///
    /// # Errors
    /// `UnknownWorkflow` if no such definition is loaded, `WorkflowLocked`
    /// if a run of it is in progress here or in another process sharing the
    /// store, or a persistence error if the initial record cannot be
    /// written. No record exists after an error.
    pub async fn trigger(&self, workflow: &str, ctx: RunContext) -> Result<Uuid, EngineError> {
        let (id, _handle) = self.start(workflow, ctx).await?;
        Ok(id)
    }

    /// Like [`trigger`](Self::trigger), for a definition that is not in the
    /// definition store (e.g. a scheduled command task).
    pub async fn trigger_definition(
        &self,
        def: Arc<WorkflowDefinition>,
        ctx: RunContext,
    ) -> Result<Uuid, EngineError> {
        let (id, _handle) = self.start_definition(def, ctx).await?;
        Ok(id)
    }

    /// Trigger a run and wait for its terminal record.
    pub async fn run(&self, workflow: &str, ctx: RunContext) -> Result<ExecutionRecord, EngineError> {
        let (_, handle) = self.start(workflow, ctx).await?;
        handle.await.map_err(|e| EngineError::Join(e.to_string()))
    }

    async fn start(
        &self,
        workflow: &str,
        ctx: RunContext,
    ) -> Result<(Uuid, JoinHandle<ExecutionRecord>), EngineError> {
        let def = self
            .inner
            .definitions
            .get(workflow)
            .ok_or_else(|| EngineError::UnknownWorkflow(workflow.to_string()))?;
        self.start_definition(def, ctx).await
    }

    async fn start_definition(
        &self,
        def: Arc<WorkflowDefinition>,
        ctx: RunContext,
    ) -> Result<(Uuid, JoinHandle<ExecutionRecord>), EngineError> {
        let record = ExecutionRecord::start(&def, &ctx, self.inner.clock.now());
        let (lock, cancel) = self.acquire(&def.name, record.id)?;

        // On failure the lock is dropped here and the workflow is free again.
        if let Err(err) = self.inner.store.save_execution(&record).await {
            if let EngineError::WorkflowLocked(_) = &err {
                info!(workflow = %def.name, "workflow is running in another process");
            }
            return Err(err);
        }

        info!(
            workflow = %def.name,
            execution_id = %record.id,
            trigger = %ctx.trigger_type,
            version = def.version,
            "execution started"
        );

        let id = record.id;
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(drive(inner, def, ctx, record, cancel, lock));
        Ok((id, handle))
    }

    fn acquire(&self, workflow: &str, execution_id: Uuid) -> Result<(RunLock, CancellationToken), EngineError> {
        let mut running = self.inner.running.lock();
        if running.contains_key(workflow) {
            return Err(EngineError::WorkflowLocked(workflow.to_string()));
        }

        let cancel = CancellationToken::new();
        running.insert(
            workflow.to_string(),
            RunningExecution {
                execution_id,
                cancel: cancel.clone(),
                settled: false,
            },
        );

        Ok((
            RunLock {
                table: Arc::clone(&self.inner.running),
                workflow: workflow.to_string(),
            },
            cancel,
        ))
    }

    /// Resolve a git push or webhook event to every matching workflow whose
    /// trigger conditions hold, and trigger each one.
    pub async fn handle_event(&self, event: TriggerEvent) -> Vec<EventOutcome> {
        let ctx = match &event {
            TriggerEvent::GitPush { branch, params } => {
                RunContext::new(TriggerType::GitPush)
                    .with_params(params.clone())
                    .with_param("branch", branch.clone())
            }
            TriggerEvent::Webhook { path, params } => {
                RunContext::new(TriggerType::Webhook)
                    .with_params(params.clone())
                    .with_param("path", path.clone())
            }
        };
        let vars = ctx.variables();

        let mut outcomes = Vec::new();
        for def in self.inner.definitions.matching(&event) {
            if !def.trigger.accepts(&vars) {
                debug!(workflow = %def.name, "trigger conditions not met");
                continue;
            }

            let name = def.name.clone();
            let outcome = match self.start_definition(def, ctx.clone()).await {
                Ok((id, _)) => EventOutcome {
                    workflow: name,
                    execution_id: Some(id),
                    error: None,
                },
                Err(err) => {
                    warn!(workflow = %name, "event trigger rejected: {err}");
                    EventOutcome {
                        workflow: name,
                        execution_id: None,
                        error: Some(err.to_string()),
                    }
                }
            };
            outcomes.push(outcome);
        }

        outcomes
    }

    // -----------------------------------------------------------------------
    // Control and queries
    // -----------------------------------------------------------------------

    /// Ask a running execution to stop. Returns `false` if the execution
    /// exists but is past its last step. A `true` always ends the run with a
    /// `Cancelled` step.
    pub async fn cancel(&self, execution_id: Uuid) -> Result<bool, EngineError> {
        // Cancel under the lock so `settle` sees it or refuses it.
        let accepted = match self
            .inner
            .running
            .lock()
            .values()
            .find(|r| r.execution_id == execution_id && !r.settled)
        {
            Some(run) => {
                run.cancel.cancel();
                true
            }
            None => false,
        };

        if accepted {
            info!(%execution_id, "cancellation requested");
            return Ok(true);
        }

        match self.inner.store.get_execution(execution_id).await? {
            Some(_) => Ok(false),
            None => Err(EngineError::UnknownExecution(execution_id)),
        }
    }

    /// Execution summaries, newest first, optionally for one workflow.
    pub async fn status(&self, workflow: Option<&str>) -> Result<Vec<ExecutionSummary>, EngineError> {
        if let Some(name) = workflow {
            if self.inner.definitions.get(name).is_none() && !self.is_running(name) {
                let any = self.inner.store.list_executions(Some(name), 1).await?;
                if any.is_empty() {
                    return Err(EngineError::UnknownWorkflow(name.to_string()));
                }
            }
        }

        let records = self
            .inner
            .store
            .list_executions(workflow, self.inner.config.history_limit)
            .await?;
        Ok(records.iter().map(ExecutionRecord::summary).collect())
    }

    pub async fn execution(&self, execution_id: Uuid) -> Result<ExecutionRecord, EngineError> {
        self.inner
            .store
            .get_execution(execution_id)
            .await?
            .ok_or(EngineError::UnknownExecution(execution_id))
    }

    pub fn is_running(&self, workflow: &str) -> bool {
        self.inner.running.lock().contains_key(workflow)
    }

    /// `(workflow, execution id)` of every run in progress.
    pub fn running(&self) -> Vec<(String, Uuid)> {
        let mut all: Vec<_> = self
            .inner
            .running
            .lock()
            .iter()
            .map(|(name, r)| (name.clone(), r.execution_id))
            .collect();
        all.sort();
        all
    }

    /// Freeze records a previous process left `Running` as `Failed`.
    /// Call once at startup, before triggering anything. Runs only ever
    /// execute inside `serve`, so at startup no other process owns them.
    pub async fn recover_interrupted(&self) -> Result<usize, EngineError> {
        let stale = self.inner.store.list_running().await?;
        let mut recovered = 0;

        for mut record in stale {
            if self.is_running(&record.workflow_name) {
                continue;
            }
            warn!(
                workflow = %record.workflow_name,
                execution_id = %record.id,
                "marking interrupted execution as failed"
            );
            record.error = Some("interrupted: orchestrator stopped during the run".into());
            record.finish(ExecutionStatus::Failed, self.inner.clock.now());
            self.inner.store.save_execution(&record).await?;
            recovered += 1;
        }

        Ok(recovered)
    }
}

// ---------------------------------------------------------------------------
// The run itself
// ---------------------------------------------------------------------------

#[instrument(
    skip_all,
    fields(workflow = %def.name, execution_id = %record.id)
)]
async fn drive(
    inner: Arc<Inner>,
    def: Arc<WorkflowDefinition>,
    ctx: RunContext,
    mut record: ExecutionRecord,
    cancel: CancellationToken,
    lock: RunLock,
) -> ExecutionRecord {
    inner
        .notifier
        .dispatch(NotificationEvent::OnStart, &record, &def.notifications)
        .await;

    let vars = ctx.variables();
    let mut base = ActionContext::new(def.name.clone(), record.id);
    base.params = ctx.params.clone();
    base.environment = inner.config.environment.clone();
    base.environment.extend(def.environment.clone());
    base.working_dir = inner.config.working_dir.clone();

    let mut failed = false;
    for step in &def.steps {
        if failed {
            record.steps.push(StepResult::skipped(&step.name));
            continue;
        }

        if cancel.is_cancelled() {
            info!(step = %step.name, "cancelled before the step started");
            record
                .steps
                .push(StepResult::failed(&step.name, StepError::cancelled(), Duration::ZERO, 0));
            failed = true;
            continue;
        }

        if let Some(condition) = &step.condition {
            if !condition.evaluate(&vars) {
                info!(step = %step.name, condition = %condition, "condition false, skipping step");
                record.steps.push(StepResult::skipped(&step.name));
                continue;
            }
        }

        let result = inner.executor.execute(step, &base, &cancel).await;
        failed = result.status == StepStatus::Failed;
        record.steps.push(result);

        if let Err(err) = inner.store.save_execution(&record).await {
            warn!("could not persist progress: {err}");
        }
    }

    // Under the run-table mutex: a cancel either landed before this point
    // and was seen above, or is refused from here on.
    lock.settle();
    if !failed && cancel.is_cancelled() {
        failed = true;
        record.error = Some("cancelled after the last step finished".into());
    }

    let status = if !failed {
        ExecutionStatus::Succeeded
    } else if def.rollback.is_empty() {
        ExecutionStatus::Failed
    } else {
        record.rollback_results = inner.rollback.rollback(&def.rollback, &base).await;
        ExecutionStatus::RolledBack
    };
    record.finish(status, inner.clock.now());

    let event = match status {
        ExecutionStatus::Succeeded => NotificationEvent::OnSuccess,
        _ => NotificationEvent::OnFailure,
    };
    inner.notifier.dispatch(event, &record, &def.notifications).await;

    if let Err(err) = inner.store.save_execution(&record).await {
        error!("could not persist final record: {err}");
    }

    let summary = record.summary();
    info!(
        status = %status,
        failed_step = summary.failed_step.as_deref().unwrap_or("-"),
        rollback_failures = summary.rollback_failures,
        "execution finished"
    );

    drop(lock);
    record
}
