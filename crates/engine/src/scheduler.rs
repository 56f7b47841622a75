//! Cron-driven scheduler.
//!
//! The scheduler owns the `next_fire_time` of every registered task. Its
//! loop sleeps until the earliest one (never longer than
//! [`SchedulerConfig::max_idle`]), fires every due task through the
//! coordinator, then recomputes and persists each fired task's next fire
//! time from the current instant.
//!
//! Because the next fire time is persisted, a task whose fire was missed
//! while the process was down fires exactly once on the first tick after
//! restart, then resumes its normal cadence.
//!
//! Every tick first re-reads the task table, so tasks another process adds,
//! redefines or deletes take effect within one `max_idle`. A task's
//! in-memory fire time always advances after a fire, even when persisting
//! it fails.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::coordinator::ExecutionCoordinator;
use crate::cron::CronSchedule;
use crate::definitions::{validate_task, DefinitionSet};
use crate::models::{RunContext, ScheduledTask, TaskCommand, TaskSpec, TriggerKind, WorkflowDefinition};
use crate::EngineError;

/// Tuning knobs for the scheduler loop.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Longest the loop sleeps without re-reading the clock and the task
    /// table.
    pub max_idle: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_idle: Duration::from_secs(60),
        }
    }
}

struct Entry {
    task: ScheduledTask,
    schedule: CronSchedule,
    /// Set for command tasks: the single-step workflow a fire runs.
    workflow: Option<Arc<WorkflowDefinition>>,
}

struct Inner {
    coordinator: ExecutionCoordinator,
    config: SchedulerConfig,
    tasks: Mutex<HashMap<String, Entry>>,
    wake: Notify,
}

/// Cheap to clone; clones share the same task table.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(coordinator: ExecutionCoordinator, config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                coordinator,
                config,
                tasks: Mutex::new(HashMap::new()),
                wake: Notify::new(),
            }),
        }
    }

    /// Load persisted tasks. Tasks without a next fire time get one computed
    /// from now; overdue ones are left overdue so the next tick fires them.
    pub async fn load(&self) -> Result<usize, EngineError> {
        let stored = self.inner.coordinator.store().list_tasks().await?;
        let count = stored.len();
        for task in stored {
            match self.install(task).await {
                Ok(task) => debug!(task = %task.spec.name, next = ?task.next_fire_time, "task loaded"),
                Err(err) => error!("skipping unloadable scheduled task: {err}"),
            }
        }
        self.inner.wake.notify_one();
        Ok(count)
    }

    /// Register (or redefine, by name) a scheduled task.
    ///
    /// # Errors
    /// `InvalidCronExpression` or `InvalidDefinition` before anything is
    /// stored.
    pub async fn schedule_task(&self, spec: TaskSpec) -> Result<ScheduledTask, EngineError> {
        validate_task(&spec)?;

        let definitions = self.inner.coordinator.definitions();
        match &spec.command {
            TaskCommand::RunWorkflow { workflow } if definitions.get(workflow).is_none() => {
                return Err(EngineError::UnknownWorkflow(workflow.clone()));
            }
            TaskCommand::RunWorkflow { .. } => {}
            _ if definitions.get(&spec.name).is_some() => {
                return Err(EngineError::invalid(
                    &spec.name,
                    "a workflow with this name exists; command tasks need their own name",
                ));
            }
            _ => {}
        }

        let candidate = ScheduledTask {
            id: Uuid::new_v4().to_string(),
            spec,
            next_fire_time: None,
            last_fired_at: None,
        };
        let now = self.inner.coordinator.clock().now();
        let stored = self.inner.coordinator.store().upsert_task(&candidate, now).await?;
        let task = self.install(stored).await?;

        info!(
            task = %task.spec.name,
            id = %task.id,
            cron = %task.spec.cron,
            next = ?task.next_fire_time,
            "task scheduled"
        );
        self.inner.wake.notify_one();
        Ok(task)
    }

    /// Register a `run_workflow` task for a workflow with a scheduled
    /// trigger. Other workflows are ignored.
    pub async fn schedule_workflow(&self, def: &WorkflowDefinition) -> Result<Option<ScheduledTask>, EngineError> {
        let TriggerKind::Scheduled { cron } = &def.trigger.kind else {
            return Ok(None);
        };
        let spec = TaskSpec::new(
            def.name.clone(),
            cron.clone(),
            TaskCommand::RunWorkflow {
                workflow: def.name.clone(),
            },
        );
        self.schedule_task(spec).await.map(Some)
    }

    /// Schedule every task in `set` and every workflow in it with a
    /// scheduled trigger.
    pub async fn register(&self, set: &DefinitionSet) -> Result<usize, EngineError> {
        let mut count = 0;
        for def in &set.workflows {
            count += usize::from(self.schedule_workflow(def).await?.is_some());
        }
        for spec in &set.scheduled_tasks {
            self.schedule_task(spec.clone()).await?;
            count += 1;
        }
        Ok(count)
    }

    /// Make `task` live: compute a missing or stale next fire time and put
    /// it in the in-memory table.
    async fn install(&self, mut task: ScheduledTask) -> Result<ScheduledTask, EngineError> {
        let schedule = CronSchedule::parse(&task.spec.cron)?;

        let stale = task.next_fire_time.map_or(true, |t| !schedule.matches(t));
        if stale {
            let now = self.inner.coordinator.clock().now();
            task.next_fire_time = Some(schedule.next_after(now)?);
            self.inner
                .coordinator
                .store()
                .update_fire_times(&task.id, task.next_fire_time, task.last_fired_at, now)
                .await?;
        }

        let workflow = task.spec.as_workflow().map(Arc::new);
        self.inner.tasks.lock().insert(
            task.id.clone(),
            Entry {
                task: task.clone(),
                schedule,
                workflow,
            },
        );
        Ok(task)
    }

    /// Remove a task by id or name.
    pub async fn remove_task(&self, id_or_name: &str) -> Result<ScheduledTask, EngineError> {
        let id = self
            .inner
            .tasks
            .lock()
            .values()
            .find(|e| e.task.id == id_or_name || e.task.spec.name == id_or_name)
            .map(|e| e.task.id.clone())
            .ok_or_else(|| EngineError::UnknownTask(id_or_name.to_string()))?;

        // Store first, so a concurrent refresh cannot bring the task back.
        self.inner.coordinator.store().delete_task(&id).await?;
        let entry = self
            .inner
            .tasks
            .lock()
            .remove(&id)
            .ok_or_else(|| EngineError::UnknownTask(id_or_name.to_string()))?;

        info!(task = %entry.task.spec.name, "task removed");
        self.inner.wake.notify_one();
        Ok(entry.task)
    }

    /// Bring the in-memory table in line with the store: install tasks that
    /// are new or were redefined elsewhere and drop deleted ones. Fire times
    /// of unchanged tasks stay as this scheduler last set them.
    pub async fn refresh(&self) -> Result<(), EngineError> {
        let stored = self.inner.coordinator.store().list_tasks().await?;

        let changed: Vec<ScheduledTask> = {
            let mut tasks = self.inner.tasks.lock();
            tasks.retain(|id, entry| {
                let keep = stored.iter().any(|t| &t.id == id);
                if !keep {
                    info!(task = %entry.task.spec.name, "task deleted from the store");
                }
                keep
            });
            stored
                .into_iter()
                .filter(|t| tasks.get(&t.id).map_or(true, |e| e.task.spec != t.spec))
                .collect()
        };

        for task in changed {
            match self.install(task).await {
                Ok(task) => info!(task = %task.spec.name, next = ?task.next_fire_time, "task picked up from the store"),
                Err(err) => error!("skipping unloadable scheduled task: {err}"),
            }
        }
        Ok(())
    }

    /// All registered tasks, sorted by name.
    pub fn list_tasks(&self) -> Vec<ScheduledTask> {
        let mut all: Vec<_> = self.inner.tasks.lock().values().map(|e| e.task.clone()).collect();
        all.sort_by(|a, b| a.spec.name.cmp(&b.spec.name));
        all
    }

    /// The earliest pending fire time.
    pub fn next_wake(&self) -> Option<DateTime<Utc>> {
        self.inner
            .tasks
            .lock()
            .values()
            .filter_map(|e| e.task.next_fire_time)
            .min()
    }

    /// Refresh from the store, fire every task due at `now`, then advance
    /// each fired task to its next fire time after `now`. Returns the number
    /// of tasks fired.
    ///
    /// Store and cron errors are logged per task and never stop the tick.
    pub async fn tick(&self, now: DateTime<Utc>) -> usize {
        if let Err(err) = self.refresh().await {
            warn!("could not refresh scheduled tasks: {err}");
        }

        let mut due: Vec<(ScheduledTask, CronSchedule, Option<Arc<WorkflowDefinition>>)> = self
            .inner
            .tasks
            .lock()
            .values()
            .filter(|e| e.task.next_fire_time.is_some_and(|t| t <= now))
            .map(|e| (e.task.clone(), e.schedule.clone(), e.workflow.clone()))
            .collect();
        due.sort_by_key(|(task, _, _)| task.next_fire_time);

        for (task, schedule, workflow) in &due {
            self.fire(task, workflow.as_ref(), now).await;

            let next = match schedule.next_after(now) {
                Ok(next) => Some(next),
                Err(err) => {
                    error!(task = %task.spec.name, "task disabled, no next fire time: {err}");
                    None
                }
            };

            if let Some(entry) = self.inner.tasks.lock().get_mut(&task.id) {
                entry.task.next_fire_time = next;
                entry.task.last_fired_at = Some(now);
            }

            let persisted = self
                .inner
                .coordinator
                .store()
                .update_fire_times(&task.id, next, Some(now), now)
                .await;
            if let Err(err) = persisted {
                error!(task = %task.spec.name, "could not persist next fire time: {err}");
            }
            debug!(task = %task.spec.name, next = ?next, "task rescheduled");
        }

        due.len()
    }

    async fn fire(&self, task: &ScheduledTask, workflow: Option<&Arc<WorkflowDefinition>>, now: DateTime<Utc>) {
        let ctx = RunContext::scheduled()
            .with_param("task", task.spec.name.clone())
            .with_param("scheduled_at", now.to_rfc3339());

        let coordinator = &self.inner.coordinator;
        let outcome = match workflow {
            Some(def) => coordinator.trigger_definition(Arc::clone(def), ctx).await,
            None => coordinator.trigger(task.spec.target_workflow(), ctx).await,
        };

        match outcome {
            Ok(execution_id) => {
                info!(task = %task.spec.name, %execution_id, "scheduled task fired");
            }
            Err(EngineError::WorkflowLocked(name)) => {
                warn!(task = %task.spec.name, workflow = %name, "previous run still in progress, skipping this fire");
            }
            Err(err) => {
                error!(task = %task.spec.name, "scheduled fire failed: {err}");
            }
        }
    }

    /// Run the timer loop until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(tasks = self.list_tasks().len(), "scheduler started");

        loop {
            let now = self.inner.coordinator.clock().now();
            self.tick(now).await;

            let idle = self.inner.config.max_idle;
            let sleep = match self.next_wake() {
                Some(next) => (next - self.inner.coordinator.clock().now())
                    .to_std()
                    .unwrap_or(Duration::ZERO)
                    .min(idle),
                None => idle,
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.inner.wake.notified() => {}
                _ = tokio::time::sleep(sleep) => {}
            }
        }

        info!("scheduler stopped");
    }

    pub fn spawn(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.clone().run(shutdown))
    }
}
