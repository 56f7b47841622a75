//! End-to-end tests for the coordinator and scheduler.
//!
//! Every test wires the real coordinator to `MockAction`, a
//! `RecordingNotifier` and a `ManualClock`, so no processes are spawned and
//! wall-clock time is fully controlled. Timeout and backoff tests run on a
//! paused tokio clock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use actions::mock::{MockAction, MockBehaviour};
use actions::{ActionRegistry, StepAction};

use crate::clock::ManualClock;
use crate::condition::Condition;
use crate::coordinator::ExecutionCoordinator;
use crate::definitions::DefinitionStore;
use crate::models::{
    Channel, ExecutionRecord, ExecutionStatus, NotificationEvent, NotificationRules, RetryPolicy,
    RunContext, ScheduledTask, Step, StepErrorKind, StepStatus, TaskCommand, TaskSpec, Trigger,
    TriggerEvent, TriggerKind, WorkflowDefinition,
};
use crate::notify::RecordingNotifier;
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::store::{MemoryStore, RecordStore, SqlStore};
use crate::EngineError;

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub(crate) fn at(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 19, h, m, 0).unwrap()
}

pub(crate) struct Harness {
    pub coordinator: ExecutionCoordinator,
    pub mock: MockAction,
    pub notifier: RecordingNotifier,
    pub clock: ManualClock,
    pub store: Arc<dyn RecordStore>,
}

impl Harness {
    pub fn new(mock: MockAction) -> Self {
        Self::with_store(mock, Arc::new(MemoryStore::new()), ManualClock::new(at(1, 0)))
    }

    pub fn with_store(mock: MockAction, store: Arc<dyn RecordStore>, clock: ManualClock) -> Self {
        let notifier = RecordingNotifier::new();
        let coordinator = ExecutionCoordinator::builder(
            Arc::new(DefinitionStore::new()),
            Arc::new(ActionRegistry::uniform(Arc::new(mock.clone()))),
            Arc::clone(&store),
        )
        .notifier(Arc::new(notifier.clone()))
        .clock(Arc::new(clock.clone()))
        .build();

        Self {
            coordinator,
            mock,
            notifier,
            clock,
            store,
        }
    }

    pub fn install(&self, def: WorkflowDefinition) {
        self.coordinator.setup_workflow(def).unwrap();
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(self.coordinator.clone(), SchedulerConfig::default())
    }

    /// Wait until no execution holds a run lock.
    pub async fn wait_idle(&self) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3_600);
        while !self.coordinator.running().is_empty() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "executions still running: {:?}",
                self.coordinator.running()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

pub(crate) fn step(name: &str) -> Step {
    Step::new(name, StepAction::ExecuteScript { path: format!("scripts/{name}.sh"), args: vec![] })
}

fn workflow(name: &str, steps: &[&str]) -> WorkflowDefinition {
    WorkflowDefinition::new(name, TriggerKind::Manual, steps.iter().map(|s| step(s)).collect())
}

fn statuses(results: &[crate::models::StepResult]) -> Vec<StepStatus> {
    results.iter().map(|r| r.status).collect()
}

fn failure_rules() -> NotificationRules {
    NotificationRules {
        on_start: vec![Channel::new("slack", "#deploys")],
        on_success: vec![Channel::new("slack", "#deploys")],
        on_failure: vec![
            Channel::new("slack", "#deploys"),
            Channel::new("email", "ops@example.com"),
        ],
    }
}

// ============================================================
// Sequencing
// ============================================================

#[tokio::test]
async fn successful_run_executes_steps_in_order() {
    let h = Harness::new(MockAction::succeeding());
    h.install(workflow("build", &["checkout", "compile", "package"]).with_notifications(failure_rules()));

    let record = h.coordinator.run("build", RunContext::manual()).await.unwrap();

    assert_eq!(record.status, ExecutionStatus::Succeeded);
    assert_eq!(statuses(&record.steps), vec![StepStatus::Succeeded; 3]);
    assert_eq!(h.mock.executed_steps(), vec!["checkout", "compile", "package"]);
    assert_eq!(record.end_time, Some(at(1, 0)));
    assert_eq!(
        h.notifier.events(),
        vec![NotificationEvent::OnStart, NotificationEvent::OnSuccess]
    );

    let stored = h.store.get_execution(record.id).await.unwrap().unwrap();
    assert_eq!(stored, record);
}

#[tokio::test]
async fn deploy_scenario_failed_test_skips_deploy() {
    let h = Harness::new(
        MockAction::succeeding().on_step("test", MockBehaviour::FailFatal("2 tests failed".into())),
    );
    h.install(workflow("deploy", &["build", "test", "deploy-staging"]));

    let record = h.coordinator.run("deploy", RunContext::manual()).await.unwrap();

    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(
        statuses(&record.steps),
        vec![StepStatus::Succeeded, StepStatus::Failed, StepStatus::Skipped]
    );
    assert_eq!(h.mock.executed_steps(), vec!["build", "test"]);
    assert!(record.rollback_results.is_empty());
    assert_eq!(record.summary().failed_step.as_deref(), Some("test"));
}

#[tokio::test]
async fn failure_in_the_middle_of_a_long_workflow() {
    let names = ["s1", "s2", "s3", "s4", "s5", "s6"];
    for failing in 0..names.len() {
        let h = Harness::new(
            MockAction::succeeding().on_step(names[failing], MockBehaviour::FailFatal("x".into())),
        );
        h.install(workflow("wf", &names));

        let record = h.coordinator.run("wf", RunContext::manual()).await.unwrap();

        assert_eq!(record.steps.len(), names.len());
        for (i, result) in record.steps.iter().enumerate() {
            let expected = match i.cmp(&failing) {
                std::cmp::Ordering::Less => StepStatus::Succeeded,
                std::cmp::Ordering::Equal => StepStatus::Failed,
                std::cmp::Ordering::Greater => StepStatus::Skipped,
            };
            assert_eq!(result.status, expected, "failing={failing} step={i}");
        }
    }
}

#[tokio::test]
async fn false_condition_skips_without_failing() {
    let h = Harness::new(MockAction::succeeding());
    let gated = step("deploy-staging").with_condition(Condition::parse(r#"branch == "main""#).unwrap());
    h.install(WorkflowDefinition::new(
        "deploy",
        TriggerKind::Manual,
        vec![step("build"), gated, step("report")],
    ));

    let record = h
        .coordinator
        .run("deploy", RunContext::manual().with_param("branch", "feature/x"))
        .await
        .unwrap();
    assert_eq!(record.status, ExecutionStatus::Succeeded);
    assert_eq!(
        statuses(&record.steps),
        vec![StepStatus::Succeeded, StepStatus::Skipped, StepStatus::Succeeded]
    );

    let record = h
        .coordinator
        .run("deploy", RunContext::manual().with_param("branch", "main"))
        .await
        .unwrap();
    assert_eq!(statuses(&record.steps), vec![StepStatus::Succeeded; 3]);
}

#[tokio::test]
async fn actions_see_step_name_and_first_attempt() {
    let h = Harness::new(MockAction::succeeding());
    h.install(workflow("wf", &["only"]));

    h.coordinator
        .run("wf", RunContext::manual().with_param("version", "1.2.3"))
        .await
        .unwrap();

    assert_eq!(h.mock.call_count(), 1);
    let call = &h.mock.calls()[0];
    assert_eq!(call.step, "only");
    assert_eq!(call.attempt, 1);
}

// ============================================================
// Rollback
// ============================================================

#[tokio::test]
async fn forward_failure_runs_every_rollback_step() {
    let h = Harness::new(
        MockAction::succeeding()
            .on_step("migrate", MockBehaviour::FailFatal("lock timeout".into()))
            .on_step("restore-db", MockBehaviour::FailFatal("no snapshot".into())),
    );
    h.install(
        workflow("release", &["build", "migrate", "switch"])
            .with_rollback(vec![step("restore-db"), step("restore-binaries"), step("page-oncall")])
            .with_notifications(failure_rules()),
    );

    let record = h.coordinator.run("release", RunContext::manual()).await.unwrap();

    assert_eq!(record.status, ExecutionStatus::RolledBack);
    assert_eq!(
        statuses(&record.steps),
        vec![StepStatus::Succeeded, StepStatus::Failed, StepStatus::Skipped]
    );
    assert_eq!(record.rollback_results.len(), 3);
    assert!(record.rollback_results.iter().all(|r| r.status != StepStatus::Skipped));
    assert_eq!(record.summary().rollback_failures, 1);
    assert_eq!(
        h.mock.executed_steps(),
        vec!["build", "migrate", "restore-db", "restore-binaries", "page-oncall"]
    );

    let failure_deliveries = h
        .notifier
        .deliveries()
        .into_iter()
        .filter(|d| d.payload.event == NotificationEvent::OnFailure)
        .count();
    assert_eq!(failure_deliveries, 2);
}

#[tokio::test]
async fn rollback_is_not_run_on_success() {
    let h = Harness::new(MockAction::succeeding());
    h.install(workflow("wf", &["a"]).with_rollback(vec![step("undo")]));

    let record = h.coordinator.run("wf", RunContext::manual()).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Succeeded);
    assert!(record.rollback_results.is_empty());
    assert_eq!(h.mock.call_count_for("undo"), 0);
}

// ============================================================
// Timeouts and retries
// ============================================================

#[tokio::test(start_paused = true)]
async fn step_timeout_fails_after_about_one_second() {
    let h = Harness::new(
        MockAction::succeeding().on_step("slow", MockBehaviour::Sleep(Duration::from_secs(5))),
    );
    h.install(WorkflowDefinition::new(
        "wf",
        TriggerKind::Manual,
        vec![step("slow").with_timeout(1), step("after")],
    ));

    let record = h.coordinator.run("wf", RunContext::manual()).await.unwrap();

    assert_eq!(record.status, ExecutionStatus::Failed);
    let slow = &record.steps[0];
    assert_eq!(slow.error_kind(), Some(StepErrorKind::Timeout));
    assert!(slow.duration() >= Duration::from_secs(1));
    assert!(slow.duration() < Duration::from_millis(1_500));
    assert_eq!(record.steps[1].status, StepStatus::Skipped);
}

#[tokio::test(start_paused = true)]
async fn always_failing_step_is_attempted_exactly_max_attempts_times() {
    let h = Harness::new(
        MockAction::succeeding().on_step("flaky", MockBehaviour::FailRetryable("503".into())),
    );
    h.install(WorkflowDefinition::new(
        "wf",
        TriggerKind::Manual,
        vec![step("flaky").with_retry(RetryPolicy::new(3, 1_000))],
    ));

    let record = h.coordinator.run("wf", RunContext::manual()).await.unwrap();

    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.steps[0].attempts, 3);
    assert_eq!(h.mock.call_count_for("flaky"), 3);
    // 1s + 2s of backoff
    assert!(record.steps[0].duration() >= Duration::from_secs(3));
}

// ============================================================
// Mutual exclusion
// ============================================================

#[tokio::test(start_paused = true)]
async fn second_trigger_while_running_is_locked() {
    let h = Harness::new(
        MockAction::succeeding().on_step("long", MockBehaviour::Sleep(Duration::from_secs(5))),
    );
    h.install(workflow("wf", &["long"]));
    h.install(workflow("other", &["quick"]));

    let first = h.coordinator.trigger("wf", RunContext::manual()).await.unwrap();
    let second = h.coordinator.trigger("wf", RunContext::manual()).await;
    assert!(matches!(second, Err(EngineError::WorkflowLocked(ref name)) if name == "wf"));

    // Other workflows are unaffected.
    h.coordinator.trigger("other", RunContext::manual()).await.unwrap();

    assert_eq!(h.store.list_running().await.unwrap().len(), 2);
    h.wait_idle().await;

    let record = h.coordinator.execution(first).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Succeeded);

    let third = h.coordinator.trigger("wf", RunContext::manual()).await.unwrap();
    assert_ne!(third, first);
    h.wait_idle().await;

    let runs = h.store.list_executions(Some("wf"), 10).await.unwrap();
    assert_eq!(runs.len(), 2);
}

#[tokio::test]
async fn lock_holds_across_coordinators_sharing_a_store() {
    let pool = db::pool::create_in_memory_pool().await.unwrap();
    let store: Arc<dyn RecordStore> = Arc::new(SqlStore::new(pool));
    let slow = || MockAction::succeeding().on_step("long", MockBehaviour::Sleep(Duration::from_millis(300)));

    // Two processes, e.g. `serve` and a second orchestrator on the same file.
    let a = Harness::with_store(slow(), Arc::clone(&store), ManualClock::new(at(1, 0)));
    let b = Harness::with_store(slow(), Arc::clone(&store), ManualClock::new(at(1, 0)));
    a.install(workflow("wf", &["long"]));
    b.install(workflow("wf", &["long"]));

    let first = a.coordinator.trigger("wf", RunContext::manual()).await.unwrap();
    let second = b.coordinator.trigger("wf", RunContext::manual()).await;
    assert!(matches!(second, Err(EngineError::WorkflowLocked(ref name)) if name == "wf"));
    assert!(b.coordinator.running().is_empty());
    assert_eq!(store.list_running().await.unwrap().len(), 1);

    a.wait_idle().await;
    let record = a.coordinator.execution(first).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Succeeded);

    let record = b.coordinator.run("wf", RunContext::manual()).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Succeeded);
    assert_eq!(store.list_executions(Some("wf"), 10).await.unwrap().len(), 2);
    assert_eq!(a.mock.call_count() + b.mock.call_count(), 2);
}

#[tokio::test]
async fn unknown_workflow_creates_no_record() {
    let h = Harness::new(MockAction::succeeding());
    let err = h.coordinator.trigger("ghost", RunContext::manual()).await.unwrap_err();
    assert!(matches!(err, EngineError::UnknownWorkflow(_)));
    assert!(h.store.list_executions(None, 10).await.unwrap().is_empty());
}

// ============================================================
// Cancellation
// ============================================================

#[tokio::test(start_paused = true)]
async fn cancel_fails_the_step_and_rolls_back() {
    let h = Harness::new(
        MockAction::succeeding().on_step("soak", MockBehaviour::Sleep(Duration::from_secs(3_600))),
    );
    h.install(workflow("wf", &["prepare", "soak", "finish"]).with_rollback(vec![step("undo")]));

    let id = h.coordinator.trigger("wf", RunContext::manual()).await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert!(h.coordinator.cancel(id).await.unwrap());
    h.wait_idle().await;

    let record = h.coordinator.execution(id).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::RolledBack);
    assert_eq!(record.steps[1].error_kind(), Some(StepErrorKind::Cancelled));
    assert_eq!(record.steps[2].status, StepStatus::Skipped);
    assert_eq!(record.rollback_results[0].status, StepStatus::Succeeded);

    // Already finished: nothing to cancel.
    assert!(!h.coordinator.cancel(id).await.unwrap());
    assert!(matches!(
        h.coordinator.cancel(uuid::Uuid::new_v4()).await,
        Err(EngineError::UnknownExecution(_))
    ));
}

#[tokio::test]
async fn cancel_is_not_lost_when_remaining_steps_are_skipped() {
    let h = Harness::new(MockAction::succeeding());
    let gate = || Condition::parse(r#"branch == "main""#).unwrap();
    h.install(WorkflowDefinition::new(
        "wf",
        TriggerKind::Manual,
        vec![step("gated").with_condition(gate()), step("also-gated").with_condition(gate())],
    ));

    // The run task has not been polled yet; every step would be skipped.
    let id = h.coordinator.trigger("wf", RunContext::manual()).await.unwrap();
    assert!(h.coordinator.cancel(id).await.unwrap());
    h.wait_idle().await;

    let record = h.coordinator.execution(id).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.steps[0].error_kind(), Some(StepErrorKind::Cancelled));
    assert_eq!(record.steps[1].status, StepStatus::Skipped);
    assert_eq!(h.mock.call_count(), 0);
}

#[tokio::test]
async fn panicking_action_fails_the_run_and_rolls_back() {
    let h = Harness::new(
        MockAction::succeeding().on_step("buggy", MockBehaviour::Panic("boom".into())),
    );
    h.install(
        workflow("wf", &["buggy", "after"])
            .with_rollback(vec![step("undo")])
            .with_notifications(failure_rules()),
    );

    let record = h.coordinator.run("wf", RunContext::manual()).await.unwrap();

    assert_eq!(record.status, ExecutionStatus::RolledBack);
    assert_eq!(record.steps[0].error_kind(), Some(StepErrorKind::Fatal));
    assert!(record.steps[0].error.as_ref().unwrap().message.contains("boom"));
    assert_eq!(record.steps[1].status, StepStatus::Skipped);
    assert_eq!(record.rollback_results[0].status, StepStatus::Succeeded);

    assert!(h.coordinator.running().is_empty());
    assert!(h.store.list_running().await.unwrap().is_empty());
    let events = h.notifier.events();
    assert_eq!(events.first(), Some(&NotificationEvent::OnStart));
    assert!(events.contains(&NotificationEvent::OnFailure));
}

// ============================================================
// Events
// ============================================================

#[tokio::test]
async fn git_push_respects_branch_and_conditions() {
    let h = Harness::new(MockAction::succeeding());
    let mut def = workflow("deploy", &["build"]);
    def.trigger = Trigger {
        kind: TriggerKind::GitPush { branch: "main".into() },
        conditions: vec![Condition::parse(r#"author != "bot""#).unwrap()],
    };
    h.install(def);

    let push = |branch: &str, author: &str| TriggerEvent::GitPush {
        branch: branch.into(),
        params: [("author".to_string(), author.to_string())].into(),
    };

    assert!(h.coordinator.handle_event(push("main", "bot")).await.is_empty());
    assert!(h.coordinator.handle_event(push("dev", "alice")).await.is_empty());

    let outcomes = h.coordinator.handle_event(push("main", "alice")).await;
    assert_eq!(outcomes.len(), 1);
    let id = outcomes[0].execution_id.unwrap();
    h.wait_idle().await;

    let record = h.coordinator.execution(id).await.unwrap();
    assert_eq!(record.trigger_type, crate::models::TriggerType::GitPush);
    assert_eq!(record.params.get("branch").map(String::as_str), Some("main"));
}

#[tokio::test]
async fn webhook_event_reports_locked_workflows() {
    let h = Harness::new(
        MockAction::succeeding().on_step("wait", MockBehaviour::Sleep(Duration::from_millis(200))),
    );
    let mut def = workflow("hooked", &["wait"]);
    def.trigger = Trigger::new(TriggerKind::Webhook { path: "deploy/prod".into() });
    h.install(def);

    let hit = || TriggerEvent::Webhook {
        path: "/deploy/prod".into(),
        params: Default::default(),
    };

    let first = h.coordinator.handle_event(hit()).await;
    assert!(first[0].execution_id.is_some());

    let second = h.coordinator.handle_event(hit()).await;
    assert!(second[0].execution_id.is_none());
    assert!(second[0].error.as_deref().unwrap_or_default().contains("already running"));

    h.wait_idle().await;
}

// ============================================================
// Notifications, status, recovery
// ============================================================

#[tokio::test]
async fn notification_failures_do_not_change_the_outcome() {
    let notifier = RecordingNotifier::failing_on(&["slack"]);
    let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
    let mock = MockAction::succeeding();
    let coordinator = ExecutionCoordinator::builder(
        Arc::new(DefinitionStore::new()),
        Arc::new(ActionRegistry::uniform(Arc::new(mock))),
        store,
    )
    .notifier(Arc::new(notifier.clone()))
    .build();
    coordinator
        .setup_workflow(workflow("wf", &["a"]).with_notifications(failure_rules()))
        .unwrap();

    let record = coordinator.run("wf", RunContext::manual()).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Succeeded);
    assert_eq!(notifier.deliveries().len(), 2);
}

#[tokio::test]
async fn status_lists_newest_first_and_reports_rollback_failures() {
    let h = Harness::new(
        MockAction::succeeding()
            .on_step("b", MockBehaviour::FailFatal("x".into()))
            .on_step("undo", MockBehaviour::FailFatal("y".into())),
    );
    h.install(workflow("ok", &["a"]));
    h.install(workflow("bad", &["b"]).with_rollback(vec![step("undo")]));

    h.coordinator.run("ok", RunContext::manual()).await.unwrap();
    h.clock.advance(chrono::Duration::minutes(1));
    h.coordinator.run("bad", RunContext::manual()).await.unwrap();

    let all = h.coordinator.status(None).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].workflow_name, "bad");
    assert_eq!(all[0].status, ExecutionStatus::RolledBack);
    assert_eq!(all[0].rollback_failures, 1);
    assert_eq!(all[1].status, ExecutionStatus::Succeeded);

    assert_eq!(h.coordinator.status(Some("ok")).await.unwrap().len(), 1);
    assert!(matches!(
        h.coordinator.status(Some("ghost")).await,
        Err(EngineError::UnknownWorkflow(_))
    ));
}

#[tokio::test]
async fn interrupted_runs_are_frozen_as_failed() {
    let h = Harness::new(MockAction::succeeding());
    let def = workflow("wf", &["a"]);
    let orphan = crate::models::ExecutionRecord::start(&def, &RunContext::manual(), at(0, 30));
    h.store.save_execution(&orphan).await.unwrap();

    assert_eq!(h.coordinator.recover_interrupted().await.unwrap(), 1);

    let record = h.coordinator.execution(orphan.id).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert!(record.error.is_some());
    assert!(h.store.list_running().await.unwrap().is_empty());
}

// ============================================================
// Scheduler
// ============================================================

fn backup_task() -> TaskSpec {
    TaskSpec::new(
        "nightly-backup",
        "0 2 * * *",
        TaskCommand::ExecuteScript {
            path: "scripts/backup.sh".into(),
            args: vec!["--full".into()],
        },
    )
}

#[tokio::test]
async fn missed_fire_runs_once_after_restart() {
    let pool = db::pool::create_in_memory_pool().await.unwrap();
    let store: Arc<dyn RecordStore> = Arc::new(SqlStore::new(pool));

    // First process: scheduled at 01:00, stops before 02:00.
    {
        let h = Harness::with_store(MockAction::succeeding(), Arc::clone(&store), ManualClock::new(at(1, 0)));
        let scheduler = h.scheduler();
        let task = scheduler.schedule_task(backup_task()).await.unwrap();
        assert_eq!(task.next_fire_time, Some(at(2, 0)));
        assert_eq!(scheduler.tick(at(1, 0)).await, 0);
    }

    // Second process starts at 03:00.
    let h = Harness::with_store(MockAction::succeeding(), Arc::clone(&store), ManualClock::new(at(3, 0)));
    let scheduler = h.scheduler();
    assert_eq!(scheduler.load().await.unwrap(), 1);

    assert_eq!(scheduler.tick(at(3, 0)).await, 1);
    h.wait_idle().await;
    assert_eq!(scheduler.tick(at(3, 0)).await, 0);

    let tomorrow = Utc.with_ymd_and_hms(2026, 10, 20, 2, 0, 0).unwrap();
    assert_eq!(scheduler.next_wake(), Some(tomorrow));
    assert_eq!(store.list_tasks().await.unwrap()[0].next_fire_time, Some(tomorrow));

    let runs = h.coordinator.status(Some("nightly-backup")).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, ExecutionStatus::Succeeded);
    assert_eq!(h.mock.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn locked_fire_is_skipped_but_schedule_advances() {
    let h = Harness::new(
        MockAction::succeeding().on_step("long", MockBehaviour::Sleep(Duration::from_secs(30))),
    );
    let mut def = workflow("report", &["long"]);
    def.trigger = Trigger::new(TriggerKind::Scheduled { cron: "*/5 * * * *".into() });
    h.install(def.clone());

    let scheduler = h.scheduler();
    scheduler.schedule_workflow(&def).await.unwrap().unwrap();
    assert_eq!(scheduler.next_wake(), Some(at(1, 5)));

    assert_eq!(scheduler.tick(at(1, 5)).await, 1);
    assert!(h.coordinator.is_running("report"));

    assert_eq!(scheduler.tick(at(1, 10)).await, 1);
    assert_eq!(scheduler.next_wake(), Some(at(1, 15)));

    h.wait_idle().await;
    assert_eq!(h.store.list_executions(Some("report"), 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn invalid_task_is_rejected_before_storage() {
    let h = Harness::new(MockAction::succeeding());
    let scheduler = h.scheduler();

    let mut bad = backup_task();
    bad.cron = "61 * * * *".into();
    assert!(matches!(
        scheduler.schedule_task(bad).await,
        Err(EngineError::InvalidCronExpression { .. })
    ));
    assert!(h.store.list_tasks().await.unwrap().is_empty());

    h.install(workflow("nightly-backup", &["a"]));
    assert!(matches!(
        scheduler.schedule_task(backup_task()).await,
        Err(EngineError::InvalidDefinition { .. })
    ));
}

#[tokio::test]
async fn tasks_can_be_listed_replaced_and_removed() {
    let h = Harness::new(MockAction::succeeding());
    let scheduler = h.scheduler();

    let first = scheduler.schedule_task(backup_task()).await.unwrap();
    let mut moved = backup_task();
    moved.cron = "30 4 * * *".into();
    let second = scheduler.schedule_task(moved).await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(second.next_fire_time, Some(at(4, 30)));
    assert_eq!(scheduler.list_tasks().len(), 1);

    scheduler.remove_task("nightly-backup").await.unwrap();
    assert!(scheduler.list_tasks().is_empty());
    assert!(matches!(
        scheduler.remove_task("nightly-backup").await,
        Err(EngineError::UnknownTask(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn scheduler_loop_stops_on_shutdown() {
    let h = Harness::new(MockAction::succeeding());
    let scheduler = h.scheduler();
    scheduler.schedule_task(backup_task()).await.unwrap();

    let shutdown = tokio_util::sync::CancellationToken::new();
    let handle = scheduler.spawn(shutdown.clone());
    tokio::time::sleep(Duration::from_secs(1)).await;
    shutdown.cancel();
    handle.await.unwrap();

    // The manual clock never reached 02:00, so nothing fired.
    assert_eq!(h.mock.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn scheduler_loop_replans_and_fires_at_the_wake_time() {
    let h = Harness::new(MockAction::succeeding());
    let scheduler = Scheduler::new(
        h.coordinator.clone(),
        SchedulerConfig {
            max_idle: Duration::from_secs(6 * 3_600),
        },
    );
    let shutdown = CancellationToken::new();
    let handle = scheduler.spawn(shutdown.clone());

    // Nothing registered: the loop goes to sleep for max_idle.
    tokio::time::sleep(Duration::from_secs(1)).await;

    // Scheduling wakes it; it re-plans for 01:05, five minutes away.
    let mut every_five = backup_task();
    every_five.cron = "*/5 * * * *".into();
    scheduler.schedule_task(every_five).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.mock.call_count(), 0);

    h.clock.set(at(1, 5));
    tokio::time::sleep(Duration::from_secs(300)).await;
    h.wait_idle().await;

    assert_eq!(h.mock.call_count(), 1);
    let runs = h.store.list_executions(Some("nightly-backup"), 10).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].trigger_type, crate::models::TriggerType::Scheduled);
    assert_eq!(scheduler.next_wake(), Some(at(1, 10)));

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn running_scheduler_picks_up_tasks_added_elsewhere() {
    let pool = db::pool::create_in_memory_pool().await.unwrap();
    let store: Arc<dyn RecordStore> = Arc::new(SqlStore::new(pool));

    let live = Harness::with_store(MockAction::succeeding(), Arc::clone(&store), ManualClock::new(at(1, 0)));
    let scheduler = live.scheduler();
    assert_eq!(scheduler.load().await.unwrap(), 0);

    // Another process registers a task against the same database.
    let other = Harness::with_store(MockAction::succeeding(), Arc::clone(&store), ManualClock::new(at(1, 0)));
    let remote = other.scheduler();
    let added = remote.schedule_task(backup_task()).await.unwrap();
    assert_eq!(added.next_fire_time, Some(at(2, 0)));

    assert_eq!(scheduler.tick(at(2, 0)).await, 1);
    live.wait_idle().await;
    assert_eq!(live.mock.call_count(), 1);
    assert_eq!(other.mock.call_count(), 0);

    // Deletion elsewhere is picked up too.
    remote.remove_task("nightly-backup").await.unwrap();
    assert_eq!(scheduler.tick(at(3, 0)).await, 0);
    assert!(scheduler.list_tasks().is_empty());
}

/// Delegates to a `MemoryStore`, but fire-time writes can be made to fail.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    fail_fire_times: AtomicBool,
}

#[async_trait]
impl RecordStore for FlakyStore {
    async fn save_execution(&self, record: &ExecutionRecord) -> Result<(), EngineError> {
        self.inner.save_execution(record).await
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<ExecutionRecord>, EngineError> {
        self.inner.get_execution(id).await
    }

    async fn list_executions(
        &self,
        workflow: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, EngineError> {
        self.inner.list_executions(workflow, limit).await
    }

    async fn list_running(&self) -> Result<Vec<ExecutionRecord>, EngineError> {
        self.inner.list_running().await
    }

    async fn upsert_task(&self, task: &ScheduledTask, now: DateTime<Utc>) -> Result<ScheduledTask, EngineError> {
        self.inner.upsert_task(task, now).await
    }

    async fn list_tasks(&self) -> Result<Vec<ScheduledTask>, EngineError> {
        self.inner.list_tasks().await
    }

    async fn update_fire_times(
        &self,
        id: &str,
        next_fire_time: Option<DateTime<Utc>>,
        last_fired_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        if self.fail_fire_times.load(Ordering::SeqCst) {
            return Err(EngineError::Database(db::DbError::NotFound));
        }
        self.inner.update_fire_times(id, next_fire_time, last_fired_at, now).await
    }

    async fn delete_task(&self, id: &str) -> Result<bool, EngineError> {
        self.inner.delete_task(id).await
    }
}

#[tokio::test]
async fn failed_fire_time_write_still_advances_every_due_task() {
    let store = Arc::new(FlakyStore::default());
    let h = Harness::with_store(MockAction::succeeding(), store.clone(), ManualClock::new(at(1, 0)));
    let scheduler = h.scheduler();

    let mut hourly = backup_task();
    hourly.name = "hourly-sync".into();
    hourly.cron = "0 * * * *".into();
    scheduler.schedule_task(hourly).await.unwrap();
    scheduler.schedule_task(backup_task()).await.unwrap();

    store.fail_fire_times.store(true, Ordering::SeqCst);
    assert_eq!(scheduler.tick(at(2, 0)).await, 2);
    h.wait_idle().await;

    let tomorrow = Utc.with_ymd_and_hms(2026, 10, 20, 2, 0, 0).unwrap();
    let next: Vec<_> = scheduler.list_tasks().iter().map(|t| t.next_fire_time).collect();
    assert_eq!(next, vec![Some(at(3, 0)), Some(tomorrow)]);
    assert_eq!(scheduler.next_wake(), Some(at(3, 0)));

    // No re-fire of the same slot, so no hot loop.
    assert_eq!(scheduler.tick(at(2, 0)).await, 0);
    assert_eq!(h.mock.call_count(), 2);
}

#[tokio::test]
async fn workflow_task_needs_a_defined_workflow() {
    let h = Harness::new(MockAction::succeeding());
    let spec = TaskSpec::new(
        "weekly-report",
        "0 6 * * 1",
        TaskCommand::RunWorkflow { workflow: "report".into() },
    );

    assert!(matches!(
        h.scheduler().schedule_task(spec.clone()).await,
        Err(EngineError::UnknownWorkflow(name)) if name == "report"
    ));

    h.install(workflow("report", &["collect"]));
    h.scheduler().schedule_task(spec).await.unwrap();
}
