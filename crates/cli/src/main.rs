//! `orchestrator` CLI entry-point.
//!
//! Available sub-commands:
//! - `serve`           — run the scheduler and the HTTP API.
//! - `setup-workflow`  — validate a definition file and install it.
//! - `run-workflow`    — start a run on a live server and wait for it.
//! - `workflow-status` — list recent executions.
//! - `schedule-task`   — register a cron task with a live server.
//! - `cancel`          — cancel a run on a live server.
//! - `validate`        — check a definition file or directory.
//!
//! Workflows only ever execute inside `serve`, which owns the run locks and
//! the scheduler. The commands that start or stop work talk to it over HTTP.

mod client;
mod runtime;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use engine::models::TaskCommand;
use client::ServerClient;
use engine::{DefinitionSet, ExecutionStatus, ExecutionSummary, SchedulerConfig, TaskSpec};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(
    name = "orchestrator",
    about = "Workflow and scheduled-task orchestration engine",
    version
)]
struct Cli {
    /// SQLite database holding execution history and scheduled tasks.
    #[arg(
        long,
        global = true,
        env = "ORCHESTRATOR_DATABASE_URL",
        default_value = "sqlite://orchestrator.db"
    )]
    database_url: String,

    /// Directory of workflow definition files (.yaml, .yml, .json).
    #[arg(
        long,
        global = true,
        env = "ORCHESTRATOR_WORKFLOWS_DIR",
        default_value = "workflows"
    )]
    workflows_dir: PathBuf,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler and the REST API until interrupted.
    Serve {
        #[arg(long, env = "ORCHESTRATOR_BIND", default_value = "0.0.0.0:8080")]
        bind: String,
        /// Longest the scheduler sleeps between clock checks.
        #[arg(long, default_value_t = 60)]
        max_idle_secs: u64,
    },
    /// Validate a definition file and copy it into the workflows directory.
    SetupWorkflow {
        path: PathBuf,
    },
    /// Start a workflow run on the server and wait for it to finish.
    RunWorkflow {
        name: String,
        /// Run parameter, `key=value`. Repeatable.
        #[arg(short, long = "param", value_parser = parse_key_val)]
        params: Vec<(String, String)>,
        /// Print the execution id and return without waiting.
        #[arg(long)]
        detach: bool,
        #[command(flatten)]
        server: ServerArgs,
    },
    /// Show recent executions, newest first.
    WorkflowStatus {
        name: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Register (or redefine) a cron task.
    ScheduleTask {
        name: String,
        #[arg(long)]
        cron: String,
        #[command(flatten)]
        target: TaskTarget,
        /// Script argument. Repeatable.
        #[arg(long = "arg", requires = "script", allow_hyphen_values = true)]
        args: Vec<String>,
        #[command(flatten)]
        server: ServerArgs,
    },
    /// Cancel a running execution on a live server.
    Cancel {
        id: Uuid,
        #[command(flatten)]
        server: ServerArgs,
    },
    /// Validate a definition file or directory.
    Validate {
        path: PathBuf,
    },
}

#[derive(Args)]
struct ServerArgs {
    /// Base URL of the running `orchestrator serve`.
    #[arg(long, env = "ORCHESTRATOR_SERVER", default_value = "http://127.0.0.1:8080")]
    server: String,
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct TaskTarget {
    /// Trigger this workflow.
    #[arg(long)]
    workflow: Option<String>,
    /// Run this script.
    #[arg(long)]
    script: Option<String>,
    /// Deploy to this environment.
    #[arg(long)]
    deploy: Option<String>,
}

impl TaskTarget {
    fn into_command(self, args: Vec<String>) -> anyhow::Result<TaskCommand> {
        Ok(match (self.workflow, self.script, self.deploy) {
            (Some(workflow), _, _) => TaskCommand::RunWorkflow { workflow },
            (_, Some(path), _) => TaskCommand::ExecuteScript { path, args },
            (_, _, Some(environment)) => TaskCommand::Deploy { environment },
            _ => bail!("one of --workflow, --script or --deploy is required"),
        })
    }
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{s}'"))?;
    if key.is_empty() {
        return Err(format!("empty key in '{s}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Serve { bind, max_idle_secs } => {
            let config = SchedulerConfig {
                max_idle: Duration::from_secs(max_idle_secs.max(1)),
            };
            serve(&cli.database_url, &cli.workflows_dir, &bind, config).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::SetupWorkflow { path } => setup_workflow(&path, &cli.workflows_dir),
        Command::RunWorkflow {
            name,
            params,
            detach,
            server,
        } => run_workflow(&ServerClient::new(&server.server), &name, params, detach).await,
        Command::WorkflowStatus { name, json } => {
            let rt = runtime::open(&cli.database_url, &cli.workflows_dir, SchedulerConfig::default()).await?;
            let summaries = rt.coordinator.status(name.as_deref()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summaries)?);
            } else {
                print_summaries(&summaries);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::ScheduleTask {
            name,
            cron,
            target,
            args,
            server,
        } => {
            let spec = TaskSpec::new(name, cron, target.into_command(args)?);
            let task = ServerClient::new(&server.server)
                .schedule_task(&spec)
                .await
                .context("scheduling task")?;
            let next = task
                .next_fire_time
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".into());
            println!("{} {} next fire {next}", task.id, task.spec.name);
            Ok(ExitCode::SUCCESS)
        }
        Command::Cancel { id, server } => cancel(&ServerClient::new(&server.server), id).await,
        Command::Validate { path } => Ok(validate(&path)),
    }
}

async fn serve(
    database_url: &str,
    workflows_dir: &Path,
    bind: &str,
    scheduler_config: SchedulerConfig,
) -> anyhow::Result<()> {
    let rt = runtime::open(database_url, workflows_dir, scheduler_config).await?;

    let recovered = rt.coordinator.recover_interrupted().await?;
    if recovered > 0 {
        warn!(recovered, "marked interrupted executions as failed");
    }
    rt.scheduler.load().await?;
    rt.scheduler
        .register(&rt.definitions)
        .await
        .context("registering scheduled tasks")?;

    let shutdown = CancellationToken::new();
    let scheduler = rt.scheduler.spawn(shutdown.clone());

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("shutdown requested");
                    shutdown.cancel();
                }
                Err(err) => error!("cannot listen for shutdown signal: {err}"),
            }
        }
    });

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    let state = api::AppState {
        coordinator: rt.coordinator.clone(),
        scheduler: rt.scheduler.clone(),
    };
    let served = api::serve(listener, state, shutdown.clone()).await;

    shutdown.cancel();
    scheduler.await.context("scheduler task failed")?;
    served.context("api server failed")
}

fn setup_workflow(path: &Path, workflows_dir: &Path) -> anyhow::Result<ExitCode> {
    let incoming = DefinitionSet::load_file(path)?;
    incoming.validate()?;
    let file_name = path
        .file_name()
        .with_context(|| format!("{} is not a file", path.display()))?;
    let target = workflows_dir.join(file_name);

    // Installed definitions plus the new file must still be consistent.
    let mut combined = runtime::load_definitions(workflows_dir)?;
    if target.is_file() {
        let replaced = DefinitionSet::load_file(&target)?;
        combined
            .workflows
            .retain(|w| !replaced.workflows.iter().any(|r| r.name == w.name));
        combined
            .scheduled_tasks
            .retain(|t| !replaced.scheduled_tasks.iter().any(|r| r.name == t.name));
    }
    combined.merge(incoming.clone());
    combined.validate()?;

    std::fs::create_dir_all(workflows_dir)
        .with_context(|| format!("creating {}", workflows_dir.display()))?;
    std::fs::copy(path, &target).with_context(|| format!("copying to {}", target.display()))?;

    for wf in &incoming.workflows {
        println!("installed workflow {} ({} steps)", wf.name, wf.steps.len());
    }
    for task in &incoming.scheduled_tasks {
        println!("installed task {} ({})", task.name, task.cron);
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_workflow(
    client: &ServerClient,
    name: &str,
    params: Vec<(String, String)>,
    detach: bool,
) -> anyhow::Result<ExitCode> {
    let id = client
        .run_workflow(name, params.into_iter().collect())
        .await
        .with_context(|| format!("starting workflow '{name}'"))?;
    if detach {
        println!("{id}");
        return Ok(ExitCode::SUCCESS);
    }

    info!(execution_id = %id, "waiting for the run to finish");
    let record = client.wait_for(id, Duration::from_secs(1)).await?;

    for step in record.steps.iter().chain(&record.rollback_results) {
        match &step.error {
            Some(err) => println!("  {:<24} {:?} ({err})", step.name, step.status),
            None => println!("  {:<24} {:?}", step.name, step.status),
        }
    }
    println!("{} {} {}", record.id, record.workflow_name, record.status);

    Ok(if record.status == ExecutionStatus::Succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn cancel(client: &ServerClient, id: Uuid) -> anyhow::Result<ExitCode> {
    if client.cancel(id).await.context("cancel failed")? {
        println!("cancellation requested for {id}");
        Ok(ExitCode::SUCCESS)
    } else {
        println!("{id} is not running");
        Ok(ExitCode::FAILURE)
    }
}

fn validate(path: &Path) -> ExitCode {
    let loaded = if path.is_dir() {
        DefinitionSet::load_dir(path)
    } else {
        DefinitionSet::load_file(path).and_then(|set| set.validate().map(|()| set))
    };

    match loaded {
        Ok(set) => {
            for wf in &set.workflows {
                println!(
                    "✅ workflow {} — {} steps, {} rollback, trigger {}",
                    wf.name,
                    wf.steps.len(),
                    wf.rollback.len(),
                    wf.trigger.kind.trigger_type()
                );
            }
            for task in &set.scheduled_tasks {
                println!("✅ task {} — {}", task.name, task.cron);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Validation failed: {e}");
            ExitCode::FAILURE
        }
    }
}

fn print_summaries(summaries: &[ExecutionSummary]) {
    if summaries.is_empty() {
        println!("no executions");
        return;
    }
    for s in summaries {
        let end = s
            .end_time
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".into());
        let mut line = format!(
            "{}  {:<20} {:<12} {:<10} {}  {}",
            s.id,
            s.workflow_name,
            s.status,
            s.trigger_type,
            s.start_time.format("%Y-%m-%d %H:%M:%S"),
            end
        );
        if let Some(step) = &s.failed_step {
            line.push_str(&format!("  failed at {step}"));
        }
        if s.rollback_failures > 0 {
            line.push_str(&format!("  ({} rollback steps failed)", s.rollback_failures));
        }
        println!("{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn key_value_params() {
        assert_eq!(parse_key_val("version=1.2"), Ok(("version".into(), "1.2".into())));
        assert_eq!(parse_key_val("url=a=b"), Ok(("url".into(), "a=b".into())));
        assert!(parse_key_val("novalue").is_err());
        assert!(parse_key_val("=x").is_err());
    }

    #[test]
    fn schedule_task_needs_exactly_one_target() {
        let parsed = Cli::try_parse_from([
            "orchestrator", "schedule-task", "backup", "--cron", "0 2 * * *",
            "--script", "backup.sh", "--arg", "--full",
        ]);
        assert!(parsed.is_ok());

        let both = Cli::try_parse_from([
            "orchestrator", "schedule-task", "backup", "--cron", "0 2 * * *",
            "--script", "backup.sh", "--workflow", "deploy",
        ]);
        assert!(both.is_err());
    }

    #[test]
    fn server_url_comes_from_flag_or_default() {
        let parsed = Cli::try_parse_from(["orchestrator", "run-workflow", "deploy", "-p", "v=2"]).unwrap();
        let Command::RunWorkflow { params, server, detach, .. } = parsed.command else {
            panic!("expected run-workflow");
        };
        assert_eq!(params, vec![("v".to_string(), "2".to_string())]);
        assert!(!detach);
        assert!(server.server.starts_with("http://"));

        let parsed = Cli::try_parse_from([
            "orchestrator", "cancel", "6f1c3a52-1d2b-4c8e-9a41-0d4f5e6a7b8c", "--server", "http://ops:9000",
        ])
        .unwrap();
        let Command::Cancel { server, .. } = parsed.command else {
            panic!("expected cancel");
        };
        assert_eq!(server.server, "http://ops:9000");
    }

    #[test]
    fn setup_workflow_rejects_name_clashes() {
        let dir = tempfile::tempdir().unwrap();
        let installed = dir.path().join("installed");
        std::fs::create_dir(&installed).unwrap();
        std::fs::write(
            installed.join("a.yaml"),
            "name: deploy\nsteps:\n  - { name: s, action: deploy, environment: prod }\n",
        )
        .unwrap();

        let clash = dir.path().join("b.yaml");
        std::fs::write(
            &clash,
            "name: deploy\nsteps:\n  - { name: t, action: deploy, environment: dev }\n",
        )
        .unwrap();
        assert!(setup_workflow(&clash, &installed).is_err());

        // Same file name replaces the installed copy.
        let replacement = dir.path().join("a.yaml");
        std::fs::write(
            &replacement,
            "name: deploy\nsteps:\n  - { name: t, action: deploy, environment: dev }\n",
        )
        .unwrap();
        assert!(setup_workflow(&replacement, &installed).is_ok());
        let copied = std::fs::read_to_string(installed.join("a.yaml")).unwrap();
        assert!(copied.contains("environment: dev"));
    }
}
