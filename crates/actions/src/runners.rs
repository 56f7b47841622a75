//! Built-in runners, one per [`ActionKind`](crate::ActionKind).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use crate::process::run_command;
use crate::{ActionContext, ActionError, ActionOutput, ActionRunner, StepAction};

fn wrong_action(runner: &str, action: &StepAction) -> ActionError {
    ActionError::Fatal(format!("{runner} cannot run a '{}' action", action.kind()))
}

// ---------------------------------------------------------------------------
// ScriptRunner
// ---------------------------------------------------------------------------

/// Runs `execute_script` actions as local processes.
#[derive(Debug, Clone, Default)]
pub struct ScriptRunner;

#[async_trait]
impl ActionRunner for ScriptRunner {
    async fn run(
        &self,
        action: &StepAction,
        ctx: &ActionContext,
    ) -> Result<ActionOutput, ActionError> {
        let StepAction::ExecuteScript { path, args } = action else {
            return Err(wrong_action("ScriptRunner", action));
        };

        let mut script = PathBuf::from(path);
        if script.is_relative() && script.components().count() > 1 {
            if let Some(dir) = &ctx.working_dir {
                script = dir.join(script);
            }
        }

        let mut command = Command::new(&script);
        command.args(args);
        run_command(command, ctx).await
    }
}

// ---------------------------------------------------------------------------
// DeployRunner
// ---------------------------------------------------------------------------

/// Runs `deploy` actions by invoking a deploy program with the environment
/// name as its last argument: `<program> [args...] <environment>`.
#[derive(Debug, Clone)]
pub struct DeployRunner {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl Default for DeployRunner {
    fn default() -> Self {
        Self {
            program: PathBuf::from("deploy"),
            args: Vec::new(),
        }
    }
}

#[async_trait]
impl ActionRunner for DeployRunner {
    async fn run(
        &self,
        action: &StepAction,
        ctx: &ActionContext,
    ) -> Result<ActionOutput, ActionError> {
        let StepAction::Deploy { environment } = action else {
            return Err(wrong_action("DeployRunner", action));
        };

        info!(step = %ctx.step_name, environment = %environment, "deploying");

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(environment)
            .env("ORCHESTRATOR_DEPLOY_ENVIRONMENT", environment);
        run_command(command, ctx).await
    }
}

// ---------------------------------------------------------------------------
// RemoteCommandRunner
// ---------------------------------------------------------------------------

/// Runs `remote_command` actions over ssh in batch mode.
#[derive(Debug, Clone)]
pub struct RemoteCommandRunner {
    pub ssh_program: PathBuf,
    pub ssh_options: Vec<String>,
}

impl Default for RemoteCommandRunner {
    fn default() -> Self {
        Self {
            ssh_program: PathBuf::from("ssh"),
            ssh_options: vec!["-o".into(), "BatchMode=yes".into()],
        }
    }
}

#[async_trait]
impl ActionRunner for RemoteCommandRunner {
    async fn run(
        &self,
        action: &StepAction,
        ctx: &ActionContext,
    ) -> Result<ActionOutput, ActionError> {
        let StepAction::RemoteCommand { host, command: remote } = action else {
            return Err(wrong_action("RemoteCommandRunner", action));
        };

        if host.trim().is_empty() || host.starts_with('-') {
            return Err(ActionError::Fatal(format!("invalid remote host '{host}'")));
        }

        let mut command = Command::new(&self.ssh_program);
        command.args(&self.ssh_options).arg(host).arg(remote);
        run_command(command, ctx).await
    }
}

// ---------------------------------------------------------------------------
// UploadRunner
// ---------------------------------------------------------------------------

/// Runs `upload_files` actions. Local-to-local copies are done in-process;
/// anything involving a `host:path` endpoint goes through `scp -r`.
#[derive(Debug, Clone)]
pub struct UploadRunner {
    pub scp_program: PathBuf,
}

impl Default for UploadRunner {
    fn default() -> Self {
        Self {
            scp_program: PathBuf::from("scp"),
        }
    }
}

/// `host:path` / `user@host:path`, but not a Windows drive letter.
fn is_remote(endpoint: &str) -> bool {
    match endpoint.find(':') {
        Some(idx) => {
            let head = &endpoint[..idx];
            idx > 1 && !head.contains('/') && !head.contains('\\')
        }
        None => false,
    }
}

fn resolve(path: &str, ctx: &ActionContext) -> PathBuf {
    let p = PathBuf::from(path);
    match &ctx.working_dir {
        Some(dir) if p.is_relative() => dir.join(p),
        _ => p,
    }
}

async fn copy_recursive(src: &Path, dst: &Path) -> std::io::Result<u64> {
    let meta = tokio::fs::metadata(src).await?;
    if !meta.is_dir() {
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        return tokio::fs::copy(src, dst).await.map(|_| 1);
    }

    tokio::fs::create_dir_all(dst).await?;
    let mut copied = 0;
    let mut entries = tokio::fs::read_dir(src).await?;
    while let Some(entry) = entries.next_entry().await? {
        let target = dst.join(entry.file_name());
        copied += Box::pin(copy_recursive(&entry.path(), &target)).await?;
    }
    Ok(copied)
}

#[async_trait]
impl ActionRunner for UploadRunner {
    async fn run(
        &self,
        action: &StepAction,
        ctx: &ActionContext,
    ) -> Result<ActionOutput, ActionError> {
        let StepAction::UploadFiles { src, dst } = action else {
            return Err(wrong_action("UploadRunner", action));
        };

        if is_remote(src) || is_remote(dst) {
            let mut command = Command::new(&self.scp_program);
            command.arg("-r").arg("-B").arg(src).arg(dst);
            return run_command(command, ctx).await;
        }

        let (from, to) = (resolve(src, ctx), resolve(dst, ctx));
        if tokio::fs::metadata(&from).await.is_err() {
            return Err(ActionError::Fatal(format!(
                "upload source '{}' does not exist",
                from.display()
            )));
        }

        let copied = copy_recursive(&from, &to).await.map_err(|e| {
            ActionError::Retryable(format!(
                "copying '{}' to '{}' failed: {e}",
                from.display(),
                to.display()
            ))
        })?;

        Ok(ActionOutput::text(format!(
            "copied {copied} file(s) from {} to {}",
            from.display(),
            to.display()
        )))
    }
}
