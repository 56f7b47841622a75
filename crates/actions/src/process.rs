//! Child-process plumbing shared by the process-backed runners.

use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::debug;

use crate::{ActionContext, ActionError, ActionOutput};

/// Output beyond this many bytes is truncated (the tail is kept).
pub const MAX_CAPTURED_OUTPUT: usize = 64 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// Spawn `command` with the context's environment, wait for it, and map the
/// exit status onto an [`ActionOutput`] or [`ActionError`].
///
/// The child is spawned with `kill_on_drop`, so dropping the returned future
/// (step timeout, operator abort) kills the process. Each output stream is
/// drained to EOF but only its last [`MAX_CAPTURED_OUTPUT`] bytes are held.
///
/// # Errors
/// - [`ActionError::Spawn`] if the program cannot be spawned.
/// - [`ActionError::Retryable`] if it exits unsuccessfully.
pub async fn run_command(
    mut command: Command,
    ctx: &ActionContext,
) -> Result<ActionOutput, ActionError> {
    let program = command.as_std().get_program().to_string_lossy().into_owned();

    command
        .envs(ctx.process_env())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(dir) = &ctx.working_dir {
        command.current_dir(dir);
    }

    debug!(step = %ctx.step_name, program = %program, "spawning process");

    let mut child = command
        .spawn()
        .map_err(|e| ActionError::Spawn(format!("failed to spawn '{program}': {e}")))?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let (status, stdout, stderr) = tokio::try_join!(
        child.wait(),
        capture(stdout, MAX_CAPTURED_OUTPUT),
        capture(stderr, MAX_CAPTURED_OUTPUT),
    )
    .map_err(|e| ActionError::Retryable(format!("lost track of '{program}': {e}")))?;

    let mut combined = stdout;
    if !stderr.trim().is_empty() {
        if !combined.is_empty() && !combined.ends_with('\n') {
            combined.push('\n');
        }
        combined.push_str(&stderr);
    }
    let combined = truncate_tail(combined.trim_end(), MAX_CAPTURED_OUTPUT);

    if status.success() {
        Ok(ActionOutput {
            output: combined,
            exit_code: status.code(),
        })
    } else {
        let status = match status.code() {
            Some(code) => format!("exit code {code}"),
            None => "a signal".to_string(),
        };
        let mut message = format!("'{program}' terminated with {status}");
        if !combined.is_empty() {
            message.push_str(": ");
            message.push_str(&truncate_tail(&combined, 2048));
        }
        Err(ActionError::Retryable(message))
    }
}

/// Read `reader` to EOF, holding at most about `2 * limit` bytes at a time,
/// and return the last `limit` bytes as text.
async fn capture<R: AsyncRead + Unpin>(reader: Option<R>, limit: usize) -> std::io::Result<String> {
    let Some(mut reader) = reader else {
        return Ok(String::new());
    };

    let mut kept: Vec<u8> = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];
    let mut truncated = false;
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        kept.extend_from_slice(&chunk[..n]);
        if kept.len() > limit.saturating_mul(2) {
            kept.drain(..kept.len() - limit);
            truncated = true;
        }
    }
    if kept.len() > limit {
        kept.drain(..kept.len() - limit);
        truncated = true;
    }

    let text = String::from_utf8_lossy(&kept);
    Ok(if truncated {
        format!("...{text}")
    } else {
        text.into_owned()
    })
}

/// Keep at most `max` bytes from the end of `s`, on a char boundary.
pub fn truncate_tail(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &s[start..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_keeps_the_tail() {
        assert_eq!(truncate_tail("abcdef", 10), "abcdef");
        assert_eq!(truncate_tail("abcdef", 3), "...def");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "ééé";
        let out = truncate_tail(s, 3);
        assert!(out.starts_with("..."));
        assert!(out.ends_with('é'));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_process_is_retryable() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo broken >&2; exit 3"]);
        let ctx = ActionContext::new("wf", uuid::Uuid::nil());

        let err = run_command(cmd, &ctx).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.message().contains("exit code 3"));
        assert!(err.message().contains("broken"));
    }

    #[tokio::test]
    async fn capture_keeps_only_the_tail() {
        let noisy: Vec<u8> = (0..100_000u32).map(|i| b'a' + (i % 26) as u8).collect();
        let text = capture(Some(&noisy[..]), 1_000).await.unwrap();

        assert!(text.starts_with("..."));
        assert_eq!(text.len(), 1_003);
        assert!(noisy.ends_with(text.trim_start_matches("...").as_bytes()));

        assert_eq!(capture(Some(&b"short"[..]), 1_000).await.unwrap(), "short");
        assert_eq!(capture(None::<&[u8]>, 1_000).await.unwrap(), "");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn noisy_process_output_is_bounded() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "yes line | head -c 1000000"]);
        let ctx = ActionContext::new("wf", uuid::Uuid::nil());

        let out = run_command(cmd, &ctx).await.unwrap();
        assert!(out.output.starts_with("..."));
        assert!(out.output.len() <= MAX_CAPTURED_OUTPUT + 3);
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let cmd = Command::new("definitely-not-a-real-program-4242");
        let ctx = ActionContext::new("wf", uuid::Uuid::nil());

        let err = run_command(cmd, &ctx).await.unwrap_err();
        assert!(matches!(err, ActionError::Spawn(_)));
        assert!(!err.is_retryable());
    }
}
