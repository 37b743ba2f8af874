//! Task types available to jobs created from the command line.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use autotask_task::{Result, Task, TaskContext, TaskFailure, TaskParams, TaskRegistry, TaskResult};
use tokio::process::Command;
use tracing::debug;

/// Per-stream output budget stored with a run.
pub const DEFAULT_MAX_OUTPUT_CHARS: usize = 10_000;

pub fn builtin_registry() -> autotask_task::Result<TaskRegistry> {
    let mut registry = TaskRegistry::new();
    registry.register_fn("command", || CommandTask)?;
    registry.alias("shell", "command")?;
    registry.register_fn("echo", || EchoTask)?;
    registry.register_fn("sleep", || SleepTask)?;
    Ok(registry)
}

/// `sh -c <command>`. Params: `command` (required), `cwd`, `max_output_chars`.
///
/// A non-zero exit status is a `Failed` result. The child is killed when
/// the run is cancelled or times out.
pub struct CommandTask;

#[async_trait]
impl Task for CommandTask {
    fn task_type(&self) -> &str {
        "command"
    }

    fn description(&self) -> &str {
        "Run a shell command"
    }

    fn validate(&self, params: &TaskParams) -> std::result::Result<(), String> {
        match params.get("command").and_then(|v| v.as_str()) {
            Some(c) if !c.trim().is_empty() => Ok(()),
            Some(_) => Err("'command' must not be empty".to_string()),
            None => Err("missing string parameter 'command'".to_string()),
        }
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<TaskResult> {
        let command = ctx.param_str("command").unwrap_or_default();
        let max_chars = ctx
            .param_u64("max_output_chars")
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_MAX_OUTPUT_CHARS);

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = ctx.param_str("cwd") {
            cmd.current_dir(dir);
        }

        debug!(job_id = %ctx.job_id, run_id = %ctx.run_id, %command, "spawning command");
        let child = cmd.spawn()?;

        // Dropping the wait future drops the child, which kills it.
        let output = tokio::select! {
            out = child.wait_with_output() => out?,
            _ = ctx.cancelled() => {
                return Ok(TaskResult::cancelled("command killed"));
            }
        };

        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = truncate_output(String::from_utf8_lossy(&output.stdout).trim_end(), max_chars);
        let stderr = truncate_output(String::from_utf8_lossy(&output.stderr).trim_end(), max_chars);

        let result = if output.status.success() {
            TaskResult::success(format!("exit code {exit_code}"))
        } else {
            let detail = stderr
                .lines()
                .last()
                .filter(|l| !l.is_empty())
                .map(String::from)
                .unwrap_or_else(|| format!("exit code {exit_code}"));
            TaskResult::failure(
                format!("exit code {exit_code}"),
                TaskFailure::new("exit_status", detail),
            )
        };
        Ok(result
            .with_data("exit_code", exit_code)
            .with_data("stdout", stdout)
            .with_data("stderr", stderr))
    }
}

/// Succeeds with its `message` param. Handy for checking a schedule.
pub struct EchoTask;

#[async_trait]
impl Task for EchoTask {
    fn task_type(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Succeed with the given message"
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<TaskResult> {
        Ok(TaskResult::success(ctx.param_str("message").unwrap_or("echo")))
    }
}

/// Waits `secs` seconds, returning early if cancelled.
pub struct SleepTask;

#[async_trait]
impl Task for SleepTask {
    fn task_type(&self) -> &str {
        "sleep"
    }

    fn description(&self) -> &str {
        "Wait for a number of seconds"
    }

    fn validate(&self, params: &TaskParams) -> std::result::Result<(), String> {
        params
            .get("secs")
            .and_then(|v| v.as_u64())
            .map(|_| ())
            .ok_or_else(|| "missing integer parameter 'secs'".to_string())
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<TaskResult> {
        let secs = ctx.param_u64("secs").unwrap_or(0);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                Ok(TaskResult::success(format!("slept {secs}s")))
            }
            _ = ctx.cancelled() => Ok(TaskResult::cancelled("sleep interrupted")),
        }
    }
}

/// Keep the head and tail of long output, dropping the middle.
fn truncate_output(output: &str, max_chars: usize) -> String {
    let total = output.chars().count();
    if total <= max_chars {
        return output.to_owned();
    }
    let half = max_chars / 2;
    let head: String = output.chars().take(half).collect();
    let tail: String = output.chars().skip(total - half).collect();
    format!(
        "{head}\n... [{} chars omitted] ...\n{tail}",
        total - 2 * half
    )
}
