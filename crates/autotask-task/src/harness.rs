//! Guarded execution of a single task attempt.
//!
//! The harness is the only place that calls into task code. Whatever the task
//! does (returns an error, panics, hangs past its timeout, ignores a cancel)
//! the caller gets back a well-formed [`TaskResult`] and `cleanup` has run.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use autotask_core::Clock;
use futures_util::FutureExt;
use tokio::task::JoinError;
use tracing::{debug, warn};

use crate::error::Result;
use crate::result::{TaskFailure, TaskResult, TaskStatus};
use crate::task::{Task, TaskContext};

/// Per-attempt execution limits.
#[derive(Debug, Clone, Copy)]
pub struct ExecOptions {
    /// Wall-clock budget for `execute`. `None` means unbounded.
    pub timeout: Option<Duration>,
    /// How long a cancelled body may keep running before it is aborted.
    pub kill_grace: Duration,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            kill_grace: Duration::from_secs(5),
        }
    }
}

enum Ending {
    Joined(std::result::Result<Result<TaskResult>, JoinError>),
    TimedOut,
    Cancelled,
}

/// Validate, execute and clean up one attempt.
///
/// The context's cancellation token is the *external* signal (scheduler stop,
/// job removal) and yields `Cancelled`. Timeouts use a child token so they are
/// reported as `TimedOut` instead.
pub async fn run_guarded(
    task: Arc<dyn Task>,
    ctx: TaskContext,
    opts: ExecOptions,
    clock: &dyn Clock,
) -> TaskResult {
    let started = clock.now();

    if let Err(reason) = task.validate(&ctx.params) {
        warn!(job_id = %ctx.job_id, run_id = %ctx.run_id, %reason, "task validation failed");
        return TaskResult::failure(
            format!("validation failed: {reason}"),
            TaskFailure::new("invalid_params", reason),
        )
        .stamped(started, clock.now());
    }

    let external = ctx.cancellation_token().clone();
    let exec_token = external.child_token();
    let exec_ctx = ctx.clone().with_token(exec_token.clone());
    let body = Arc::clone(&task);
    let mut handle = tokio::spawn(async move { body.execute(&exec_ctx).await });

    let deadline = async {
        match opts.timeout {
            Some(t) => tokio::time::sleep(t).await,
            None => std::future::pending::<()>().await,
        }
    };

    let ending = tokio::select! {
        joined = &mut handle => Ending::Joined(joined),
        _ = deadline => Ending::TimedOut,
        _ = external.cancelled() => Ending::Cancelled,
    };

    let result = match ending {
        Ending::Joined(joined) => {
            let r = from_joined(joined, &ctx);
            if external.is_cancelled() && !r.is_success() {
                r.with_status(TaskStatus::Cancelled)
            } else {
                r
            }
        }
        Ending::TimedOut => {
            exec_token.cancel();
            let limit_ms = opts.timeout.map(|t| t.as_millis() as u64).unwrap_or_default();
            wind_down(&mut handle, opts.kill_grace, &ctx).await;
            warn!(job_id = %ctx.job_id, run_id = %ctx.run_id, limit_ms, "task timed out");
            TaskResult::timed_out(format!("timed out after {limit_ms}ms"))
        }
        Ending::Cancelled => match wind_down(&mut handle, opts.kill_grace, &ctx).await {
            // The body finished its work just as the cancel arrived.
            Some(Ok(Ok(r))) if r.is_success() => r,
            _ => TaskResult::cancelled("cancelled before completion"),
        },
    };

    if let Err(panic) = AssertUnwindSafe(task.cleanup(&ctx.params))
        .catch_unwind()
        .await
    {
        warn!(
            job_id = %ctx.job_id,
            run_id = %ctx.run_id,
            "task cleanup panicked: {}",
            panic_message(panic.as_ref())
        );
    }

    debug!(job_id = %ctx.job_id, run_id = %ctx.run_id, status = %result.status, "attempt finished");
    result.stamped(started, clock.now())
}

/// Give a cancelled body `grace` to return, then abort it.
async fn wind_down(
    handle: &mut tokio::task::JoinHandle<Result<TaskResult>>,
    grace: Duration,
    ctx: &TaskContext,
) -> Option<std::result::Result<Result<TaskResult>, JoinError>> {
    match tokio::time::timeout(grace, &mut *handle).await {
        Ok(joined) => Some(joined),
        Err(_) => {
            handle.abort();
            warn!(
                job_id = %ctx.job_id,
                run_id = %ctx.run_id,
                grace_ms = grace.as_millis() as u64,
                "task ignored cancellation; aborted"
            );
            None
        }
    }
}

fn from_joined(
    joined: std::result::Result<Result<TaskResult>, JoinError>,
    ctx: &TaskContext,
) -> TaskResult {
    match joined {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            warn!(job_id = %ctx.job_id, run_id = %ctx.run_id, error = %e, "task returned an error");
            TaskResult::from_error(&e)
        }
        Err(join_err) if join_err.is_panic() => {
            let msg = panic_message(join_err.into_panic().as_ref());
            warn!(job_id = %ctx.job_id, run_id = %ctx.run_id, "task panicked: {msg}");
            TaskResult::failure(format!("task panicked: {msg}"), TaskFailure::new("panic", msg))
        }
        Err(_) => TaskResult::failure(
            "task was aborted",
            TaskFailure::new("aborted", "task was aborted"),
        ),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
