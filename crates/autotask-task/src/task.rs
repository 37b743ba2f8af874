use async_trait::async_trait;
use autotask_core::{JobId, RunId};
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::result::TaskResult;

/// Parameters handed to a task on every execution. Opaque to the scheduler.
pub type TaskParams = serde_json::Map<String, serde_json::Value>;

/// The capability every schedulable unit of work implements.
///
/// Instances are produced fresh for each attempt by the registry, so a task
/// holds no state between runs beyond what its parameters carry.
#[async_trait]
pub trait Task: Send + Sync {
    /// Registry key this task is known under.
    fn task_type(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Check parameters before any work is done. `Err` carries the reason.
    fn validate(&self, _params: &TaskParams) -> std::result::Result<(), String> {
        Ok(())
    }

    /// Do the work. Long-running bodies must watch `ctx.cancelled()` and
    /// return promptly once it fires.
    ///
    /// An `Err` is not fatal to anything: the harness turns it into a
    /// `Failed` result.
    async fn execute(&self, ctx: &TaskContext) -> Result<TaskResult>;

    /// Release resources. Always called after `execute`, including when it
    /// failed, panicked, timed out or was cancelled.
    async fn cleanup(&self, _params: &TaskParams) {}
}

/// Everything a task body can see about the run it belongs to.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub job_id: JobId,
    pub job_name: String,
    pub run_id: RunId,
    /// 1 for the first attempt of a fire, 2 for the first retry, ...
    pub attempt: u32,
    /// The scheduled instant that caused this run.
    pub trigger_time: DateTime<Utc>,
    pub params: TaskParams,
    cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(
        job_id: JobId,
        job_name: impl Into<String>,
        run_id: RunId,
        attempt: u32,
        trigger_time: DateTime<Utc>,
        params: TaskParams,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            job_id,
            job_name: job_name.into(),
            run_id,
            attempt,
            trigger_time,
            params,
            cancel,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the run is cancelled (timeout, stop, or job removal).
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn with_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }

    pub fn param_u64(&self, key: &str) -> Option<u64> {
        self.params.get(key).and_then(|v| v.as_u64())
    }

    pub fn param_bool(&self, key: &str) -> Option<bool> {
        self.params.get(key).and_then(|v| v.as_bool())
    }
}
