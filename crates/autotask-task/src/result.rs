use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TaskError;

/// Terminal outcome of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Success,
    Failed,
    /// Not executed (dry run, precondition not met, misfire).
    Skipped,
    /// Stopped by an external request (scheduler stop, job removal).
    Cancelled,
    /// Exceeded the job's run timeout.
    TimedOut,
}

impl TaskStatus {
    /// `Failed` and `TimedOut` are the retryable outcomes and the only ones
    /// that carry an error.
    pub fn is_error(&self) -> bool {
        matches!(self, TaskStatus::Failed | TaskStatus::TimedOut)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskStatus::Success)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::TimedOut => "timed_out",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "success" => Ok(TaskStatus::Success),
            "failed" => Ok(TaskStatus::Failed),
            "skipped" => Ok(TaskStatus::Skipped),
            "cancelled" => Ok(TaskStatus::Cancelled),
            "timed_out" => Ok(TaskStatus::TimedOut),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Structured cause attached to `Failed` / `TimedOut` results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// Machine-readable category, e.g. `"execution"`, `"panic"`, `"timeout"`.
    pub kind: String,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl From<&TaskError> for TaskFailure {
    fn from(e: &TaskError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

/// Task-specific payload (files copied, bytes freed, ...).
pub type ResultData = serde_json::Map<String, serde_json::Value>;

/// Immutable record produced once per execution.
///
/// Tasks build one with the status constructors; the harness then stamps
/// `started_at`/`finished_at` from the scheduler's clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub status: TaskStatus,
    pub message: String,
    #[serde(default)]
    pub data: ResultData,
    /// Present only when `status` is `Failed` or `TimedOut`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskFailure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl TaskResult {
    fn new(status: TaskStatus, message: impl Into<String>, error: Option<TaskFailure>) -> Self {
        let now = Utc::now();
        Self {
            status,
            message: message.into(),
            data: ResultData::new(),
            error: if status.is_error() { error } else { None },
            started_at: now,
            finished_at: now,
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(TaskStatus::Success, message, None)
    }

    pub fn failure(message: impl Into<String>, error: TaskFailure) -> Self {
        Self::new(TaskStatus::Failed, message, Some(error))
    }

    pub fn skipped(message: impl Into<String>) -> Self {
        Self::new(TaskStatus::Skipped, message, None)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(TaskStatus::Cancelled, message, None)
    }

    pub fn timed_out(message: impl Into<String>) -> Self {
        let msg: String = message.into();
        let failure = TaskFailure::new("timeout", msg.clone());
        Self::new(TaskStatus::TimedOut, msg, Some(failure))
    }

    /// Convert a task-body error into a `Failed` result.
    pub fn from_error(e: &TaskError) -> Self {
        Self::failure(e.to_string(), TaskFailure::from(e))
    }

    /// Attach one key of task-specific data.
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Set both timestamps, clamping so `finished_at >= started_at`.
    pub fn stamped(mut self, started_at: DateTime<Utc>, finished_at: DateTime<Utc>) -> Self {
        self.started_at = started_at;
        self.finished_at = finished_at.max(started_at);
        self
    }

    /// Re-label the outcome, keeping message and data. The error is kept only
    /// when the new status allows one.
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        if !status.is_error() {
            self.error = None;
        } else if self.error.is_none() {
            self.error = Some(TaskFailure::new(status.as_str(), self.message.clone()));
        }
        self
    }

    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at).max(Duration::zero())
    }

    /// Human-friendly duration, e.g. `"4.2s"`, `"2m 30s"`, `"1h 5m"`.
    pub fn duration_display(&self) -> String {
        format_duration(self.duration())
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn is_error(&self) -> bool {
        self.status.is_error()
    }
}

pub fn format_duration(d: Duration) -> String {
    let millis = d.num_milliseconds().max(0);
    if millis < 60_000 {
        return format!("{:.1}s", millis as f64 / 1000.0);
    }
    let secs = millis / 1000;
    if secs < 3600 {
        return format!("{}m {}s", secs / 60, secs % 60);
    }
    format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
}
