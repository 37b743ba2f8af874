use std::time::Duration;

use autotask_core::{JobId, RunId};
use autotask_task::{TaskParams, TaskResult, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Defines when a job becomes due.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    /// Standard 5-field cron expression, evaluated in UTC.
    Cron { expression: String },

    /// Fixed period in seconds, measured from the previous computed fire.
    Interval { every_secs: u64 },

    /// Fire exactly once at the given UTC instant.
    OneOff { at: DateTime<Utc> },

    /// Every day at the given hour and minute (UTC).
    Daily { hour: u8, minute: u8 },
}

impl Trigger {
    pub fn kind(&self) -> &'static str {
        match self {
            Trigger::Cron { .. } => "cron",
            Trigger::Interval { .. } => "interval",
            Trigger::OneOff { .. } => "one_off",
            Trigger::Daily { .. } => "daily",
        }
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trigger::Cron { expression } => write!(f, "cron({expression})"),
            Trigger::Interval { every_secs } => write!(f, "every {every_secs}s"),
            Trigger::OneOff { at } => write!(f, "once at {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
            Trigger::Daily { hour, minute } => write!(f, "daily at {hour:02}:{minute:02} UTC"),
        }
    }
}

/// How the delay grows between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    #[default]
    Fixed,
    /// `delay * n` for the n-th retry.
    Linear,
    /// `delay * 2^(n-1)`, capped at `max_delay_ms`.
    Exponential { max_delay_ms: u64 },
}

/// Per-job retry behaviour for `Failed` / `TimedOut` attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt; 0 disables retrying.
    pub max_retries: u32,
    pub delay_ms: u64,
    #[serde(default)]
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            delay_ms: 0,
            backoff: Backoff::Fixed,
        }
    }

    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            delay_ms: delay.as_millis() as u64,
            backoff: Backoff::Fixed,
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let n = retry.max(1);
        let ms = match self.backoff {
            Backoff::Fixed => self.delay_ms,
            Backoff::Linear => self.delay_ms.saturating_mul(n as u64),
            Backoff::Exponential { max_delay_ms } => {
                let factor = 1u64.checked_shl(n - 1).unwrap_or(u64::MAX);
                self.delay_ms.saturating_mul(factor).min(max_delay_ms)
            }
        };
        Duration::from_millis(ms)
    }
}

/// A persisted job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Unique, human-readable. Changes only through an explicit rename.
    pub name: String,
    /// Registry key resolved at evaluation time.
    pub task_type: String,
    pub trigger: Trigger,
    #[serde(default)]
    pub params: TaskParams,
    /// Paused jobs stay stored but are never evaluated.
    pub enabled: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Per-run timeout; `None` means unbounded.
    pub timeout_ms: Option<u64>,
    /// Overrides the scheduler-wide retry defaults when set.
    pub retry: Option<RetryPolicy>,
    /// Overrides the scheduler-wide misfire grace when set.
    pub misfire_grace_secs: Option<u64>,
    /// `None` once a one-off job has fired (or was missed).
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_status: Option<TaskStatus>,
    pub run_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_error: Option<String>,
    pub last_duration_ms: Option<u64>,
    /// Set while the task type cannot be resolved; the job is skipped.
    pub invalid_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        name: impl Into<String>,
        task_type: impl Into<String>,
        trigger: Trigger,
        params: TaskParams,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            name: name.into(),
            task_type: task_type.into(),
            trigger,
            params,
            enabled: true,
            description: String::new(),
            tags: Vec::new(),
            timeout_ms: None,
            retry: None,
            misfire_grace_secs: None,
            next_run_at: None,
            last_run_at: None,
            last_status: None,
            run_count: 0,
            success_count: 0,
            failure_count: 0,
            last_error: None,
            last_duration_ms: None,
            invalid_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A one-off job that already fired. Visible in listings, never evaluated.
    pub fn is_completed(&self) -> bool {
        matches!(self.trigger, Trigger::OneOff { .. }) && self.next_run_at.is_none()
    }

    /// Short state label for listings.
    pub fn state(&self) -> &'static str {
        if self.invalid_reason.is_some() {
            "invalid"
        } else if !self.enabled {
            "paused"
        } else if self.is_completed() {
            "completed"
        } else {
            "scheduled"
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Percentage of finished runs that succeeded.
    pub fn success_rate(&self) -> f64 {
        if self.run_count == 0 {
            return 0.0;
        }
        self.success_count as f64 / self.run_count as f64 * 100.0
    }

    /// Fold a finished attempt into the denormalized counters.
    pub fn record_result(&mut self, result: &TaskResult) {
        self.run_count += 1;
        match result.status {
            TaskStatus::Success => {
                self.success_count += 1;
                self.last_error = None;
            }
            TaskStatus::Failed | TaskStatus::TimedOut => {
                self.failure_count += 1;
                self.last_error = Some(
                    result
                        .error
                        .as_ref()
                        .map(|e| e.message.clone())
                        .unwrap_or_else(|| result.message.clone()),
                );
            }
            TaskStatus::Skipped | TaskStatus::Cancelled => {}
        }
        self.last_run_at = Some(result.started_at);
        self.last_status = Some(result.status);
        self.last_duration_ms = Some(result.duration().num_milliseconds().max(0) as u64);
    }
}

/// Status of a run row. `Running` is transient; every other value is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
    Skipped,
    Cancelled,
    TimedOut,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Skipped => "skipped",
            RunStatus::Cancelled => "cancelled",
            RunStatus::TimedOut => "timed_out",
        }
    }
}

impl From<TaskStatus> for RunStatus {
    fn from(s: TaskStatus) -> Self {
        match s {
            TaskStatus::Success => RunStatus::Success,
            TaskStatus::Failed => RunStatus::Failed,
            TaskStatus::Skipped => RunStatus::Skipped,
            TaskStatus::Cancelled => RunStatus::Cancelled,
            TaskStatus::TimedOut => RunStatus::TimedOut,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            "skipped" => Ok(RunStatus::Skipped),
            "cancelled" => Ok(RunStatus::Cancelled),
            "timed_out" => Ok(RunStatus::TimedOut),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// What caused a run to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOrigin {
    /// A trigger fire picked up by the tick loop.
    Scheduled,
    /// `trigger_now`.
    Manual,
    /// A further attempt for the same fire after a failure.
    Retry,
    /// A fire that was too late and was skipped.
    Misfire,
}

impl RunOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOrigin::Scheduled => "scheduled",
            RunOrigin::Manual => "manual",
            RunOrigin::Retry => "retry",
            RunOrigin::Misfire => "misfire",
        }
    }
}

impl std::fmt::Display for RunOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunOrigin {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(RunOrigin::Scheduled),
            "manual" => Ok(RunOrigin::Manual),
            "retry" => Ok(RunOrigin::Retry),
            "misfire" => Ok(RunOrigin::Misfire),
            other => Err(format!("unknown run origin: {other}")),
        }
    }
}

/// One execution attempt of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub job_id: JobId,
    pub job_name: String,
    pub task_type: String,
    /// 1 for the first attempt of a fire; retries count up from there.
    pub attempt_number: u32,
    pub origin: RunOrigin,
    /// The scheduled instant this run serves.
    pub trigger_time: DateTime<Utc>,
    pub status: RunStatus,
    /// When the row was written at dispatch.
    pub started_at: DateTime<Utc>,
    /// `None` while `Running`.
    pub result: Option<TaskResult>,
}

impl Run {
    /// A fresh `Running` row for `job`.
    pub fn start(
        job: &Job,
        attempt_number: u32,
        origin: RunOrigin,
        trigger_time: DateTime<Utc>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: RunId::new(),
            job_id: job.id.clone(),
            job_name: job.name.clone(),
            task_type: job.task_type.clone(),
            attempt_number,
            origin,
            trigger_time,
            status: RunStatus::Running,
            started_at,
            result: None,
        }
    }

    /// A row that is final from the moment it is written (misfires).
    pub fn finalized(
        job: &Job,
        attempt_number: u32,
        origin: RunOrigin,
        trigger_time: DateTime<Utc>,
        result: TaskResult,
    ) -> Self {
        let mut run = Self::start(job, attempt_number, origin, trigger_time, result.started_at);
        run.status = result.status.into();
        run.result = Some(result);
        run
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.result.as_ref().map(|r| r.finished_at)
    }

    pub fn message(&self) -> &str {
        self.result.as_ref().map(|r| r.message.as_str()).unwrap_or("")
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.result.as_ref().map(|r| r.duration().num_milliseconds())
    }
}

/// Filter for [`RunHistory::query`](crate::RunHistory::query).
#[derive(Debug, Clone, Default)]
pub struct RunQuery {
    pub job_id: Option<JobId>,
    pub status: Option<RunStatus>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    /// Oldest first instead of the default newest first.
    pub ascending: bool,
}

impl RunQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job(mut self, id: &JobId) -> Self {
        self.job_id = Some(id.clone());
        self
    }

    pub fn status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn oldest_first(mut self) -> Self {
        self.ascending = true;
        self
    }
}

/// Aggregates over a set of runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub total: u64,
    pub running: u64,
    pub success: u64,
    pub failed: u64,
    pub skipped: u64,
    pub cancelled: u64,
    pub timed_out: u64,
    /// Percent of all runs that succeeded.
    pub success_rate: f64,
    pub avg_duration_ms: Option<f64>,
    pub min_duration_ms: Option<i64>,
    pub max_duration_ms: Option<i64>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
}
