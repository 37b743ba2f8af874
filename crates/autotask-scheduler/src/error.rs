use autotask_store::StoreError;
use autotask_task::TaskError;
use thiserror::Error;

/// Errors returned by the scheduler's public operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The trigger can never fire (bad cron, zero interval, stale one-off).
    #[error("Invalid trigger: {0}")]
    InvalidTrigger(String),

    #[error("Unknown task type: {task_type}")]
    UnknownTaskType { task_type: String },

    #[error("Task type already registered: {task_type}")]
    DuplicateTaskType { task_type: String },

    /// Task parameters were rejected by the task's own validation.
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Job not found: {id}")]
    NotFound { id: String },

    #[error("Run not found: {id}")]
    RunNotFound { id: String },

    #[error("Job name already in use: {name}")]
    DuplicateJobName { name: String },

    /// The job already has a run in progress.
    #[error("Job already running: {id}")]
    AlreadyRunning { id: String },

    #[error("Scheduler already started")]
    AlreadyStarted,

    #[error("Scheduler is not running")]
    NotRunning,

    /// The scheduler is stopping or stopped; no new runs are accepted.
    #[error("Scheduler is shutting down")]
    ShuttingDown,

    /// Persistence failure (after bounded retries where applicable).
    #[error("Store error: {0}")]
    Store(#[source] StoreError),

    /// A task failure viewed as an error. Workers never propagate this; it
    /// exists for callers converting a failed result.
    #[error("Task execution failed: {0}")]
    TaskExecution(String),
}

impl SchedulerError {
    /// Stable code string for CLI and automation consumers.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::InvalidTrigger(_) => "INVALID_TRIGGER",
            SchedulerError::UnknownTaskType { .. } => "UNKNOWN_TASK_TYPE",
            SchedulerError::DuplicateTaskType { .. } => "DUPLICATE_TASK_TYPE",
            SchedulerError::InvalidParams(_) => "INVALID_PARAMS",
            SchedulerError::NotFound { .. } => "NOT_FOUND",
            SchedulerError::RunNotFound { .. } => "RUN_NOT_FOUND",
            SchedulerError::DuplicateJobName { .. } => "DUPLICATE_JOB_NAME",
            SchedulerError::AlreadyRunning { .. } => "ALREADY_RUNNING",
            SchedulerError::AlreadyStarted => "ALREADY_STARTED",
            SchedulerError::NotRunning => "NOT_RUNNING",
            SchedulerError::ShuttingDown => "SHUTTING_DOWN",
            SchedulerError::Store(_) => "STORE_IO_ERROR",
            SchedulerError::TaskExecution(_) => "TASK_EXECUTION_ERROR",
        }
    }
}

impl From<StoreError> for SchedulerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::JobNotFound { id } => SchedulerError::NotFound { id },
            StoreError::RunNotFound { id } => SchedulerError::RunNotFound { id },
            StoreError::DuplicateJobName { name } => SchedulerError::DuplicateJobName { name },
            other => SchedulerError::Store(other),
        }
    }
}

impl From<TaskError> for SchedulerError {
    fn from(e: TaskError) -> Self {
        match e {
            TaskError::UnknownTaskType { task_type } => SchedulerError::UnknownTaskType { task_type },
            TaskError::DuplicateTaskType { task_type } => {
                SchedulerError::DuplicateTaskType { task_type }
            }
            TaskError::InvalidParams(msg) => SchedulerError::InvalidParams(msg),
            other => SchedulerError::TaskExecution(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
