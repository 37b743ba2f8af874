use thiserror::Error;

/// Errors raised by task bodies and by the registry.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The task body failed. The harness converts this into a `Failed` result;
    /// it never escapes a worker.
    #[error("Task execution failed: {0}")]
    Execution(String),

    /// Parameters were rejected by `Task::validate`.
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    /// A task type was registered twice.
    #[error("Task type already registered: {task_type}")]
    DuplicateTaskType { task_type: String },

    /// No factory is registered under this task type.
    #[error("Unknown task type: {task_type}")]
    UnknownTaskType { task_type: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TaskError {
    pub fn execution(msg: impl Into<String>) -> Self {
        TaskError::Execution(msg.into())
    }

    /// Short machine-readable name, stored as the failure kind of a result.
    pub fn kind(&self) -> &'static str {
        match self {
            TaskError::Execution(_) => "execution",
            TaskError::InvalidParams(_) => "invalid_params",
            TaskError::DuplicateTaskType { .. } => "duplicate_task_type",
            TaskError::UnknownTaskType { .. } => "unknown_task_type",
            TaskError::Io(_) => "io",
            TaskError::Serialization(_) => "serialization",
        }
    }
}

pub type Result<T> = std::result::Result<T, TaskError>;
