use thiserror::Error;

#[derive(Debug, Error)]
pub enum HookError {
    /// The observer returned an unrecoverable failure.
    #[error("Observer failed: {0}")]
    ExecutionFailed(String),

    /// The observer exceeded its allowed wall-clock budget.
    #[error("Observer timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// The receiving side of a channel observer is gone.
    #[error("Observer channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, HookError>;
