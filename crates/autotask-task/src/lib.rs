pub mod error;
pub mod harness;
pub mod registry;
pub mod result;
pub mod task;

pub use error::{Result, TaskError};
pub use harness::{run_guarded, ExecOptions};
pub use registry::{TaskFactory, TaskRegistry};
pub use result::{format_duration, ResultData, TaskFailure, TaskResult, TaskStatus};
pub use task::{Task, TaskContext, TaskParams};
