//! SQLite persistence for job definitions and run history.

pub mod db;
pub mod error;
pub mod history;
pub mod jobs;
pub mod types;

pub use db::{init_db, open_connection};
pub use error::{Result, StoreError};
pub use history::RunHistory;
pub use jobs::JobStore;
pub use types::{Backoff, Job, RetryPolicy, Run, RunOrigin, RunQuery, RunStats, RunStatus, Trigger};
