//! `autotask-core`: identifiers, time source and configuration shared by
//! every autotask crate.

pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{AutotaskConfig, DatabaseConfig, SchedulerConfig};
pub use error::{CoreError, Result};
pub use types::{JobId, RunId};
