//! Run-completion notification seam.

pub mod engine;
pub mod error;
pub mod types;

pub use engine::{ChannelObserver, ObserverRegistry};
pub use error::{HookError, Result};
pub use types::{ObserverDefinition, RunEvent, RunEventKind, RunObserver};
