use std::sync::Arc;

use async_trait::async_trait;
use autotask_core::JobId;
use autotask_store::{Run, RunStatus};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Terminal outcomes an observer can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEventKind {
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
    Skipped,
}

impl RunEventKind {
    /// `None` for `Running`, which never produces an event.
    pub fn from_status(status: RunStatus) -> Option<Self> {
        match status {
            RunStatus::Running => None,
            RunStatus::Success => Some(RunEventKind::Succeeded),
            RunStatus::Failed => Some(RunEventKind::Failed),
            RunStatus::TimedOut => Some(RunEventKind::TimedOut),
            RunStatus::Cancelled => Some(RunEventKind::Cancelled),
            RunStatus::Skipped => Some(RunEventKind::Skipped),
        }
    }
}

/// Emitted once a run reaches a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub kind: RunEventKind,
    pub job_id: JobId,
    pub job_name: String,
    pub task_type: String,
    /// The finalized run, result included.
    pub run: Run,
    /// Another attempt for the same fire is already scheduled.
    pub will_retry: bool,
}

impl RunEvent {
    pub fn from_run(run: Run, will_retry: bool) -> Option<Self> {
        let kind = RunEventKind::from_status(run.status)?;
        Some(Self {
            kind,
            job_id: run.job_id.clone(),
            job_name: run.job_name.clone(),
            task_type: run.task_type.clone(),
            run,
            will_retry,
        })
    }
}

/// Receives run-completion events (alerting, metrics export, chat relays).
///
/// Observers run on their own tokio task under a timeout; an error is logged
/// and otherwise ignored.
#[async_trait]
pub trait RunObserver: Send + Sync {
    async fn on_run(&self, event: &RunEvent) -> Result<()>;
}

/// A registered observer binding a name, event filter and handler.
pub struct ObserverDefinition {
    /// Unique name used for deregistration and log correlation.
    pub name: String,
    /// Kinds this observer wants. Empty means all.
    pub events: Vec<RunEventKind>,
    pub observer: Arc<dyn RunObserver>,
    /// Lower value = notified earlier. Ties broken by registration order.
    pub priority: i32,
}

impl ObserverDefinition {
    pub fn new(name: impl Into<String>, observer: Arc<dyn RunObserver>) -> Self {
        Self {
            name: name.into(),
            events: Vec::new(),
            observer,
            priority: 0,
        }
    }

    pub fn for_events(mut self, events: impl IntoIterator<Item = RunEventKind>) -> Self {
        self.events = events.into_iter().collect();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn wants(&self, kind: RunEventKind) -> bool {
        self.events.is_empty() || self.events.contains(&kind)
    }
}
