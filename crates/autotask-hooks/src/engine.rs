use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{HookError, Result};
use crate::types::{ObserverDefinition, RunEvent, RunObserver};

/// Registry and dispatcher for run observers.
///
/// A single instance is shared by the scheduler and whoever subscribes
/// (pass as `Arc<ObserverRegistry>`).
pub struct ObserverRegistry {
    /// Sorted by priority ascending after every registration.
    observers: RwLock<Vec<ObserverDefinition>>,
    timeout: Duration,
}

impl ObserverRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            observers: RwLock::new(Vec::new()),
            timeout,
        }
    }

    /// Register an observer. Re-sorts so priority order is always correct.
    pub fn register(&self, def: ObserverDefinition) {
        let mut observers = self.observers.write().expect("observer registry poisoned");
        debug!(name = %def.name, priority = def.priority, "observer registered");
        observers.push(def);
        // Stable sort preserves registration order within the same priority.
        observers.sort_by_key(|o| o.priority);
    }

    /// Remove an observer by name. Returns whether one was removed.
    pub fn unregister(&self, name: &str) -> bool {
        let mut observers = self.observers.write().expect("observer registry poisoned");
        let before = observers.len();
        observers.retain(|o| o.name != name);
        let removed = observers.len() < before;
        if removed {
            debug!(name, "observer unregistered");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.observers.read().expect("observer registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawn every matching observer. Never blocks and never propagates
    /// observer failures; returns how many observers were notified.
    ///
    /// Must be called from within a tokio runtime.
    pub fn emit(&self, event: RunEvent) -> usize {
        let observers = self.observers.read().expect("observer registry poisoned");
        let event = Arc::new(event);
        let mut notified = 0;

        for def in observers.iter().filter(|o| o.wants(event.kind)) {
            let event = Arc::clone(&event);
            let observer = Arc::clone(&def.observer);
            let name = def.name.clone();
            let limit = self.timeout;
            notified += 1;

            tokio::spawn(async move {
                let t = Instant::now();
                let outcome = match tokio::time::timeout(limit, observer.on_run(&event)).await {
                    Ok(res) => res,
                    Err(_) => Err(HookError::Timeout {
                        ms: limit.as_millis() as u64,
                    }),
                };
                let elapsed_ms = t.elapsed().as_millis() as u64;
                match outcome {
                    Ok(()) => debug!(observer = %name, duration_ms = elapsed_ms, "observer completed"),
                    Err(e) => warn!(
                        observer = %name,
                        job_id = %event.job_id,
                        run_id = %event.run.id,
                        duration_ms = elapsed_ms,
                        "observer failed: {e}"
                    ),
                }
            });
        }
        notified
    }
}

impl Default for ObserverRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(autotask_core::config::DEFAULT_OBSERVER_TIMEOUT_SECS))
    }
}

/// Forwards events into a bounded channel.
///
/// Uses `try_send` so a slow consumer never stalls the dispatcher; events
/// are dropped with a warning while the channel is full.
pub struct ChannelObserver {
    tx: mpsc::Sender<RunEvent>,
}

impl ChannelObserver {
    pub fn new(tx: mpsc::Sender<RunEvent>) -> Self {
        Self { tx }
    }

    /// Convenience: a registered-ready observer plus its receiver.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<RunEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl RunObserver for ChannelObserver {
    async fn on_run(&self, event: &RunEvent) -> Result<()> {
        match self.tx.try_send(event.clone()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(job_id = %event.job_id, "observer channel full; event dropped");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(HookError::ChannelClosed),
        }
    }
}
