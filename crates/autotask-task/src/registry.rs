use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::{Result, TaskError};
use crate::task::Task;

/// Produces a fresh task instance for each execution attempt.
pub type TaskFactory = Arc<dyn Fn() -> Arc<dyn Task> + Send + Sync>;

/// Maps task-type names to factories.
///
/// Populated once at process startup and then shared read-only (usually as
/// `Arc<TaskRegistry>`), which keeps the set of schedulable types static and
/// auditable. Keys are case-insensitive.
#[derive(Default)]
pub struct TaskRegistry {
    factories: HashMap<String, TaskFactory>,
    /// alias -> canonical key
    aliases: HashMap<String, String>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `task_type`.
    ///
    /// Fails with `DuplicateTaskType` if the name is already taken, either as
    /// a type or as an alias.
    pub fn register(&mut self, task_type: &str, factory: TaskFactory) -> Result<()> {
        let key = normalize(task_type);
        if self.factories.contains_key(&key) || self.aliases.contains_key(&key) {
            return Err(TaskError::DuplicateTaskType { task_type: key });
        }
        debug!(task_type = %key, "task type registered");
        self.factories.insert(key, factory);
        Ok(())
    }

    /// Convenience wrapper around [`register`](Self::register) for closures.
    pub fn register_fn<F, T>(&mut self, task_type: &str, make: F) -> Result<()>
    where
        F: Fn() -> T + Send + Sync + 'static,
        T: Task + 'static,
    {
        self.register(task_type, Arc::new(move || Arc::new(make()) as Arc<dyn Task>))
    }

    /// Make `alias` resolve to the already-registered `target`.
    pub fn alias(&mut self, alias: &str, target: &str) -> Result<()> {
        let alias = normalize(alias);
        let target = normalize(target);
        if !self.factories.contains_key(&target) {
            return Err(TaskError::UnknownTaskType { task_type: target });
        }
        if self.factories.contains_key(&alias) || self.aliases.contains_key(&alias) {
            return Err(TaskError::DuplicateTaskType { task_type: alias });
        }
        debug!(%alias, %target, "task alias registered");
        self.aliases.insert(alias, target);
        Ok(())
    }

    /// Build a fresh instance for `task_type`.
    pub fn resolve(&self, task_type: &str) -> Result<Arc<dyn Task>> {
        let key = self.canonical(task_type).ok_or_else(|| TaskError::UnknownTaskType {
            task_type: normalize(task_type),
        })?;
        let factory = &self.factories[&key];
        Ok(factory())
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.canonical(task_type).is_some()
    }

    /// Canonical key for a type or alias, if known.
    pub fn canonical(&self, task_type: &str) -> Option<String> {
        let key = normalize(task_type);
        if self.factories.contains_key(&key) {
            return Some(key);
        }
        self.aliases.get(&key).cloned()
    }

    /// All registered types (aliases excluded), sorted.
    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

fn normalize(task_type: &str) -> String {
    task_type.trim().to_lowercase()
}
