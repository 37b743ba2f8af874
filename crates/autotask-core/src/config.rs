use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_TICK_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_MAX_CONCURRENT: usize = 4;
pub const DEFAULT_MISFIRE_GRACE_SECS: u64 = 60;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 60_000;
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_KILL_GRACE_MS: u64 = 5_000;
pub const DEFAULT_STORE_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_STORE_RETRY_BACKOFF_MS: u64 = 50;
pub const DEFAULT_OBSERVER_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_HISTORY_RETENTION_DAYS: u32 = 30;

/// Top-level config (autotask.toml + AUTOTASK_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutotaskConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Engine tuning knobs. Per-job settings (retries, grace, timeout) fall back
/// to these when a job does not override them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How often the coordinator wakes to evaluate triggers.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Size of the global worker pool.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// How late a fire may be before it is recorded as a misfire.
    #[serde(default = "default_misfire_grace_secs")]
    pub misfire_grace_secs: u64,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Default wait for in-flight runs when `stop` is called without a timeout.
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
    /// Time a cancelled or timed-out task gets to return before it is aborted.
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
    /// Bounded retries for a failing store write before it is logged as critical.
    #[serde(default = "default_store_retry_attempts")]
    pub store_retry_attempts: u32,
    #[serde(default = "default_store_retry_backoff_ms")]
    pub store_retry_backoff_ms: u64,
    /// Upper bound on a single observer callback.
    #[serde(default = "default_observer_timeout_secs")]
    pub observer_timeout_secs: u64,
    /// Run records older than this are eligible for pruning.
    #[serde(default = "default_history_retention_days")]
    pub history_retention_days: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            misfire_grace_secs: DEFAULT_MISFIRE_GRACE_SECS,
            max_retries: 0,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            drain_timeout_secs: DEFAULT_DRAIN_TIMEOUT_SECS,
            kill_grace_ms: DEFAULT_KILL_GRACE_MS,
            store_retry_attempts: DEFAULT_STORE_RETRY_ATTEMPTS,
            store_retry_backoff_ms: DEFAULT_STORE_RETRY_BACKOFF_MS,
            observer_timeout_secs: DEFAULT_OBSERVER_TIMEOUT_SECS,
            history_retention_days: DEFAULT_HISTORY_RETENTION_DAYS,
        }
    }
}

fn default_tick_interval_ms() -> u64 {
    DEFAULT_TICK_INTERVAL_MS
}
fn default_max_concurrent() -> usize {
    DEFAULT_MAX_CONCURRENT
}
fn default_misfire_grace_secs() -> u64 {
    DEFAULT_MISFIRE_GRACE_SECS
}
fn default_retry_delay_ms() -> u64 {
    DEFAULT_RETRY_DELAY_MS
}
fn default_drain_timeout_secs() -> u64 {
    DEFAULT_DRAIN_TIMEOUT_SECS
}
fn default_kill_grace_ms() -> u64 {
    DEFAULT_KILL_GRACE_MS
}
fn default_store_retry_attempts() -> u32 {
    DEFAULT_STORE_RETRY_ATTEMPTS
}
fn default_store_retry_backoff_ms() -> u64 {
    DEFAULT_STORE_RETRY_BACKOFF_MS
}
fn default_observer_timeout_secs() -> u64 {
    DEFAULT_OBSERVER_TIMEOUT_SECS
}
fn default_history_retention_days() -> u32 {
    DEFAULT_HISTORY_RETENTION_DAYS
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.autotask/autotask.db", home)
}

impl AutotaskConfig {
    /// Load config from a TOML file with AUTOTASK_* env var overrides.
    ///
    /// Nested keys use a double underscore:
    /// `AUTOTASK_SCHEDULER__MAX_CONCURRENT=8`.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. AUTOTASK_CONFIG env var
    ///   3. ~/.autotask/autotask.toml
    ///
    /// A missing file is not an error; defaults apply.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var("AUTOTASK_CONFIG").ok())
            .unwrap_or_else(default_config_path);
        tracing::debug!(%path, "loading config");

        let config: AutotaskConfig = Figment::from(Serialized::defaults(AutotaskConfig::default()))
            .merge(Toml::file(&path))
            .merge(Env::prefixed("AUTOTASK_").split("__"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> crate::error::Result<()> {
        if self.scheduler.max_concurrent == 0 {
            return Err(crate::error::CoreError::Config(
                "scheduler.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.scheduler.tick_interval_ms == 0 {
            return Err(crate::error::CoreError::Config(
                "scheduler.tick_interval_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.autotask/autotask.toml", home)
}
