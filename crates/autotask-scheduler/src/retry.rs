use std::time::Duration;

use autotask_core::SchedulerConfig;
use autotask_store::{Backoff, Job, RetryPolicy};
use autotask_task::TaskStatus;

/// The job's own policy, or the scheduler-wide default.
pub fn effective_policy(job: &Job, config: &SchedulerConfig) -> RetryPolicy {
    job.retry.unwrap_or(RetryPolicy {
        max_retries: config.max_retries,
        delay_ms: config.retry_delay_ms,
        backoff: Backoff::Fixed,
    })
}

/// Delay before the next attempt of the same fire, or `None` when the
/// outcome is final.
///
/// `attempt` is the 1-based number of the attempt that just finished, so
/// `max_retries = 2` allows attempts 1, 2 and 3.
pub fn next_delay(policy: &RetryPolicy, status: TaskStatus, attempt: u32) -> Option<Duration> {
    if status.is_error() && attempt <= policy.max_retries {
        Some(policy.delay_for(attempt))
    } else {
        None
    }
}
