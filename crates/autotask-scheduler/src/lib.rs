//! `autotask-scheduler`: trigger evaluation, dispatch and run lifecycle.
//!
//! # Overview
//!
//! A [`Scheduler`] owns the job and run stores, a task registry and a bounded
//! worker pool. Each tick it loads every enabled job whose `next_run_at` has
//! arrived and either dispatches it, records a misfire, or leaves it due
//! because the job is still running or no worker is free.
//!
//! A job never has two runs in progress at once. Failed attempts are retried
//! per the job's [`RetryPolicy`](autotask_store::RetryPolicy) as part of the
//! same fire, so the job's slot is held until the last attempt finishes.
//!
//! # Trigger variants
//!
//! | Variant    | Next fire                                                |
//! |------------|----------------------------------------------------------|
//! | `Cron`     | Next minute matching the 5-field expression (UTC)        |
//! | `Interval` | Previous scheduled time + N seconds, skipping past slots |
//! | `OneOff`   | Single fire; `next_run_at` is cleared afterwards         |
//! | `Daily`    | HH:MM UTC every day                                      |

pub mod cron;
pub mod engine;
pub mod error;
pub mod retry;
pub mod trigger;

pub use cron::CronSchedule;
pub use engine::{
    JobOptions, Scheduler, SchedulerBuilder, SchedulerStatus, StopReport, TickReport, MISFIRE_REASON,
};
pub use error::{Result, SchedulerError};
