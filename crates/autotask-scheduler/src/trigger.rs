//! Fire-time arithmetic for each trigger variant.
//!
//! Everything here is pure: callers pass "now" from the scheduler's clock.

use autotask_store::Trigger;
use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::cron::CronSchedule;
use crate::error::{Result, SchedulerError};

/// Reject triggers that can never fire.
///
/// A one-off time may lie in the past by at most `grace` ("immediately
/// eligible"); anything older would only ever be recorded as a misfire.
pub fn validate(trigger: &Trigger, now: DateTime<Utc>, grace: Duration) -> Result<()> {
    match trigger {
        Trigger::Cron { expression } => {
            let cron = CronSchedule::parse(expression).map_err(SchedulerError::InvalidTrigger)?;
            if cron.next_after(now).is_none() {
                return Err(SchedulerError::InvalidTrigger(format!(
                    "cron '{expression}' never fires"
                )));
            }
        }
        Trigger::Interval { every_secs } => {
            if *every_secs == 0 {
                return Err(SchedulerError::InvalidTrigger(
                    "interval must be greater than zero".to_string(),
                ));
            }
            if period(*every_secs).and_then(|d| now.checked_add_signed(d)).is_none() {
                return Err(SchedulerError::InvalidTrigger(format!(
                    "interval of {every_secs}s is too large"
                )));
            }
        }
        Trigger::OneOff { at } => {
            // A grace reaching past the start of time accepts any instant.
            if now.checked_sub_signed(grace).is_some_and(|earliest| *at < earliest) {
                return Err(SchedulerError::InvalidTrigger(format!(
                    "one-off time {at} is already in the past"
                )));
            }
        }
        Trigger::Daily { hour, minute } => {
            if *hour > 23 || *minute > 59 {
                return Err(SchedulerError::InvalidTrigger(format!(
                    "daily time {hour:02}:{minute:02} is not a valid time of day"
                )));
            }
        }
    }
    Ok(())
}

/// `next_run_at` for a freshly added job.
pub fn initial(trigger: &Trigger, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match trigger {
        Trigger::OneOff { at } => Some(*at),
        other => from_now(other, now),
    }
}

/// `next_run_at` after the fire scheduled for `scheduled` was consumed at
/// `now`, either dispatched or recorded as a misfire.
///
/// Intervals stay on their original grid (`scheduled + k*d`), skipping grid
/// points that are not after `now`. Calendar triggers pick the next match
/// after `now`. One-offs are exhausted.
pub fn advance(trigger: &Trigger, scheduled: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match trigger {
        Trigger::Interval { every_secs } => {
            let d = period(*every_secs)?;
            let mut next = scheduled.checked_add_signed(d)?;
            if next <= now {
                let behind = (now - next).num_seconds() / d.num_seconds() + 1;
                let skip = Duration::try_seconds(d.num_seconds().checked_mul(behind)?)?;
                next = next.checked_add_signed(skip)?;
                while next <= now {
                    next = next.checked_add_signed(d)?;
                }
            }
            Some(next)
        }
        Trigger::OneOff { .. } => None,
        other => from_now(other, now),
    }
}

/// `next_run_at` when a paused job is resumed. Fires missed while paused are
/// not replayed; a one-off whose time has passed is exhausted.
pub fn on_resume(trigger: &Trigger, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match trigger {
        Trigger::OneOff { at } => (*at > now).then_some(*at),
        other => from_now(other, now),
    }
}

fn from_now(trigger: &Trigger, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match trigger {
        Trigger::Cron { expression } => CronSchedule::parse(expression).ok()?.next_after(now),
        Trigger::Interval { every_secs } => now.checked_add_signed(period(*every_secs)?),
        Trigger::Daily { hour, minute } => next_daily(*hour, *minute, now),
        Trigger::OneOff { at } => (*at > now).then_some(*at),
    }
}

/// A positive interval length, or `None` when it is zero or beyond what
/// `chrono` can represent.
fn period(every_secs: u64) -> Option<Duration> {
    let secs = i64::try_from(every_secs).ok().filter(|s| *s > 0)?;
    Duration::try_seconds(secs)
}

/// Misfire grace as a `chrono` duration. Values too large to represent are
/// clamped, which in practice means "never misfire".
pub fn grace_window(secs: u64) -> Duration {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX)
}

fn next_daily(hour: u8, minute: u8, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let date = now.date_naive();
    let candidate = Utc
        .from_local_datetime(&date.and_hms_opt(hour as u32, minute as u32, 0)?)
        .single()?;
    if candidate > now {
        Some(candidate)
    } else {
        // Today's window has passed; tomorrow.
        Some(candidate + Duration::days(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 2, 12, h, m, s).unwrap()
    }

    #[test]
    fn interval_stays_on_grid() {
        let t = Trigger::Interval { every_secs: 60 };
        // Dispatched one second late: next is exactly one period after the
        // consumed fire, not after "now".
        assert_eq!(advance(&t, at(10, 0, 0), at(10, 0, 1)), Some(at(10, 1, 0)));
    }

    #[test]
    fn interval_skips_to_future_after_long_gap() {
        let t = Trigger::Interval { every_secs: 60 };
        let next = advance(&t, at(10, 0, 0), at(10, 5, 30)).unwrap();
        assert_eq!(next, at(10, 6, 0));
        // Landing exactly on "now" is not in the future.
        assert_eq!(advance(&t, at(10, 0, 0), at(10, 5, 0)), Some(at(10, 6, 0)));
    }

    #[test]
    fn cron_advances_from_now() {
        let t = Trigger::Cron {
            expression: "0 2 * * *".into(),
        };
        assert_eq!(
            initial(&t, at(10, 0, 0)),
            Some(Utc.with_ymd_and_hms(2025, 2, 13, 2, 0, 0).unwrap())
        );
    }

    #[test]
    fn one_off_is_exhausted_after_firing() {
        let t = Trigger::OneOff { at: at(12, 0, 0) };
        assert_eq!(initial(&t, at(10, 0, 0)), Some(at(12, 0, 0)));
        assert_eq!(advance(&t, at(12, 0, 0), at(12, 0, 1)), None);
        assert_eq!(on_resume(&t, at(11, 0, 0)), Some(at(12, 0, 0)));
        assert_eq!(on_resume(&t, at(13, 0, 0)), None);
    }

    #[test]
    fn daily_picks_today_or_tomorrow() {
        let t = Trigger::Daily { hour: 2, minute: 30 };
        assert_eq!(
            initial(&t, at(10, 0, 0)),
            Some(Utc.with_ymd_and_hms(2025, 2, 13, 2, 30, 0).unwrap())
        );
        assert_eq!(initial(&t, at(1, 0, 0)), Some(at(2, 30, 0)));
    }

    #[test]
    fn resume_does_not_replay() {
        let t = Trigger::Interval { every_secs: 300 };
        assert_eq!(on_resume(&t, at(10, 0, 0)), Some(at(10, 5, 0)));
    }

    #[test]
    fn validation_rules() {
        let now = at(10, 0, 0);
        let grace = Duration::seconds(60);
        assert!(validate(&Trigger::Interval { every_secs: 0 }, now, grace).is_err());
        assert!(validate(&Trigger::Interval { every_secs: 5 }, now, grace).is_ok());
        assert!(validate(&Trigger::Cron { expression: "nope".into() }, now, grace).is_err());
        assert!(validate(&Trigger::Cron { expression: "0 0 30 2 *".into() }, now, grace).is_err());
        assert!(validate(&Trigger::OneOff { at: now - Duration::seconds(30) }, now, grace).is_ok());
        assert!(validate(&Trigger::OneOff { at: now - Duration::hours(1) }, now, grace).is_err());
        assert!(validate(&Trigger::Daily { hour: 24, minute: 0 }, now, grace).is_err());
        assert!(matches!(
            validate(&Trigger::Interval { every_secs: 0 }, now, grace),
            Err(SchedulerError::InvalidTrigger(_))
        ));
    }

    #[test]
    fn oversized_interval_is_rejected_not_overflowed() {
        let now = at(10, 0, 0);
        let grace = Duration::seconds(60);
        let huge = Trigger::Interval {
            every_secs: 10_000_000_000_000,
        };
        assert!(matches!(
            validate(&huge, now, grace),
            Err(SchedulerError::InvalidTrigger(_))
        ));
        assert!(validate(&Trigger::Interval { every_secs: u64::MAX }, now, grace).is_err());
        assert_eq!(initial(&huge, now), None);
        assert_eq!(advance(&huge, now, now), None);
        assert_eq!(on_resume(&huge, now), None);
    }

    #[test]
    fn huge_grace_is_clamped() {
        let now = at(10, 0, 0);
        assert_eq!(grace_window(60), Duration::seconds(60));
        assert_eq!(grace_window(u64::MAX / 2), Duration::MAX);
        let stale = Trigger::OneOff {
            at: now - Duration::days(3650),
        };
        assert!(validate(&stale, now, grace_window(u64::MAX)).is_ok());
    }
}
