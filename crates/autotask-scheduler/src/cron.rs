//! 5-field cron expressions: `MIN HOUR DOM MON DOW`, evaluated in UTC.
//!
//! Each field accepts `*`, single values, lists (`1,15`), ranges (`9-17`) and
//! steps (`*/5`, `10-40/10`, `5/15`). Months and weekdays also take
//! three-letter names (`JAN`, `MON`), Sunday is `0` or `7`, and the usual
//! `@hourly`, `@daily`, `@weekly`, `@monthly`, `@yearly` shorthands work.
//!
//! When both day-of-month and day-of-week are restricted a day matches if
//! *either* does, as in classic cron.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};

/// How far ahead `next_after` searches before concluding there is no fire.
/// Covers leap-day schedules (`0 0 29 2 *`).
const SEARCH_HORIZON_DAYS: i64 = 366 * 5;

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const DAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    source: String,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_star: bool,
    dow_star: bool,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, String> {
        let expanded = expand_macro(expression.trim())?;
        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(format!(
                "'{expression}' has {} fields, expected 5 (MIN HOUR DOM MON DOW)",
                fields.len()
            ));
        }

        let minutes = parse_field(fields[0], 0, 59, None).map_err(|e| format!("minute: {e}"))?;
        let hours = parse_field(fields[1], 0, 23, None).map_err(|e| format!("hour: {e}"))?;
        let days_of_month =
            parse_field(fields[2], 1, 31, None).map_err(|e| format!("day-of-month: {e}"))?;
        let months =
            parse_field(fields[3], 1, 12, Some(&MONTH_NAMES)).map_err(|e| format!("month: {e}"))?;
        let mut days_of_week =
            parse_field(fields[4], 0, 7, Some(&DAY_NAMES)).map_err(|e| format!("day-of-week: {e}"))?;
        // 7 is Sunday too.
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        Ok(Self {
            source: expression.trim().to_string(),
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_star: fields[2].starts_with('*'),
            dow_star: fields[4].starts_with('*'),
        })
    }

    pub fn expression(&self) -> &str {
        &self.source
    }

    /// Earliest matching minute strictly after `after`, or `None` if nothing
    /// matches within the search horizon (e.g. `0 0 30 2 *`).
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after.naive_utc().with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        let limit = start + Duration::days(SEARCH_HORIZON_DAYS);
        let mut t = start;

        while t <= limit {
            if !bit(self.months, t.month()) {
                t = first_of_next_month(t.date())?;
                continue;
            }
            if !self.day_matches(t.date()) {
                t = midnight(t.date().succ_opt()?);
                continue;
            }
            if !bit(self.hours, t.hour()) {
                t = t.with_minute(0)? + Duration::hours(1);
                continue;
            }
            if !bit(self.minutes, t.minute()) {
                t += Duration::minutes(1);
                continue;
            }
            return Some(t.and_utc());
        }
        None
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = bit(self.days_of_month, date.day());
        let dow = bit(self.days_of_week, date.weekday().num_days_from_sunday());
        if self.dom_star || self.dow_star {
            dom && dow
        } else {
            dom || dow
        }
    }
}

impl FromStr for CronSchedule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn bit(mask: u64, n: u32) -> bool {
    mask & (1u64 << n) != 0
}

fn midnight(date: NaiveDate) -> NaiveDateTime {
    date.and_time(NaiveTime::MIN)
}

fn first_of_next_month(date: NaiveDate) -> Option<NaiveDateTime> {
    let (y, m) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(y, m, 1).map(midnight)
}

fn expand_macro(expr: &str) -> Result<&str, String> {
    if !expr.starts_with('@') {
        return Ok(expr);
    }
    match expr.to_ascii_lowercase().as_str() {
        "@hourly" => Ok("0 * * * *"),
        "@daily" | "@midnight" => Ok("0 0 * * *"),
        "@weekly" => Ok("0 0 * * 0"),
        "@monthly" => Ok("0 0 1 * *"),
        "@yearly" | "@annually" => Ok("0 0 1 1 *"),
        _ => Err(format!("unknown shorthand '{expr}'")),
    }
}

/// Parse one field into a bitmask of allowed values.
fn parse_field(field: &str, min: u32, max: u32, names: Option<&[&str]>) -> Result<u64, String> {
    let mut mask = 0u64;
    for part in field.split(',') {
        if part.is_empty() {
            return Err(format!("empty list element in '{field}'"));
        }
        let (range, step) = match part.split_once('/') {
            Some((r, s)) => {
                let step: u32 = s.parse().map_err(|_| format!("bad step '{s}'"))?;
                if step == 0 {
                    return Err("step must be at least 1".to_string());
                }
                (r, Some(step))
            }
            None => (part, None),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (value(a, names, min)?, value(b, names, min)?)
        } else {
            let v = value(range, names, min)?;
            // `5/15` means "from 5 to the end, every 15".
            if step.is_some() {
                (v, max)
            } else {
                (v, v)
            }
        };

        if lo < min || hi > max {
            return Err(format!("'{part}' is outside {min}-{max}"));
        }
        if lo > hi {
            return Err(format!("range '{range}' is reversed"));
        }
        for v in (lo..=hi).step_by(step.unwrap_or(1) as usize) {
            mask |= 1u64 << v;
        }
    }
    Ok(mask)
}

fn value(token: &str, names: Option<&[&str]>, min: u32) -> Result<u32, String> {
    if let Ok(n) = token.parse::<u32>() {
        return Ok(n);
    }
    let lower = token.to_ascii_lowercase();
    names
        .and_then(|list| list.iter().position(|n| *n == lower))
        .map(|i| i as u32 + min)
        .ok_or_else(|| format!("bad value '{token}'"))
}
