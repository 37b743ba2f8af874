use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Row};
use serde::de::DeserializeOwned;

use crate::error::Result;

/// Open (or create) the database file with the pragmas both stores expect.
///
/// WAL keeps a reader from ever observing a half-written row, even across an
/// unclean shutdown.
pub fn open_connection(path: impl AsRef<Path>) -> Result<Connection> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=3000;")?;
    init_db(&conn)?;
    Ok(conn)
}

/// Initialise the schema in `conn`. Safe to call on every startup.
pub fn init_db(conn: &Connection) -> Result<()> {
    create_jobs_table(conn)?;
    create_runs_table(conn)?;
    Ok(())
}

fn create_jobs_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id                  TEXT    NOT NULL PRIMARY KEY,
            name                TEXT    NOT NULL UNIQUE,
            task_type           TEXT    NOT NULL,
            trigger_spec        TEXT    NOT NULL,   -- JSON-encoded Trigger
            params              TEXT    NOT NULL,   -- opaque JSON object
            enabled             INTEGER NOT NULL DEFAULT 1,
            description         TEXT    NOT NULL DEFAULT '',
            tags                TEXT    NOT NULL DEFAULT '[]',
            timeout_ms          INTEGER,
            retry               TEXT,               -- JSON RetryPolicy or NULL
            misfire_grace_secs  INTEGER,
            next_run_at         TEXT,
            last_run_at         TEXT,
            last_status         TEXT,
            run_count           INTEGER NOT NULL DEFAULT 0,
            success_count       INTEGER NOT NULL DEFAULT 0,
            failure_count       INTEGER NOT NULL DEFAULT 0,
            last_error          TEXT,
            last_duration_ms    INTEGER,
            invalid_reason      TEXT,
            created_at          TEXT    NOT NULL,
            updated_at          TEXT    NOT NULL
        ) STRICT;

        -- Polling: SELECT … WHERE enabled = 1 AND next_run_at <= ?
        CREATE INDEX IF NOT EXISTS idx_jobs_next_run ON jobs (enabled, next_run_at);
        ",
    )
}

fn create_runs_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS runs (
            id                  TEXT    NOT NULL PRIMARY KEY,
            job_id              TEXT    NOT NULL,
            job_name            TEXT    NOT NULL,
            task_type           TEXT    NOT NULL,
            attempt             INTEGER NOT NULL,
            origin              TEXT    NOT NULL,
            trigger_time        TEXT    NOT NULL,
            status              TEXT    NOT NULL,
            started_at          TEXT    NOT NULL,
            exec_started_at     TEXT,
            finished_at         TEXT,
            duration_ms         INTEGER,
            message             TEXT,
            data                TEXT,               -- JSON object
            error               TEXT                -- JSON TaskFailure
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_runs_job ON runs (job_id, started_at DESC);
        CREATE INDEX IF NOT EXISTS idx_runs_status ON runs (status);
        CREATE INDEX IF NOT EXISTS idx_runs_started ON runs (started_at);
        ",
    )
}

/// Fixed-width RFC 3339 so string order matches time order.
pub(crate) fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn opt_ts(dt: &Option<DateTime<Utc>>) -> Option<String> {
    dt.as_ref().map(ts)
}

fn conversion_error(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

pub(crate) fn get_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_ts(idx, &s)
}

pub(crate) fn get_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|s| parse_ts(idx, &s)).transpose()
}

pub(crate) fn get_json<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    serde_json::from_str(&s).map_err(|e| conversion_error(idx, e))
}

pub(crate) fn get_opt_json<T: DeserializeOwned>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|s| serde_json::from_str(&s).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

/// Parse a text column through `FromStr` (status and origin enums).
pub(crate) fn get_parsed<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    let s: String = row.get(idx)?;
    s.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
    }

    #[test]
    fn timestamps_sort_lexicographically() {
        let a = Utc.with_ymd_and_hms(2025, 2, 12, 9, 59, 59).unwrap();
        let b = Utc.with_ymd_and_hms(2025, 2, 12, 10, 0, 0).unwrap();
        assert_eq!(ts(&b), "2025-02-12T10:00:00.000Z");
        assert!(ts(&a) < ts(&b));
    }

    #[test]
    fn open_connection_creates_parent_dir_and_uses_wal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("autotask.db");
        let conn = open_connection(&path).unwrap();
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |r| r.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        assert!(path.exists());
    }
}
