use std::sync::Mutex;

use autotask_core::JobId;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension};
use tracing::{debug, instrument, warn};

use crate::db::{get_json, get_opt_json, get_opt_ts, get_parsed, get_ts, init_db, opt_ts, ts};
use crate::error::{Result, StoreError};
use crate::types::Job;

const JOB_COLUMNS: &str = "id, name, task_type, trigger_spec, params, enabled, description, tags,
     timeout_ms, retry, misfire_grace_secs, next_run_at, last_run_at, last_status,
     run_count, success_count, failure_count, last_error, last_duration_ms,
     invalid_reason, created_at, updated_at";

/// Durable storage of job definitions.
///
/// Every write is a single statement, so a save either lands completely or
/// not at all. Access is serialized through the connection mutex.
pub struct JobStore {
    db: Mutex<Connection>,
}

impl JobStore {
    /// Wrap an open connection, creating the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// Fresh in-memory store (tests, dry runs).
    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    /// Insert or fully replace a job (upsert on `id`).
    ///
    /// Fails with `DuplicateJobName` if another job already holds the name.
    #[instrument(skip(self, job), fields(job_id = %job.id, name = %job.name))]
    pub fn save(&self, job: &Job) -> Result<()> {
        let trigger = serde_json::to_string(&job.trigger)?;
        let params = serde_json::to_string(&job.params)?;
        let tags = serde_json::to_string(&job.tags)?;
        let retry = job.retry.as_ref().map(serde_json::to_string).transpose()?;

        let db = self.db.lock().unwrap();
        let res = db.execute(
            "INSERT INTO jobs
             (id, name, task_type, trigger_spec, params, enabled, description, tags,
              timeout_ms, retry, misfire_grace_secs, next_run_at, last_run_at, last_status,
              run_count, success_count, failure_count, last_error, last_duration_ms,
              invalid_reason, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                task_type = excluded.task_type,
                trigger_spec = excluded.trigger_spec,
                params = excluded.params,
                enabled = excluded.enabled,
                description = excluded.description,
                tags = excluded.tags,
                timeout_ms = excluded.timeout_ms,
                retry = excluded.retry,
                misfire_grace_secs = excluded.misfire_grace_secs,
                next_run_at = excluded.next_run_at,
                last_run_at = excluded.last_run_at,
                last_status = excluded.last_status,
                run_count = excluded.run_count,
                success_count = excluded.success_count,
                failure_count = excluded.failure_count,
                last_error = excluded.last_error,
                last_duration_ms = excluded.last_duration_ms,
                invalid_reason = excluded.invalid_reason,
                updated_at = excluded.updated_at",
            rusqlite::params![
                job.id.as_str(),
                job.name,
                job.task_type,
                trigger,
                params,
                job.enabled,
                job.description,
                tags,
                job.timeout_ms.map(|v| v as i64),
                retry,
                job.misfire_grace_secs.map(|v| v as i64),
                opt_ts(&job.next_run_at),
                opt_ts(&job.last_run_at),
                job.last_status.map(|s| s.as_str()),
                job.run_count as i64,
                job.success_count as i64,
                job.failure_count as i64,
                job.last_error,
                job.last_duration_ms.map(|v| v as i64),
                job.invalid_reason,
                ts(&job.created_at),
                ts(&job.updated_at),
            ],
        );
        match res {
            Ok(_) => {
                debug!("job saved");
                Ok(())
            }
            Err(e) if is_unique_violation(&e) => Err(StoreError::DuplicateJobName {
                name: job.name.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Load a job by id, failing with `JobNotFound` if absent.
    pub fn load(&self, id: &JobId) -> Result<Job> {
        self.find(id)?.ok_or_else(|| StoreError::JobNotFound {
            id: id.to_string(),
        })
    }

    #[instrument(skip(self), fields(job_id = %id))]
    pub fn find(&self, id: &JobId) -> Result<Option<Job>> {
        let db = self.db.lock().unwrap();
        let job = db
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                [id.as_str()],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    #[instrument(skip(self))]
    pub fn find_by_name(&self, name: &str) -> Result<Option<Job>> {
        let db = self.db.lock().unwrap();
        let job = db
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE name = ?1"),
                [name],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    /// All jobs, oldest first. Undecodable rows are logged and left out.
    pub fn list_all(&self) -> Result<Vec<Job>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at, id"
        ))?;
        let rows = stmt.query_map([], row_to_job)?;
        Ok(collect_logged(rows))
    }

    /// Enabled jobs whose `next_run_at` has arrived, most overdue first.
    pub fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare_cached(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE enabled = 1 AND next_run_at IS NOT NULL AND next_run_at <= ?1
             ORDER BY next_run_at, id"
        ))?;
        let rows = stmt.query_map([ts(&now)], row_to_job)?;
        Ok(collect_logged(rows))
    }

    /// Remove a job. Fails with `JobNotFound` if no row is deleted.
    #[instrument(skip(self), fields(job_id = %id))]
    pub fn delete(&self, id: &JobId) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute("DELETE FROM jobs WHERE id = ?1", [id.as_str()])?;
        if n == 0 {
            return Err(StoreError::JobNotFound { id: id.to_string() });
        }
        debug!("job deleted");
        Ok(())
    }

    pub fn count(&self) -> Result<u64> {
        let db = self.db.lock().unwrap();
        let n: i64 = db.query_row("SELECT COUNT(*) FROM jobs", [], |r| r.get(0))?;
        Ok(n as u64)
    }
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, Some(msg))
            if err.code == ErrorCode::ConstraintViolation && msg.contains("jobs.name")
    )
}

fn collect_logged<I>(rows: I) -> Vec<Job>
where
    I: Iterator<Item = rusqlite::Result<Job>>,
{
    rows.filter_map(|r| match r {
        Ok(job) => Some(job),
        Err(e) => {
            warn!("skipping undecodable job row: {e}");
            None
        }
    })
    .collect()
}

/// Map a SQLite row to a `Job`.
fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    Ok(Job {
        id: JobId(row.get(0)?),
        name: row.get(1)?,
        task_type: row.get(2)?,
        trigger: get_json(row, 3)?,
        params: get_json(row, 4)?,
        enabled: row.get(5)?,
        description: row.get(6)?,
        tags: get_json(row, 7)?,
        timeout_ms: row.get::<_, Option<i64>>(8)?.map(|v| v as u64),
        retry: get_opt_json(row, 9)?,
        misfire_grace_secs: row.get::<_, Option<i64>>(10)?.map(|v| v as u64),
        next_run_at: get_opt_ts(row, 11)?,
        last_run_at: get_opt_ts(row, 12)?,
        last_status: match row.get::<_, Option<String>>(13)? {
            Some(_) => Some(get_parsed(row, 13)?),
            None => None,
        },
        run_count: row.get::<_, i64>(14)? as u64,
        success_count: row.get::<_, i64>(15)? as u64,
        failure_count: row.get::<_, i64>(16)? as u64,
        last_error: row.get(17)?,
        last_duration_ms: row.get::<_, Option<i64>>(18)?.map(|v| v as u64),
        invalid_reason: row.get(19)?,
        created_at: get_ts(row, 20)?,
        updated_at: get_ts(row, 21)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RetryPolicy, Trigger};
    use autotask_task::{TaskParams, TaskStatus};
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 2, 12, 10, 0, 0).unwrap()
    }

    fn job(name: &str, next: Option<DateTime<Utc>>) -> Job {
        let params = json!({"command": "echo hi"}).as_object().cloned().unwrap();
        let mut j = Job::new(name, "command", Trigger::Interval { every_secs: 60 }, params, t0());
        j.next_run_at = next;
        j
    }

    #[test]
    fn save_and_load_round_trip() {
        let store = JobStore::open_in_memory().unwrap();
        let mut j = job("nightly", Some(t0()));
        j.tags = vec!["ops".into()];
        j.retry = Some(RetryPolicy::fixed(2, std::time::Duration::from_secs(5)));
        j.last_status = Some(TaskStatus::TimedOut);
        store.save(&j).unwrap();

        let loaded = store.load(&j.id).unwrap();
        assert_eq!(loaded, j);
        assert_eq!(store.find_by_name("nightly").unwrap().unwrap().id, j.id);
    }

    #[test]
    fn save_is_an_upsert() {
        let store = JobStore::open_in_memory().unwrap();
        let mut j = job("a", None);
        store.save(&j).unwrap();
        j.enabled = false;
        j.run_count = 7;
        store.save(&j).unwrap();

        assert_eq!(store.count().unwrap(), 1);
        let loaded = store.load(&j.id).unwrap();
        assert!(!loaded.enabled);
        assert_eq!(loaded.run_count, 7);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let store = JobStore::open_in_memory().unwrap();
        store.save(&job("dup", None)).unwrap();
        let err = store.save(&job("dup", None)).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateJobName { .. }));
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn delete_missing_is_not_found() {
        let store = JobStore::open_in_memory().unwrap();
        let err = store.delete(&JobId::from("nope")).unwrap_err();
        assert!(matches!(err, StoreError::JobNotFound { .. }));
    }

    #[test]
    fn list_due_filters_by_time_and_enabled() {
        let store = JobStore::open_in_memory().unwrap();
        let due = job("due", Some(t0() - Duration::seconds(5)));
        let later = job("later", Some(t0() + Duration::seconds(5)));
        let mut paused = job("paused", Some(t0() - Duration::seconds(5)));
        paused.enabled = false;
        let done = job("done", None);
        for j in [&due, &later, &paused, &done] {
            store.save(j).unwrap();
        }

        let names: Vec<String> = store.list_due(t0()).unwrap().into_iter().map(|j| j.name).collect();
        assert_eq!(names, vec!["due".to_string()]);
        assert_eq!(store.list_all().unwrap().len(), 4);
    }

    #[test]
    fn corrupt_rows_are_skipped_in_listings() {
        let store = JobStore::open_in_memory().unwrap();
        store.save(&job("good", None)).unwrap();
        {
            let db = store.db.lock().unwrap();
            db.execute(
                "INSERT INTO jobs (id, name, task_type, trigger_spec, params, created_at, updated_at)
                 VALUES ('x', 'bad', 'command', 'not json', '{}', '2025-01-01T00:00:00.000Z', '2025-01-01T00:00:00.000Z')",
                [],
            )
            .unwrap();
        }
        let all = store.list_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "good");
        assert!(store.load(&JobId::from("x")).is_err());
    }

    #[test]
    fn survives_reopen_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        let j = job("persisted", Some(t0()));
        {
            let store = JobStore::new(crate::db::open_connection(&path).unwrap()).unwrap();
            store.save(&j).unwrap();
        }
        let store = JobStore::new(crate::db::open_connection(&path).unwrap()).unwrap();
        assert_eq!(store.load(&j.id).unwrap(), j);
    }

    #[test]
    fn params_are_opaque_json() {
        let store = JobStore::open_in_memory().unwrap();
        let mut params = TaskParams::new();
        params.insert("nested".into(), json!({"a": [1, 2, 3]}));
        let mut j = job("opaque", None);
        j.params = params.clone();
        store.save(&j).unwrap();
        assert_eq!(store.load(&j.id).unwrap().params, params);
    }
}
