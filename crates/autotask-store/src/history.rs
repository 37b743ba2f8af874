use std::sync::Mutex;

use autotask_core::{JobId, RunId};
use autotask_task::{ResultData, TaskFailure, TaskResult};
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info, instrument, warn};

use crate::db::{get_opt_json, get_opt_ts, get_parsed, get_ts, init_db, opt_ts, ts};
use crate::error::{Result, StoreError};
use crate::types::{Run, RunQuery, RunStats, RunStatus};

const RUN_COLUMNS: &str = "id, job_id, job_name, task_type, attempt, origin, trigger_time, status,
     started_at, exec_started_at, finished_at, message, data, error";

/// Append-only log of execution attempts.
///
/// A row is written as `Running` at dispatch and moved to its terminal status
/// exactly once by [`finish`](Self::finish). Apart from that transition the
/// only mutation is pruning, which never touches `Running` rows.
pub struct RunHistory {
    db: Mutex<Connection>,
}

impl RunHistory {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    #[instrument(skip(self, run), fields(run_id = %run.id, job_id = %run.job_id, status = %run.status))]
    pub fn append(&self, run: &Run) -> Result<()> {
        let (exec_started, finished, duration, message, data, error) = result_columns(run)?;
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO runs
             (id, job_id, job_name, task_type, attempt, origin, trigger_time, status,
              started_at, exec_started_at, finished_at, duration_ms, message, data, error)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
            rusqlite::params![
                run.id.as_str(),
                run.job_id.as_str(),
                run.job_name,
                run.task_type,
                run.attempt_number as i64,
                run.origin.as_str(),
                ts(&run.trigger_time),
                run.status.as_str(),
                ts(&run.started_at),
                exec_started,
                finished,
                duration,
                message,
                data,
                error,
            ],
        )?;
        debug!("run appended");
        Ok(())
    }

    /// Move a `Running` row to the status carried by `result`.
    ///
    /// Fails with `RunFinalized` if the row already left `Running` (for
    /// example it was closed out by a timed-out stop) and with `RunNotFound`
    /// if it does not exist.
    #[instrument(skip(self, result), fields(run_id = %id, status = %result.status))]
    pub fn finish(&self, id: &RunId, result: &TaskResult) -> Result<Run> {
        let status = RunStatus::from(result.status);
        let data = serde_json::to_string(&result.data)?;
        let error = result.error.as_ref().map(serde_json::to_string).transpose()?;

        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE runs SET status = ?1, exec_started_at = ?2, finished_at = ?3,
                    duration_ms = ?4, message = ?5, data = ?6, error = ?7
             WHERE id = ?8 AND status = 'running'",
            rusqlite::params![
                status.as_str(),
                ts(&result.started_at),
                ts(&result.finished_at),
                result.duration().num_milliseconds(),
                result.message,
                data,
                error,
                id.as_str(),
            ],
        )?;
        let run = db
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"),
                [id.as_str()],
                row_to_run,
            )
            .optional()?
            .ok_or_else(|| StoreError::RunNotFound { id: id.to_string() })?;
        if n == 0 {
            return Err(StoreError::RunFinalized { id: id.to_string() });
        }
        Ok(run)
    }

    pub fn get(&self, id: &RunId) -> Result<Run> {
        let db = self.db.lock().unwrap();
        db.query_row(
            &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"),
            [id.as_str()],
            row_to_run,
        )
        .optional()?
        .ok_or_else(|| StoreError::RunNotFound { id: id.to_string() })
    }

    /// Runs matching `q`, newest first unless `q.ascending`.
    #[instrument(skip(self))]
    pub fn query(&self, q: &RunQuery) -> Result<Vec<Run>> {
        let (where_sql, mut args) = filter_clause(q.job_id.as_ref(), q.status, q.since);
        let order = if q.ascending { "ASC" } else { "DESC" };
        let mut sql = format!(
            "SELECT {RUN_COLUMNS} FROM runs{where_sql} ORDER BY started_at {order}, rowid {order}"
        );
        if let Some(limit) = q.limit {
            sql.push_str(" LIMIT ?");
            args.push(Value::Integer(limit as i64));
        }

        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args), row_to_run)?;
        Ok(rows
            .filter_map(|r| match r {
                Ok(run) => Some(run),
                Err(e) => {
                    warn!("skipping undecodable run row: {e}");
                    None
                }
            })
            .collect())
    }

    /// Rows still marked `Running`, oldest first.
    pub fn running(&self) -> Result<Vec<Run>> {
        self.query(&RunQuery::new().status(RunStatus::Running).oldest_first())
    }

    pub fn count(&self, job_id: Option<&JobId>, status: Option<RunStatus>) -> Result<u64> {
        let (where_sql, args) = filter_clause(job_id, status, None);
        let db = self.db.lock().unwrap();
        let n: i64 = db.query_row(
            &format!("SELECT COUNT(*) FROM runs{where_sql}"),
            rusqlite::params_from_iter(args),
            |r| r.get(0),
        )?;
        Ok(n as u64)
    }

    /// Aggregate counts and durations, optionally for one job.
    ///
    /// Skipped and still-running rows are left out of the duration figures.
    #[instrument(skip(self))]
    pub fn stats(&self, job_id: Option<&JobId>) -> Result<RunStats> {
        let (where_sql, args) = filter_clause(job_id, None, None);
        let db = self.db.lock().unwrap();
        let mut stats = db.query_row(
            &format!(
                "SELECT COUNT(*),
                        COALESCE(SUM(status = 'running'), 0),
                        COALESCE(SUM(status = 'success'), 0),
                        COALESCE(SUM(status = 'failed'), 0),
                        COALESCE(SUM(status = 'skipped'), 0),
                        COALESCE(SUM(status = 'cancelled'), 0),
                        COALESCE(SUM(status = 'timed_out'), 0),
                        AVG(CASE WHEN status NOT IN ('skipped', 'running') THEN duration_ms END),
                        MIN(CASE WHEN status NOT IN ('skipped', 'running') THEN duration_ms END),
                        MAX(CASE WHEN status NOT IN ('skipped', 'running') THEN duration_ms END),
                        MAX(started_at),
                        MAX(CASE WHEN status = 'success' THEN started_at END),
                        MAX(CASE WHEN status IN ('failed', 'timed_out') THEN started_at END)
                 FROM runs{where_sql}"
            ),
            rusqlite::params_from_iter(args),
            |r| {
                Ok(RunStats {
                    total: r.get::<_, i64>(0)? as u64,
                    running: r.get::<_, i64>(1)? as u64,
                    success: r.get::<_, i64>(2)? as u64,
                    failed: r.get::<_, i64>(3)? as u64,
                    skipped: r.get::<_, i64>(4)? as u64,
                    cancelled: r.get::<_, i64>(5)? as u64,
                    timed_out: r.get::<_, i64>(6)? as u64,
                    success_rate: 0.0,
                    avg_duration_ms: r.get(7)?,
                    min_duration_ms: r.get(8)?,
                    max_duration_ms: r.get(9)?,
                    last_run_at: get_opt_ts(r, 10)?,
                    last_success_at: get_opt_ts(r, 11)?,
                    last_failure_at: get_opt_ts(r, 12)?,
                })
            },
        )?;
        if stats.total > 0 {
            stats.success_rate = stats.success as f64 / stats.total as f64 * 100.0;
        }
        Ok(stats)
    }

    /// Delete finished runs that started before `older_than`. `Running` rows
    /// are kept regardless of age.
    #[instrument(skip(self))]
    pub fn prune(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "DELETE FROM runs WHERE started_at < ?1 AND status != 'running'",
            [ts(&older_than)],
        )?;
        if n > 0 {
            info!(deleted = n, "run history pruned");
        }
        Ok(n)
    }

    /// Drop every run of a job (used when the job itself is removed).
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub fn delete_for_job(&self, job_id: &JobId) -> Result<usize> {
        let db = self.db.lock().unwrap();
        let n = db.execute("DELETE FROM runs WHERE job_id = ?1", [job_id.as_str()])?;
        debug!(deleted = n, "runs deleted for job");
        Ok(n)
    }
}

type ResultColumns = (
    Option<String>,
    Option<String>,
    Option<i64>,
    Option<String>,
    Option<String>,
    Option<String>,
);

fn result_columns(run: &Run) -> Result<ResultColumns> {
    let Some(r) = &run.result else {
        return Ok((None, None, None, None, None, None));
    };
    let data = serde_json::to_string(&r.data)?;
    let error = r.error.as_ref().map(serde_json::to_string).transpose()?;
    Ok((
        Some(ts(&r.started_at)),
        Some(ts(&r.finished_at)),
        Some(r.duration().num_milliseconds()),
        Some(r.message.clone()),
        Some(data),
        error,
    ))
}

fn filter_clause(
    job_id: Option<&JobId>,
    status: Option<RunStatus>,
    since: Option<DateTime<Utc>>,
) -> (String, Vec<Value>) {
    let mut conds = Vec::new();
    let mut args = Vec::new();
    if let Some(id) = job_id {
        conds.push("job_id = ?");
        args.push(Value::Text(id.to_string()));
    }
    if let Some(s) = status {
        conds.push("status = ?");
        args.push(Value::Text(s.as_str().to_string()));
    }
    if let Some(t) = since {
        conds.push("started_at >= ?");
        args.push(Value::Text(ts(&t)));
    }
    if conds.is_empty() {
        (String::new(), args)
    } else {
        (format!(" WHERE {}", conds.join(" AND ")), args)
    }
}

/// Map a SQLite row to a `Run`, rebuilding the embedded result once final.
fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
    let status: RunStatus = get_parsed(row, 7)?;
    let started_at = get_ts(row, 8)?;

    let result = match status {
        RunStatus::Running => None,
        RunStatus::Success
        | RunStatus::Failed
        | RunStatus::Skipped
        | RunStatus::Cancelled
        | RunStatus::TimedOut => {
            let exec_started = get_opt_ts(row, 9)?.unwrap_or(started_at);
            let finished = get_opt_ts(row, 10)?.unwrap_or(exec_started);
            let message: Option<String> = row.get(11)?;
            let data: Option<ResultData> = get_opt_json(row, 12)?;
            let error: Option<TaskFailure> = get_opt_json(row, 13)?;
            Some(TaskResult {
                status: terminal_task_status(status),
                message: message.unwrap_or_default(),
                data: data.unwrap_or_default(),
                error,
                started_at: exec_started,
                finished_at: finished,
            })
        }
    };

    Ok(Run {
        id: RunId(row.get(0)?),
        job_id: JobId(row.get(1)?),
        job_name: row.get(2)?,
        task_type: row.get(3)?,
        attempt_number: row.get::<_, i64>(4)? as u32,
        origin: get_parsed(row, 5)?,
        trigger_time: get_ts(row, 6)?,
        status,
        started_at,
        result,
    })
}

fn terminal_task_status(status: RunStatus) -> autotask_task::TaskStatus {
    use autotask_task::TaskStatus;
    match status {
        RunStatus::Success => TaskStatus::Success,
        RunStatus::Failed => TaskStatus::Failed,
        RunStatus::Skipped => TaskStatus::Skipped,
        RunStatus::TimedOut => TaskStatus::TimedOut,
        RunStatus::Cancelled | RunStatus::Running => TaskStatus::Cancelled,
    }
}
