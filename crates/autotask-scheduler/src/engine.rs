use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use autotask_core::{JobId, RunId, SchedulerConfig, SharedClock, SystemClock};
use autotask_hooks::{ObserverRegistry, RunEvent};
use autotask_store::{
    Job, JobStore, RetryPolicy, Run, RunHistory, RunOrigin, RunQuery, RunStats, StoreError, Trigger,
};
use autotask_task::{run_guarded, ExecOptions, Task, TaskContext, TaskParams, TaskRegistry, TaskResult, TaskStatus};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SchedulerError};
use crate::{retry, trigger};

/// Message of the `Skipped` run recorded for a missed fire.
pub const MISFIRE_REASON: &str = "misfire";

/// Optional settings for [`Scheduler::add_job`].
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    pub description: String,
    pub tags: Vec<String>,
    /// Per-run timeout.
    pub timeout: Option<Duration>,
    /// Overrides the scheduler-wide retry defaults.
    pub retry: Option<RetryPolicy>,
    /// Overrides the scheduler-wide misfire grace.
    pub misfire_grace: Option<Duration>,
    /// Store the job disabled.
    pub paused: bool,
}

/// What one evaluation pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub due: usize,
    pub dispatched: usize,
    pub misfired: usize,
    /// Still running or no free worker; evaluated again next tick.
    pub deferred: usize,
    pub invalid: usize,
}

/// Snapshot for status displays.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub total_jobs: usize,
    pub enabled_jobs: usize,
    pub in_flight: usize,
    pub max_concurrent: usize,
    pub next_job: Option<String>,
    pub next_run_at: Option<DateTime<Utc>>,
}

/// Outcome of [`Scheduler::stop`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StopReport {
    /// Jobs whose runs reached a terminal status on their own.
    pub drained: usize,
    /// Runs still going at the deadline, marked `Cancelled` and abandoned.
    pub abandoned: usize,
}

/// Holder of a job's exclusivity slot.
struct ActiveRun {
    /// Distinguishes successive holders of the same job's slot.
    seq: u64,
    cancel: CancellationToken,
    abort: Option<AbortHandle>,
}

struct Lifecycle {
    root: CancellationToken,
    running: bool,
    tick_loop: Option<JoinHandle<()>>,
}

enum Evaluation {
    Dispatched,
    Misfired,
    Deferred,
    Invalid,
    Failed,
}

struct Inner {
    jobs: JobStore,
    history: RunHistory,
    registry: Arc<TaskRegistry>,
    observers: Arc<ObserverRegistry>,
    clock: SharedClock,
    config: SchedulerConfig,
    pool: Arc<Semaphore>,
    /// Per-job exclusivity: a job id is present while it has a run (or a
    /// pending retry) in progress.
    active: DashMap<JobId, ActiveRun>,
    seq: AtomicU64,
    /// Serializes trigger evaluation and job mutations.
    state: Mutex<()>,
    lifecycle: StdMutex<Lifecycle>,
    in_flight: watch::Sender<usize>,
}

/// The orchestration core.
///
/// Cheap to clone; every clone is a handle to the same engine. Construct one
/// per process with [`Scheduler::builder`] and hand clones to consumers.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

pub struct SchedulerBuilder {
    jobs: JobStore,
    history: RunHistory,
    registry: Arc<TaskRegistry>,
    config: SchedulerConfig,
    clock: Option<SharedClock>,
    observers: Option<Arc<ObserverRegistry>>,
}

impl SchedulerBuilder {
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn observers(mut self, observers: Arc<ObserverRegistry>) -> Self {
        self.observers = Some(observers);
        self
    }

    pub fn build(self) -> Scheduler {
        let max_concurrent = self.config.max_concurrent.max(1);
        let observers = self.observers.unwrap_or_else(|| {
            Arc::new(ObserverRegistry::new(Duration::from_secs(
                self.config.observer_timeout_secs,
            )))
        });
        let (in_flight, _) = watch::channel(0);
        Scheduler {
            inner: Arc::new(Inner {
                jobs: self.jobs,
                history: self.history,
                registry: self.registry,
                observers,
                clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
                config: self.config,
                pool: Arc::new(Semaphore::new(max_concurrent)),
                active: DashMap::new(),
                seq: AtomicU64::new(0),
                state: Mutex::new(()),
                lifecycle: StdMutex::new(Lifecycle {
                    root: CancellationToken::new(),
                    running: false,
                    tick_loop: None,
                }),
                in_flight,
            }),
        }
    }
}

impl Scheduler {
    pub fn builder(jobs: JobStore, history: RunHistory, registry: Arc<TaskRegistry>) -> SchedulerBuilder {
        SchedulerBuilder {
            jobs,
            history,
            registry,
            config: SchedulerConfig::default(),
            clock: None,
            observers: None,
        }
    }

    pub fn observers(&self) -> &Arc<ObserverRegistry> {
        &self.inner.observers
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.inner.registry
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    // --- job management ----------------------------------------------------

    /// Validate and persist a new job, returning its id.
    ///
    /// Nothing is stored when any check fails.
    pub async fn add_job(
        &self,
        name: &str,
        task_type: &str,
        trigger: Trigger,
        params: TaskParams,
        options: JobOptions,
    ) -> Result<JobId> {
        let name = name.trim();
        if name.is_empty() {
            return Err(SchedulerError::InvalidParams("job name must not be empty".to_string()));
        }
        let _state = self.inner.state.lock().await;

        let task_type = self
            .inner
            .registry
            .canonical(task_type)
            .ok_or_else(|| SchedulerError::UnknownTaskType {
                task_type: task_type.trim().to_lowercase(),
            })?;
        let now = self.inner.clock.now();
        if let Some(grace) = options.misfire_grace {
            if chrono::Duration::from_std(grace).is_err() {
                return Err(SchedulerError::InvalidParams(format!(
                    "misfire grace of {}s is too large",
                    grace.as_secs()
                )));
            }
        }
        let grace_secs = options
            .misfire_grace
            .map(|g| g.as_secs())
            .unwrap_or(self.inner.config.misfire_grace_secs);
        trigger::validate(&trigger, now, trigger::grace_window(grace_secs))?;

        let task = self.inner.registry.resolve(&task_type)?;
        task.validate(&params).map_err(SchedulerError::InvalidParams)?;

        if self.inner.jobs.find_by_name(name)?.is_some() {
            return Err(SchedulerError::DuplicateJobName {
                name: name.to_string(),
            });
        }

        let mut job = Job::new(name, task_type, trigger, params, now);
        job.description = options.description;
        job.tags = options.tags;
        job.timeout_ms = options.timeout.map(|t| t.as_millis() as u64);
        job.retry = options.retry;
        job.misfire_grace_secs = options.misfire_grace.map(|g| g.as_secs());
        job.enabled = !options.paused;
        job.next_run_at = trigger::initial(&job.trigger, now);

        self.save_job(&job).await?;
        info!(
            job_id = %job.id,
            name = %job.name,
            task_type = %job.task_type,
            trigger = %job.trigger,
            next_run_at = ?job.next_run_at,
            "job added"
        );
        Ok(job.id)
    }

    /// Delete a job and its run history. An in-flight run is cancelled.
    pub async fn remove_job(&self, id: &JobId) -> Result<()> {
        let _state = self.inner.state.lock().await;
        let job = self.inner.jobs.load(id)?;
        self.cancel_active(id);
        // Runs go first: if the job delete then fails, nothing is orphaned and
        // the removal can simply be repeated.
        let runs = self
            .store("delete job runs", || self.inner.history.delete_for_job(id))
            .await?;
        self.store("delete job", || self.inner.jobs.delete(id)).await?;
        info!(job_id = %id, name = %job.name, runs_deleted = runs, "job removed");
        Ok(())
    }

    /// Stop evaluating a job. A run already in progress is left to finish.
    pub async fn pause_job(&self, id: &JobId) -> Result<Job> {
        let _state = self.inner.state.lock().await;
        let mut job = self.inner.jobs.load(id)?;
        if job.enabled {
            job.enabled = false;
            job.updated_at = self.inner.clock.now();
            self.save_job(&job).await?;
            info!(job_id = %id, name = %job.name, "job paused");
        }
        Ok(job)
    }

    /// Re-enable a job, computing `next_run_at` from now so fires missed
    /// while paused are not replayed.
    pub async fn resume_job(&self, id: &JobId) -> Result<Job> {
        let _state = self.inner.state.lock().await;
        let mut job = self.inner.jobs.load(id)?;
        if !job.enabled {
            let now = self.inner.clock.now();
            job.enabled = true;
            job.next_run_at = trigger::on_resume(&job.trigger, now);
            job.updated_at = now;
            self.save_job(&job).await?;
            info!(job_id = %id, name = %job.name, next_run_at = ?job.next_run_at, "job resumed");
        }
        Ok(job)
    }

    pub async fn rename_job(&self, id: &JobId, new_name: &str) -> Result<Job> {
        let new_name = new_name.trim();
        if new_name.is_empty() {
            return Err(SchedulerError::InvalidParams("job name must not be empty".to_string()));
        }
        let _state = self.inner.state.lock().await;
        let mut job = self.inner.jobs.load(id)?;
        if job.name == new_name {
            return Ok(job);
        }
        if let Some(other) = self.inner.jobs.find_by_name(new_name)? {
            if other.id != job.id {
                return Err(SchedulerError::DuplicateJobName {
                    name: new_name.to_string(),
                });
            }
        }
        let old = std::mem::replace(&mut job.name, new_name.to_string());
        job.updated_at = self.inner.clock.now();
        self.save_job(&job).await?;
        info!(job_id = %id, %old, new = %job.name, "job renamed");
        Ok(job)
    }

    /// Run a job immediately, outside its trigger timeline.
    ///
    /// Fails with `AlreadyRunning` if the job has a run in progress. Waits
    /// for a free worker if the pool is saturated. `next_run_at` is left
    /// untouched.
    pub async fn trigger_now(&self, id: &JobId) -> Result<RunId> {
        let root = self.root_token();
        if root.is_cancelled() {
            return Err(SchedulerError::ShuttingDown);
        }

        let (job, task, cancel, seq) = {
            let _state = self.inner.state.lock().await;
            let job = self.inner.jobs.load(id)?;
            let task = self.inner.registry.resolve(&job.task_type)?;
            let cancel = root.child_token();
            let seq = self
                .try_lock_job(id, cancel.clone())
                .ok_or_else(|| SchedulerError::AlreadyRunning { id: id.to_string() })?;
            (job, task, cancel, seq)
        };

        let permit = tokio::select! {
            p = Arc::clone(&self.inner.pool).acquire_owned() => p.ok(),
            _ = cancel.cancelled() => None,
        };
        let Some(permit) = permit else {
            self.release(id, seq);
            return Err(if root.is_cancelled() {
                SchedulerError::ShuttingDown
            } else {
                SchedulerError::NotFound { id: id.to_string() }
            });
        };

        let run = {
            let _state = self.inner.state.lock().await;
            // Removed or stopped while waiting for a worker.
            if cancel.is_cancelled() {
                self.release(id, seq);
                return Err(if root.is_cancelled() {
                    SchedulerError::ShuttingDown
                } else {
                    SchedulerError::NotFound { id: id.to_string() }
                });
            }
            let now = self.inner.clock.now();
            let run = Run::start(&job, 1, RunOrigin::Manual, now, now);
            if let Err(e) = self.store("append run", || self.inner.history.append(&run)).await {
                self.release(id, seq);
                return Err(e.into());
            }
            run
        };
        info!(job_id = %job.id, name = %job.name, run_id = %run.id, "manual run dispatched");
        let run_id = run.id.clone();
        self.spawn_worker(job, task, run, permit, cancel, seq);
        Ok(run_id)
    }

    // --- queries -------------------------------------------------------------

    pub fn list_jobs(&self) -> Result<Vec<Job>> {
        Ok(self.inner.jobs.list_all()?)
    }

    pub fn get_job(&self, id: &JobId) -> Result<Job> {
        Ok(self.inner.jobs.load(id)?)
    }

    pub fn get_job_by_name(&self, name: &str) -> Result<Job> {
        self.inner
            .jobs
            .find_by_name(name.trim())?
            .ok_or_else(|| SchedulerError::NotFound {
                id: name.to_string(),
            })
    }

    pub fn history(&self, query: &RunQuery) -> Result<Vec<Run>> {
        Ok(self.inner.history.query(query)?)
    }

    pub fn run(&self, id: &RunId) -> Result<Run> {
        Ok(self.inner.history.get(id)?)
    }

    pub fn stats(&self, job_id: Option<&JobId>) -> Result<RunStats> {
        Ok(self.inner.history.stats(job_id)?)
    }

    /// Delete finished runs that started before `older_than`.
    pub fn prune_history(&self, older_than: DateTime<Utc>) -> Result<usize> {
        Ok(self.inner.history.prune(older_than)?)
    }

    /// Prune with the configured retention window.
    pub fn prune_expired(&self) -> Result<usize> {
        let retention = chrono::Duration::days(self.inner.config.history_retention_days as i64);
        let cutoff = self
            .inner
            .clock
            .now()
            .checked_sub_signed(retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.prune_history(cutoff)
    }

    pub fn status(&self) -> Result<SchedulerStatus> {
        let jobs = self.inner.jobs.list_all()?;
        let next = jobs
            .iter()
            .filter(|j| j.enabled && j.invalid_reason.is_none())
            .filter_map(|j| j.next_run_at.map(|t| (t, j)))
            .min_by_key(|(t, _)| *t);
        let running = self
            .inner
            .lifecycle
            .lock()
            .expect("scheduler lifecycle poisoned")
            .running;
        Ok(SchedulerStatus {
            running,
            total_jobs: jobs.len(),
            enabled_jobs: jobs.iter().filter(|j| j.enabled).count(),
            in_flight: self.inner.active.len(),
            max_concurrent: self.inner.config.max_concurrent.max(1),
            next_job: next.map(|(_, j)| j.name.clone()),
            next_run_at: next.map(|(t, _)| t),
        })
    }

    /// Jobs that currently hold their exclusivity slot.
    pub fn running_jobs(&self) -> Vec<JobId> {
        self.inner.active.iter().map(|e| e.key().clone()).collect()
    }

    /// Wait until no job is in flight. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let mut rx = self.inner.in_flight.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|n| *n == 0))
            .await
            .is_ok_and(|r| r.is_ok())
    }

    // --- lifecycle -----------------------------------------------------------

    /// Close out runs left `Running` by a previous process, then start the
    /// tick loop.
    pub async fn start(&self) -> Result<()> {
        let root = self.begin_start()?;
        if let Err(e) = self.recover().await {
            self.inner
                .lifecycle
                .lock()
                .expect("scheduler lifecycle poisoned")
                .running = false;
            return Err(e);
        }

        let this = self.clone();
        let handle = tokio::spawn(async move { this.tick_loop(root).await });
        self.inner
            .lifecycle
            .lock()
            .expect("scheduler lifecycle poisoned")
            .tick_loop = Some(handle);
        info!(
            max_concurrent = self.inner.config.max_concurrent,
            tick_interval_ms = self.inner.config.tick_interval_ms,
            "scheduler started"
        );
        Ok(())
    }

    /// Stop the tick loop and drain in-flight runs.
    ///
    /// Running tasks are asked to cancel. Whatever has not finished when
    /// `timeout` (default: `drain_timeout_secs`) elapses is recorded as
    /// `Cancelled` and its worker abandoned, so no run stays `Running`.
    /// May be called from any task.
    pub async fn stop(&self, timeout: Option<Duration>) -> Result<StopReport> {
        let tick_loop = self.begin_stop()?;
        info!("scheduler stopping");
        if let Some(handle) = tick_loop {
            let _ = handle.await;
        }

        let timeout =
            timeout.unwrap_or_else(|| Duration::from_secs(self.inner.config.drain_timeout_secs));
        let in_flight = self.inner.active.len();
        if self.wait_idle(timeout).await {
            info!(drained = in_flight, "scheduler stopped");
            return Ok(StopReport {
                drained: in_flight,
                abandoned: 0,
            });
        }

        let _state = self.inner.state.lock().await;
        let aborted = self.abort_all();
        let now = self.inner.clock.now();
        let stuck = self
            .store("list running runs", || self.inner.history.running())
            .await?;
        let mut abandoned = 0;
        for run in stuck.into_iter().filter(|r| aborted.contains(&r.job_id)) {
            let result = TaskResult::cancelled("cancelled: scheduler stopped before the run finished")
                .stamped(run.started_at, now);
            if self.close_out(&run, result).await {
                abandoned += 1;
            }
        }
        warn!(
            abandoned,
            timeout_ms = timeout.as_millis() as u64,
            "drain timeout elapsed; in-flight runs marked cancelled"
        );
        Ok(StopReport {
            drained: in_flight.saturating_sub(aborted.len()),
            abandoned,
        })
    }

    /// Evaluate every due job once.
    ///
    /// The background loop calls this on each tick; embedders driving a
    /// manual clock may call it directly.
    pub async fn tick(&self) -> Result<TickReport> {
        let root = self.root_token();
        if root.is_cancelled() {
            return Err(SchedulerError::ShuttingDown);
        }
        let _state = self.inner.state.lock().await;
        let now = self.inner.clock.now();
        let due = self
            .store("list due jobs", || self.inner.jobs.list_due(now))
            .await?;

        let mut report = TickReport {
            due: due.len(),
            ..Default::default()
        };
        for job in due {
            match self.evaluate(job, now, &root).await {
                Evaluation::Dispatched => report.dispatched += 1,
                Evaluation::Misfired => report.misfired += 1,
                Evaluation::Deferred => report.deferred += 1,
                Evaluation::Invalid => report.invalid += 1,
                Evaluation::Failed => {}
            }
        }
        Ok(report)
    }

    // --- internals -----------------------------------------------------------

    async fn tick_loop(self, root: CancellationToken) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.inner.config.tick_interval_ms.max(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(r) if r.due > 0 => debug!(
                            due = r.due,
                            dispatched = r.dispatched,
                            misfired = r.misfired,
                            deferred = r.deferred,
                            "tick"
                        ),
                        Ok(_) => {}
                        Err(SchedulerError::ShuttingDown) => break,
                        Err(e) => error!("scheduler tick error: {e}"),
                    }
                }
                _ = root.cancelled() => break,
            }
        }
        info!("scheduler tick loop stopped");
    }

    async fn evaluate(&self, mut job: Job, now: DateTime<Utc>, root: &CancellationToken) -> Evaluation {
        let Some(scheduled) = job.next_run_at else {
            return Evaluation::Deferred;
        };

        let task = match self.inner.registry.resolve(&job.task_type) {
            Ok(task) => task,
            Err(e) => {
                self.mark_invalid(&mut job, e.to_string(), now).await;
                return Evaluation::Invalid;
            }
        };
        if job.invalid_reason.take().is_some() {
            info!(job_id = %job.id, task_type = %job.task_type, "task type resolves again; job is valid");
            job.updated_at = now;
            if self.save_job(&job).await.is_err() {
                return Evaluation::Failed;
            }
        }

        let grace_secs = job
            .misfire_grace_secs
            .unwrap_or(self.inner.config.misfire_grace_secs);
        if now - scheduled > trigger::grace_window(grace_secs) {
            self.record_misfire(job, scheduled, now).await;
            return Evaluation::Misfired;
        }

        let Ok(permit) = Arc::clone(&self.inner.pool).try_acquire_owned() else {
            debug!(job_id = %job.id, "worker pool saturated; job stays due");
            return Evaluation::Deferred;
        };
        let cancel = root.child_token();
        let Some(seq) = self.try_lock_job(&job.id, cancel.clone()) else {
            debug!(job_id = %job.id, "previous run still in progress; job stays due");
            return Evaluation::Deferred;
        };

        // The fire is consumed once the advanced due time is stored. Until
        // then no run row exists and the job stays due for the next tick.
        job.next_run_at = trigger::advance(&job.trigger, scheduled, now);
        job.updated_at = now;
        if self.save_job(&job).await.is_err() {
            self.release(&job.id, seq);
            return Evaluation::Failed;
        }

        let run = Run::start(&job, 1, RunOrigin::Scheduled, scheduled, now);
        if self
            .store("append run", || self.inner.history.append(&run))
            .await
            .is_err()
        {
            error!(job_id = %job.id, trigger_time = %scheduled, "run row not written; fire dropped");
            self.release(&job.id, seq);
            return Evaluation::Failed;
        }

        info!(
            job_id = %job.id,
            name = %job.name,
            run_id = %run.id,
            trigger_time = %scheduled,
            next_run_at = ?job.next_run_at,
            "run dispatched"
        );
        self.spawn_worker(job, task, run, permit, cancel, seq);
        Evaluation::Dispatched
    }

    async fn record_misfire(&self, mut job: Job, scheduled: DateTime<Utc>, now: DateTime<Utc>) {
        let late = now - scheduled;
        warn!(
            job_id = %job.id,
            name = %job.name,
            scheduled = %scheduled,
            late_secs = late.num_seconds(),
            "fire missed its grace window; skipped"
        );
        let result = TaskResult::skipped(MISFIRE_REASON)
            .with_data("scheduled_for", scheduled.to_rfc3339())
            .with_data("late_by_secs", late.num_seconds())
            .stamped(now, now);
        let run = Run::finalized(&job, 1, RunOrigin::Misfire, scheduled, result);

        job.next_run_at = trigger::advance(&job.trigger, scheduled, now);
        job.last_status = Some(TaskStatus::Skipped);
        job.updated_at = now;
        if self.save_job(&job).await.is_err() {
            return;
        }

        let appended = self
            .store("append misfire run", || self.inner.history.append(&run))
            .await
            .is_ok();
        if appended {
            if let Some(event) = RunEvent::from_run(run, false) {
                self.inner.observers.emit(event);
            }
        }
    }

    async fn mark_invalid(&self, job: &mut Job, reason: String, now: DateTime<Utc>) {
        if job.invalid_reason.as_deref() == Some(reason.as_str()) {
            debug!(job_id = %job.id, "invalid job skipped");
            return;
        }
        error!(
            job_id = %job.id,
            name = %job.name,
            task_type = %job.task_type,
            %reason,
            "job is invalid and will be skipped until its task type resolves"
        );
        job.invalid_reason = Some(reason);
        job.updated_at = now;
        let _ = self.save_job(job).await;
    }

    fn spawn_worker(
        &self,
        job: Job,
        task: Arc<dyn Task>,
        run: Run,
        permit: OwnedSemaphorePermit,
        cancel: CancellationToken,
        seq: u64,
    ) {
        let id = job.id.clone();
        let this = self.clone();
        let handle = tokio::spawn(async move {
            this.run_fire(job, task, run, permit, cancel, seq).await;
        });
        if let Some(mut active) = self.inner.active.get_mut(&id) {
            if active.seq == seq {
                active.abort = Some(handle.abort_handle());
            }
        }
    }

    /// Execute one fire: the first attempt plus any retries. Holds the job's
    /// exclusivity slot throughout; the worker slot is given back while
    /// waiting out a retry delay.
    async fn run_fire(
        self,
        job: Job,
        mut task: Arc<dyn Task>,
        mut run: Run,
        permit: OwnedSemaphorePermit,
        cancel: CancellationToken,
        seq: u64,
    ) {
        let policy = retry::effective_policy(&job, &self.inner.config);
        let opts = ExecOptions {
            timeout: job.timeout(),
            kill_grace: Duration::from_millis(self.inner.config.kill_grace_ms),
        };
        let mut permit = Some(permit);

        loop {
            let ctx = TaskContext::new(
                job.id.clone(),
                job.name.clone(),
                run.id.clone(),
                run.attempt_number,
                run.trigger_time,
                job.params.clone(),
                cancel.clone(),
            );
            let result = run_guarded(Arc::clone(&task), ctx, opts, self.inner.clock.as_ref()).await;
            drop(permit.take());

            let delay = if cancel.is_cancelled() {
                None
            } else {
                retry::next_delay(&policy, result.status, run.attempt_number)
            };
            self.finalize(&run, result, delay.is_some()).await;

            let Some(delay) = delay else { break };
            warn!(
                job_id = %job.id,
                attempt = run.attempt_number,
                delay_ms = delay.as_millis() as u64,
                "attempt failed; retry scheduled"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    info!(job_id = %job.id, "pending retry abandoned");
                    break;
                }
            }

            let acquired = tokio::select! {
                p = Arc::clone(&self.inner.pool).acquire_owned() => p.ok(),
                _ = cancel.cancelled() => None,
            };
            let Some(p) = acquired else { break };
            permit = Some(p);

            task = match self.inner.registry.resolve(&job.task_type) {
                Ok(t) => t,
                Err(e) => {
                    error!(job_id = %job.id, "retry abandoned: {e}");
                    break;
                }
            };
            let next = {
                let _state = self.inner.state.lock().await;
                // The job may have been removed while the retry waited for a worker.
                if cancel.is_cancelled() {
                    info!(job_id = %job.id, "pending retry abandoned");
                    break;
                }
                let next = Run::start(
                    &job,
                    run.attempt_number + 1,
                    RunOrigin::Retry,
                    run.trigger_time,
                    self.inner.clock.now(),
                );
                if self
                    .store("append retry run", || self.inner.history.append(&next))
                    .await
                    .is_err()
                {
                    break;
                }
                next
            };
            run = next;
        }

        self.release(&job.id, seq);
    }

    /// Record a finished attempt: close the run row, fold the result into
    /// the job's counters, notify observers.
    async fn finalize(&self, run: &Run, result: TaskResult, will_retry: bool) {
        let finished = match self
            .store("finish run", || self.inner.history.finish(&run.id, &result))
            .await
        {
            Ok(r) => r,
            Err(StoreError::RunFinalized { .. }) => {
                debug!(run_id = %run.id, "run already closed out; late result discarded");
                return;
            }
            Err(StoreError::RunNotFound { .. }) => {
                debug!(run_id = %run.id, "run removed together with its job");
                return;
            }
            Err(_) => return,
        };

        {
            let _state = self.inner.state.lock().await;
            self.apply_to_job(&run.job_id, &result).await;
        }

        info!(
            job_id = %run.job_id,
            run_id = %run.id,
            attempt = run.attempt_number,
            status = %result.status,
            duration = %result.duration_display(),
            "run finished"
        );
        if let Some(event) = RunEvent::from_run(finished, will_retry) {
            self.inner.observers.emit(event);
        }
    }

    /// Finalize a run on behalf of a worker that is gone. Caller holds the
    /// state lock.
    async fn close_out(&self, run: &Run, result: TaskResult) -> bool {
        match self
            .store("close out run", || self.inner.history.finish(&run.id, &result))
            .await
        {
            Ok(finished) => {
                self.apply_to_job(&run.job_id, &result).await;
                if let Some(event) = RunEvent::from_run(finished, false) {
                    self.inner.observers.emit(event);
                }
                true
            }
            Err(StoreError::RunFinalized { .. }) => false,
            Err(e) => {
                error!(run_id = %run.id, "failed to close out run: {e}");
                false
            }
        }
    }

    /// Caller holds the state lock.
    async fn apply_to_job(&self, job_id: &JobId, result: &TaskResult) {
        match self.store("load job", || self.inner.jobs.find(job_id)).await {
            Ok(Some(mut job)) => {
                job.record_result(result);
                job.updated_at = self.inner.clock.now();
                let _ = self.save_job(&job).await;
            }
            Ok(None) => debug!(job_id = %job_id, "job removed before its run finished"),
            Err(_) => {}
        }
    }

    async fn recover(&self) -> Result<usize> {
        let _state = self.inner.state.lock().await;
        let stuck = self
            .store("list running runs", || self.inner.history.running())
            .await?;
        let now = self.inner.clock.now();
        let mut closed = 0;
        for run in stuck {
            if self.inner.active.contains_key(&run.job_id) {
                continue;
            }
            let result = TaskResult::cancelled("interrupted: the process exited before the run finished")
                .with_data("recovered", true)
                .stamped(run.started_at, now);
            if self.close_out(&run, result).await {
                closed += 1;
            }
        }
        if closed > 0 {
            warn!(count = closed, "closed out runs left running by a previous process");
        }
        Ok(closed)
    }

    async fn save_job(&self, job: &Job) -> std::result::Result<(), StoreError> {
        self.store("save job", || self.inner.jobs.save(job)).await
    }

    /// Run a store operation, retrying I/O failures a bounded number of
    /// times. Exhausted retries are logged at error level.
    async fn store<T, F>(&self, op: &'static str, mut f: F) -> std::result::Result<T, StoreError>
    where
        F: FnMut() -> std::result::Result<T, StoreError>,
    {
        let attempts = self.inner.config.store_retry_attempts;
        let backoff = Duration::from_millis(self.inner.config.store_retry_backoff_ms);
        let mut attempt = 0u32;
        loop {
            match f() {
                Ok(v) => return Ok(v),
                Err(e) if e.is_io() && attempt < attempts => {
                    attempt += 1;
                    warn!(op, attempt, "store operation failed, retrying: {e}");
                    tokio::time::sleep(backoff * attempt).await;
                }
                Err(e) => {
                    if is_fault(&e) {
                        error!(op, attempts = attempt + 1, "store operation failed: {e}");
                    }
                    return Err(e);
                }
            }
        }
    }

    fn root_token(&self) -> CancellationToken {
        self.inner
            .lifecycle
            .lock()
            .expect("scheduler lifecycle poisoned")
            .root
            .clone()
    }

    fn begin_start(&self) -> Result<CancellationToken> {
        let mut lc = self.inner.lifecycle.lock().expect("scheduler lifecycle poisoned");
        if lc.running {
            return Err(SchedulerError::AlreadyStarted);
        }
        if lc.root.is_cancelled() {
            lc.root = CancellationToken::new();
        }
        lc.running = true;
        Ok(lc.root.clone())
    }

    fn begin_stop(&self) -> Result<Option<JoinHandle<()>>> {
        let mut lc = self.inner.lifecycle.lock().expect("scheduler lifecycle poisoned");
        if lc.root.is_cancelled() {
            return Err(SchedulerError::NotRunning);
        }
        lc.root.cancel();
        lc.running = false;
        Ok(lc.tick_loop.take())
    }

    /// Claim the job's exclusivity slot. `None` if it is taken.
    fn try_lock_job(&self, id: &JobId, cancel: CancellationToken) -> Option<u64> {
        let seq = match self.inner.active.entry(id.clone()) {
            Entry::Occupied(_) => return None,
            Entry::Vacant(slot) => {
                let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
                slot.insert(ActiveRun {
                    seq,
                    cancel,
                    abort: None,
                });
                seq
            }
        };
        self.publish_in_flight();
        Some(seq)
    }

    fn release(&self, id: &JobId, seq: u64) {
        self.inner.active.remove_if(id, |_, a| a.seq == seq);
        self.publish_in_flight();
    }

    fn cancel_active(&self, id: &JobId) {
        if let Some(active) = self.inner.active.get(id) {
            active.cancel.cancel();
        }
    }

    /// Abort every worker and free all slots. Returns the affected jobs.
    fn abort_all(&self) -> Vec<JobId> {
        let ids: Vec<JobId> = self.inner.active.iter().map(|e| e.key().clone()).collect();
        let mut aborted = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some((id, active)) = self.inner.active.remove(&id) {
                active.cancel.cancel();
                if let Some(handle) = active.abort {
                    handle.abort();
                }
                aborted.push(id);
            }
        }
        self.publish_in_flight();
        aborted
    }

    fn publish_in_flight(&self) {
        self.inner.in_flight.send_replace(self.inner.active.len());
    }
}

/// Persistence failures, as opposed to lookups and state checks the caller
/// handles itself.
fn is_fault(e: &StoreError) -> bool {
    !matches!(
        e,
        StoreError::JobNotFound { .. }
            | StoreError::RunNotFound { .. }
            | StoreError::RunFinalized { .. }
            | StoreError::DuplicateJobName { .. }
    )
}
