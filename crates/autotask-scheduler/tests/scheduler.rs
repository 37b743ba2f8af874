use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use autotask_core::{ManualClock, SchedulerConfig};
use autotask_hooks::{ChannelObserver, ObserverDefinition, RunEventKind};
use autotask_scheduler::{JobOptions, Scheduler, SchedulerError, MISFIRE_REASON};
use autotask_store::{
    open_connection, JobStore, RetryPolicy, Run, RunHistory, RunOrigin, RunQuery, RunStatus, Trigger,
};
use autotask_task::{
    Result as TaskRunResult, Task, TaskContext, TaskFailure, TaskParams, TaskRegistry, TaskResult, TaskStatus,
};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;

const IDLE: Duration = Duration::from_secs(5);

struct Succeed;

#[async_trait]
impl Task for Succeed {
    fn task_type(&self) -> &str {
        "ok"
    }

    async fn execute(&self, _ctx: &TaskContext) -> TaskRunResult<TaskResult> {
        Ok(TaskResult::success("done"))
    }
}

struct Fail;

#[async_trait]
impl Task for Fail {
    fn task_type(&self) -> &str {
        "fail"
    }

    async fn execute(&self, _ctx: &TaskContext) -> TaskRunResult<TaskResult> {
        Ok(TaskResult::failure("boom", TaskFailure::new("boom", "disk on fire")))
    }
}

/// Fails on the first attempt of a fire, succeeds on retries.
struct Flaky;

#[async_trait]
impl Task for Flaky {
    fn task_type(&self) -> &str {
        "flaky"
    }

    async fn execute(&self, ctx: &TaskContext) -> TaskRunResult<TaskResult> {
        if ctx.attempt < 2 {
            Ok(TaskResult::failure("first try", TaskFailure::new("flaky", "first try")))
        } else {
            Ok(TaskResult::success("second try"))
        }
    }
}

/// Sleeps `ms` (default 300) unless cancelled first.
struct Slow;

#[async_trait]
impl Task for Slow {
    fn task_type(&self) -> &str {
        "slow"
    }

    async fn execute(&self, ctx: &TaskContext) -> TaskRunResult<TaskResult> {
        let ms = ctx.param_u64("ms").unwrap_or(300);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(TaskResult::success("slept")),
            _ = ctx.cancellation_token().cancelled() => Ok(TaskResult::cancelled("woken early")),
        }
    }
}

/// Ignores cancellation.
struct Stubborn;

#[async_trait]
impl Task for Stubborn {
    fn task_type(&self) -> &str {
        "stubborn"
    }

    async fn execute(&self, _ctx: &TaskContext) -> TaskRunResult<TaskResult> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(TaskResult::success("finally"))
    }
}

/// Requires a `path` parameter.
struct NeedsPath;

#[async_trait]
impl Task for NeedsPath {
    fn task_type(&self) -> &str {
        "needs_path"
    }

    fn validate(&self, params: &TaskParams) -> std::result::Result<(), String> {
        match params.get("path").and_then(|v| v.as_str()) {
            Some(p) if !p.is_empty() => Ok(()),
            _ => Err("missing 'path'".to_string()),
        }
    }

    async fn execute(&self, _ctx: &TaskContext) -> TaskRunResult<TaskResult> {
        Ok(TaskResult::success("ok"))
    }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 2, 12, 10, 0, 0).unwrap()
}

fn secs(n: i64) -> chrono::Duration {
    chrono::Duration::seconds(n)
}

fn registry() -> Arc<TaskRegistry> {
    let mut reg = TaskRegistry::new();
    reg.register_fn("ok", || Succeed).unwrap();
    reg.register_fn("fail", || Fail).unwrap();
    reg.register_fn("flaky", || Flaky).unwrap();
    reg.register_fn("slow", || Slow).unwrap();
    reg.register_fn("stubborn", || Stubborn).unwrap();
    reg.register_fn("needs_path", || NeedsPath).unwrap();
    Arc::new(reg)
}

fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        kill_grace_ms: 100,
        store_retry_backoff_ms: 1,
        ..SchedulerConfig::default()
    }
}

fn scheduler_with(clock: &ManualClock, config: SchedulerConfig) -> Scheduler {
    Scheduler::builder(
        JobStore::open_in_memory().unwrap(),
        RunHistory::open_in_memory().unwrap(),
        registry(),
    )
    .config(config)
    .clock(Arc::new(clock.clone()))
    .build()
}

/// A scheduler whose stores share one database file, so several schedulers
/// (or raw connections) can see the same jobs.
fn file_scheduler(path: &Path, clock: &ManualClock, registry: Arc<TaskRegistry>) -> Scheduler {
    Scheduler::builder(
        JobStore::new(open_connection(path).unwrap()).unwrap(),
        RunHistory::new(open_connection(path).unwrap()).unwrap(),
        registry,
    )
    .config(fast_config())
    .clock(Arc::new(clock.clone()))
    .build()
}

fn scheduler(clock: &ManualClock) -> Scheduler {
    scheduler_with(clock, fast_config())
}

fn every(secs: u64) -> Trigger {
    Trigger::Interval { every_secs: secs }
}

fn params(value: serde_json::Value) -> TaskParams {
    value.as_object().cloned().unwrap_or_default()
}

#[tokio::test]
async fn interval_fires_stay_exactly_one_period_apart() {
    let clock = ManualClock::new(t0());
    let s = scheduler(&clock);
    let id = s
        .add_job("heartbeat", "ok", every(60), TaskParams::new(), JobOptions::default())
        .await
        .unwrap();

    let mut prev = s.get_job(&id).unwrap().next_run_at.unwrap();
    assert_eq!(prev, t0() + secs(60));

    for _ in 0..3 {
        // A little late, but within grace.
        clock.set(prev + secs(2));
        let report = s.tick().await.unwrap();
        assert_eq!(report.dispatched, 1);
        assert!(s.wait_idle(IDLE).await);

        let next = s.get_job(&id).unwrap().next_run_at.unwrap();
        assert_eq!(next - prev, secs(60));
        prev = next;
    }

    let job = s.get_job(&id).unwrap();
    assert_eq!(job.run_count, 3);
    assert_eq!(job.success_count, 3);
    assert_eq!(job.last_status, Some(TaskStatus::Success));

    let runs = s.history(&RunQuery::new().job(&id).oldest_first()).unwrap();
    assert_eq!(runs.len(), 3);
    assert!(runs.iter().all(|r| r.status == RunStatus::Success));
    assert!(runs.iter().all(|r| r.origin == RunOrigin::Scheduled));
    assert_eq!(runs[0].trigger_time, t0() + secs(60));
}

#[tokio::test]
async fn cron_job_first_fire_is_next_matching_minute() {
    let clock = ManualClock::new(t0());
    let s = scheduler(&clock);
    let id = s
        .add_job(
            "nightly",
            "ok",
            Trigger::Cron {
                expression: "0 2 * * *".into(),
            },
            TaskParams::new(),
            JobOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(
        s.get_job(&id).unwrap().next_run_at,
        Some(Utc.with_ymd_and_hms(2025, 2, 13, 2, 0, 0).unwrap())
    );
}

#[tokio::test]
async fn failed_fire_is_retried_up_to_max_retries() {
    let clock = ManualClock::new(t0());
    let s = scheduler(&clock);
    let id = s
        .add_job(
            "always-fails",
            "fail",
            every(3600),
            TaskParams::new(),
            JobOptions {
                retry: Some(RetryPolicy::fixed(2, Duration::from_millis(10))),
                ..JobOptions::default()
            },
        )
        .await
        .unwrap();

    s.trigger_now(&id).await.unwrap();
    assert!(s.wait_idle(IDLE).await);

    let runs = s.history(&RunQuery::new().job(&id).oldest_first()).unwrap();
    assert_eq!(runs.len(), 3);
    assert_eq!(
        runs.iter().map(|r| r.attempt_number).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert!(runs.iter().all(|r| r.status == RunStatus::Failed));
    assert_eq!(runs[0].origin, RunOrigin::Manual);
    assert_eq!(runs[1].origin, RunOrigin::Retry);
    // Retries serve the same fire.
    assert!(runs.iter().all(|r| r.trigger_time == runs[0].trigger_time));
    for pair in runs.windows(2) {
        assert!(pair[0].finished_at().unwrap() <= pair[1].started_at);
    }

    let job = s.get_job(&id).unwrap();
    assert_eq!(job.failure_count, 3);
    assert_eq!(job.last_error.as_deref(), Some("disk on fire"));
}

#[tokio::test]
async fn retry_stops_after_first_success() {
    let clock = ManualClock::new(t0());
    let s = scheduler(&clock);
    let id = s
        .add_job(
            "flaky",
            "flaky",
            every(3600),
            TaskParams::new(),
            JobOptions {
                retry: Some(RetryPolicy::fixed(5, Duration::from_millis(5))),
                ..JobOptions::default()
            },
        )
        .await
        .unwrap();

    s.trigger_now(&id).await.unwrap();
    assert!(s.wait_idle(IDLE).await);

    let runs = s.history(&RunQuery::new().job(&id).oldest_first()).unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].status, RunStatus::Failed);
    assert_eq!(runs[1].status, RunStatus::Success);
    assert_eq!(s.get_job(&id).unwrap().last_status, Some(TaskStatus::Success));
}

#[tokio::test]
async fn a_job_never_runs_twice_at_once() {
    let clock = ManualClock::new(t0());
    let s = scheduler(&clock);
    let id = s
        .add_job("slowpoke", "slow", every(60), TaskParams::new(), JobOptions::default())
        .await
        .unwrap();

    s.trigger_now(&id).await.unwrap();
    assert!(matches!(
        s.trigger_now(&id).await,
        Err(SchedulerError::AlreadyRunning { .. })
    ));

    // Due while the manual run is in progress: stays due.
    clock.set(t0() + secs(60));
    let report = s.tick().await.unwrap();
    assert_eq!(report.deferred, 1);
    assert_eq!(report.dispatched, 0);
    assert_eq!(s.running_jobs(), vec![id.clone()]);

    assert!(s.wait_idle(IDLE).await);
    assert_eq!(s.history(&RunQuery::new().job(&id)).unwrap().len(), 1);

    // Next tick picks the deferred fire up.
    let report = s.tick().await.unwrap();
    assert_eq!(report.dispatched, 1);
    assert!(s.wait_idle(IDLE).await);

    let runs = s.history(&RunQuery::new().job(&id).oldest_first()).unwrap();
    assert_eq!(runs.len(), 2);
    assert!(runs[0].finished_at().unwrap() <= runs[1].started_at);
    assert!(s
        .history(&RunQuery::new().status(RunStatus::Running))
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn saturated_pool_defers_instead_of_queueing() {
    let clock = ManualClock::new(t0());
    let s = scheduler_with(
        &clock,
        SchedulerConfig {
            max_concurrent: 1,
            ..fast_config()
        },
    );
    let a = s
        .add_job("a", "slow", every(60), TaskParams::new(), JobOptions::default())
        .await
        .unwrap();
    let b = s
        .add_job("b", "slow", every(60), TaskParams::new(), JobOptions::default())
        .await
        .unwrap();

    clock.set(t0() + secs(60));
    let report = s.tick().await.unwrap();
    assert_eq!(report.due, 2);
    assert_eq!(report.dispatched, 1);
    assert_eq!(report.deferred, 1);
    assert!(s.wait_idle(IDLE).await);

    let report = s.tick().await.unwrap();
    assert_eq!(report.dispatched, 1);
    assert!(s.wait_idle(IDLE).await);

    assert_eq!(s.history(&RunQuery::new().job(&a)).unwrap().len(), 1);
    assert_eq!(s.history(&RunQuery::new().job(&b)).unwrap().len(), 1);
}

#[tokio::test]
async fn late_fire_is_recorded_as_misfire() {
    let clock = ManualClock::new(t0());
    let s = scheduler(&clock);
    let id = s
        .add_job(
            "report",
            "ok",
            every(60),
            TaskParams::new(),
            JobOptions {
                misfire_grace: Some(Duration::from_secs(10)),
                ..JobOptions::default()
            },
        )
        .await
        .unwrap();

    let now = t0() + secs(60 + 300);
    clock.set(now);
    let report = s.tick().await.unwrap();
    assert_eq!(report.misfired, 1);
    assert_eq!(report.dispatched, 0);

    let runs = s.history(&RunQuery::new().job(&id)).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Skipped);
    assert_eq!(runs[0].origin, RunOrigin::Misfire);
    assert_eq!(runs[0].message(), MISFIRE_REASON);
    assert_eq!(runs[0].trigger_time, t0() + secs(60));

    let job = s.get_job(&id).unwrap();
    assert!(job.next_run_at.unwrap() > now);
    assert_eq!(job.last_status, Some(TaskStatus::Skipped));
    assert_eq!(job.success_count, 0);
    assert!(s.running_jobs().is_empty());
}

#[tokio::test]
async fn rejected_jobs_persist_nothing() {
    let clock = ManualClock::new(t0());
    let s = scheduler(&clock);

    let err = s
        .add_job("x", "does-not-exist", every(60), TaskParams::new(), JobOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::UnknownTaskType { .. }));

    let err = s
        .add_job("x", "ok", every(0), TaskParams::new(), JobOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidTrigger(_)));

    let err = s
        .add_job("x", "needs_path", every(60), TaskParams::new(), JobOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidParams(_)));

    let err = s
        .add_job(
            "x",
            "ok",
            Trigger::OneOff { at: t0() - secs(3600) },
            TaskParams::new(),
            JobOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidTrigger(_)));

    assert!(s.list_jobs().unwrap().is_empty());

    s.add_job(
        "x",
        "needs_path",
        every(60),
        params(json!({"path": "/tmp"})),
        JobOptions::default(),
    )
    .await
    .unwrap();
    let err = s
        .add_job("x", "ok", every(60), TaskParams::new(), JobOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::DuplicateJobName { .. }));
    assert_eq!(s.list_jobs().unwrap().len(), 1);
}

#[tokio::test]
async fn out_of_range_interval_or_grace_is_rejected() {
    let clock = ManualClock::new(t0());
    let s = scheduler(&clock);

    let err = s
        .add_job(
            "huge",
            "ok",
            every(10_000_000_000_000),
            TaskParams::new(),
            JobOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidTrigger(_)));

    let err = s
        .add_job(
            "lenient",
            "ok",
            every(60),
            TaskParams::new(),
            JobOptions {
                misfire_grace: Some(Duration::from_secs(u64::MAX / 2)),
                ..JobOptions::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidParams(_)));
    assert!(s.list_jobs().unwrap().is_empty());
}

#[tokio::test]
async fn huge_configured_grace_never_misfires() {
    let clock = ManualClock::new(t0());
    let s = scheduler_with(
        &clock,
        SchedulerConfig {
            misfire_grace_secs: u64::MAX,
            ..fast_config()
        },
    );
    let id = s
        .add_job("patient", "ok", every(60), TaskParams::new(), JobOptions::default())
        .await
        .unwrap();

    let later = t0() + chrono::Duration::days(30);
    clock.set(later);
    let report = s.tick().await.unwrap();
    assert_eq!(report.dispatched, 1);
    assert_eq!(report.misfired, 0);
    assert!(s.wait_idle(IDLE).await);
    assert!(s.get_job(&id).unwrap().next_run_at.unwrap() > later);
}

#[tokio::test]
async fn unresolvable_task_type_marks_job_invalid() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("autotask.db");
    let clock = ManualClock::new(t0());

    let full = file_scheduler(&path, &clock, registry());
    let id = full
        .add_job("legacy", "ok", every(60), TaskParams::new(), JobOptions::default())
        .await
        .unwrap();

    // Same database, but "ok" is no longer registered.
    let mut reduced = TaskRegistry::new();
    reduced.register_fn("fail", || Fail).unwrap();
    let limited = file_scheduler(&path, &clock, Arc::new(reduced));

    clock.set(t0() + secs(60));
    for _ in 0..2 {
        let report = limited.tick().await.unwrap();
        assert_eq!(report.due, 1);
        assert_eq!(report.invalid, 1);
        assert_eq!(report.dispatched, 0);
    }

    let job = limited.get_job(&id).unwrap();
    assert!(job.invalid_reason.is_some());
    assert_eq!(job.next_run_at, Some(t0() + secs(60)));
    assert_eq!(limited.list_jobs().unwrap().len(), 1);
    assert!(limited.history(&RunQuery::new().job(&id)).unwrap().is_empty());

    // Once the type resolves again the mark is cleared and the fire runs.
    let report = full.tick().await.unwrap();
    assert_eq!(report.dispatched, 1);
    assert!(full.wait_idle(IDLE).await);
    let job = full.get_job(&id).unwrap();
    assert_eq!(job.invalid_reason, None);
    let runs = full.history(&RunQuery::new().job(&id)).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Success);
}

#[tokio::test]
async fn unsaved_due_time_keeps_fire_pending_and_other_jobs_run() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("autotask.db");
    let clock = ManualClock::new(t0());
    let s = file_scheduler(&path, &clock, registry());

    let healthy = s
        .add_job("healthy", "ok", every(60), TaskParams::new(), JobOptions::default())
        .await
        .unwrap();
    let broken = s
        .add_job("broken", "ok", every(60), TaskParams::new(), JobOptions::default())
        .await
        .unwrap();

    let raw = open_connection(&path).unwrap();
    raw.execute_batch(
        "CREATE TRIGGER reject_broken BEFORE UPDATE ON jobs WHEN OLD.name = 'broken'
         BEGIN SELECT RAISE(ABORT, 'simulated write failure'); END;",
    )
    .unwrap();

    clock.set(t0() + secs(60));
    let report = s.tick().await.unwrap();
    assert_eq!(report.due, 2);
    assert_eq!(report.dispatched, 1);
    assert!(s.wait_idle(IDLE).await);

    assert_eq!(s.history(&RunQuery::new().job(&healthy)).unwrap().len(), 1);
    assert!(s.history(&RunQuery::new().job(&broken)).unwrap().is_empty());
    assert_eq!(s.get_job(&broken).unwrap().next_run_at, Some(t0() + secs(60)));

    raw.execute_batch("DROP TRIGGER reject_broken;").unwrap();
    let report = s.tick().await.unwrap();
    assert_eq!(report.dispatched, 1);
    assert!(s.wait_idle(IDLE).await);

    let runs = s.history(&RunQuery::new().job(&broken)).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].trigger_time, t0() + secs(60));
    assert_eq!(s.get_job(&broken).unwrap().next_run_at, Some(t0() + secs(120)));
}

#[tokio::test]
async fn resume_does_not_replay_missed_fires() {
    let clock = ManualClock::new(t0());
    let s = scheduler(&clock);
    let id = s
        .add_job("paused", "ok", every(60), TaskParams::new(), JobOptions::default())
        .await
        .unwrap();

    let job = s.pause_job(&id).await.unwrap();
    assert!(!job.enabled);
    assert_eq!(job.state(), "paused");

    clock.set(t0() + secs(600));
    assert_eq!(s.tick().await.unwrap().due, 0);

    let job = s.resume_job(&id).await.unwrap();
    assert!(job.enabled);
    assert_eq!(job.next_run_at, Some(t0() + secs(660)));
    assert_eq!(s.tick().await.unwrap().due, 0);
    assert!(s.history(&RunQuery::new().job(&id)).unwrap().is_empty());

    // Manual runs are allowed while paused.
    s.pause_job(&id).await.unwrap();
    s.trigger_now(&id).await.unwrap();
    assert!(s.wait_idle(IDLE).await);
    assert_eq!(s.history(&RunQuery::new().job(&id)).unwrap().len(), 1);
}

#[tokio::test]
async fn one_off_fires_once_and_completes() {
    let clock = ManualClock::new(t0());
    let s = scheduler(&clock);
    let at = t0() + secs(30);
    let id = s
        .add_job("once", "ok", Trigger::OneOff { at }, TaskParams::new(), JobOptions::default())
        .await
        .unwrap();

    clock.set(at);
    assert_eq!(s.tick().await.unwrap().dispatched, 1);
    assert!(s.wait_idle(IDLE).await);

    let job = s.get_job(&id).unwrap();
    assert_eq!(job.next_run_at, None);
    assert_eq!(job.state(), "completed");

    clock.set(at + secs(3600));
    assert_eq!(s.tick().await.unwrap().due, 0);
}

#[tokio::test]
async fn timeout_is_recorded_as_timed_out() {
    let clock = ManualClock::new(t0());
    let s = scheduler(&clock);
    let id = s
        .add_job(
            "too-slow",
            "slow",
            every(3600),
            params(json!({"ms": 5_000})),
            JobOptions {
                timeout: Some(Duration::from_millis(50)),
                ..JobOptions::default()
            },
        )
        .await
        .unwrap();

    s.trigger_now(&id).await.unwrap();
    assert!(s.wait_idle(IDLE).await);

    let runs = s.history(&RunQuery::new().job(&id)).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::TimedOut);
    assert_eq!(s.get_job(&id).unwrap().failure_count, 1);
}

#[tokio::test]
async fn stop_waits_for_cooperative_runs() {
    let clock = ManualClock::new(t0());
    let s = scheduler(&clock);
    let id = s
        .add_job(
            "long",
            "slow",
            every(3600),
            params(json!({"ms": 10_000})),
            JobOptions::default(),
        )
        .await
        .unwrap();

    s.start().await.unwrap();
    assert!(s.status().unwrap().running);
    assert!(matches!(s.start().await, Err(SchedulerError::AlreadyStarted)));

    let run_id = s.trigger_now(&id).await.unwrap();
    let report = s.stop(Some(Duration::from_secs(5))).await.unwrap();
    assert_eq!(report.drained, 1);
    assert_eq!(report.abandoned, 0);

    let run = s.run(&run_id).unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert!(!s.status().unwrap().running);

    assert!(matches!(s.tick().await, Err(SchedulerError::ShuttingDown)));
    assert!(matches!(s.trigger_now(&id).await, Err(SchedulerError::ShuttingDown)));
    assert!(matches!(s.stop(None).await, Err(SchedulerError::NotRunning)));
}

#[tokio::test]
async fn stop_abandons_runs_that_ignore_cancellation() {
    let clock = ManualClock::new(t0());
    let s = scheduler_with(
        &clock,
        SchedulerConfig {
            kill_grace_ms: 10_000,
            ..fast_config()
        },
    );
    let id = s
        .add_job("stuck", "stubborn", every(3600), TaskParams::new(), JobOptions::default())
        .await
        .unwrap();

    s.start().await.unwrap();
    let run_id = s.trigger_now(&id).await.unwrap();
    let report = s.stop(Some(Duration::from_millis(100))).await.unwrap();
    assert_eq!(report.abandoned, 1);

    let run = s.run(&run_id).unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert!(run.message().contains("scheduler stopped"));
    assert!(s
        .history(&RunQuery::new().status(RunStatus::Running))
        .unwrap()
        .is_empty());
    assert!(s.running_jobs().is_empty());
}

#[tokio::test]
async fn start_closes_out_runs_left_by_a_previous_process() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("autotask.db");
    let clock = ManualClock::new(t0());
    let s = file_scheduler(&path, &clock, registry());

    let id = s
        .add_job("crashed", "ok", every(3600), TaskParams::new(), JobOptions::default())
        .await
        .unwrap();
    let job = s.get_job(&id).unwrap();

    // Another handle on the same file plays the crashed process.
    let previous = RunHistory::new(open_connection(&path).unwrap()).unwrap();
    let stale = Run::start(&job, 1, RunOrigin::Scheduled, t0(), t0());
    previous.append(&stale).unwrap();

    clock.set(t0() + secs(5));
    s.start().await.unwrap();

    let run = s.run(&stale.id).unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert_eq!(run.origin, RunOrigin::Scheduled);
    let result = run.result.unwrap();
    assert_eq!(result.data.get("recovered"), Some(&json!(true)));
    assert_eq!(s.get_job(&id).unwrap().last_status, Some(TaskStatus::Cancelled));

    s.stop(Some(Duration::from_secs(1))).await.unwrap();
}

#[tokio::test]
async fn remove_job_drops_its_history() {
    let clock = ManualClock::new(t0());
    let s = scheduler(&clock);
    let id = s
        .add_job("temp", "ok", every(60), TaskParams::new(), JobOptions::default())
        .await
        .unwrap();
    s.trigger_now(&id).await.unwrap();
    assert!(s.wait_idle(IDLE).await);

    s.remove_job(&id).await.unwrap();
    assert!(matches!(s.get_job(&id), Err(SchedulerError::NotFound { .. })));
    assert!(s.history(&RunQuery::new().job(&id)).unwrap().is_empty());
    assert!(matches!(
        s.remove_job(&id).await,
        Err(SchedulerError::NotFound { .. })
    ));
}

#[tokio::test]
async fn remove_cancels_an_in_flight_run() {
    let clock = ManualClock::new(t0());
    let s = scheduler(&clock);
    let id = s
        .add_job(
            "doomed",
            "slow",
            every(3600),
            params(json!({"ms": 10_000})),
            JobOptions::default(),
        )
        .await
        .unwrap();
    s.trigger_now(&id).await.unwrap();
    s.remove_job(&id).await.unwrap();
    assert!(s.wait_idle(IDLE).await);
    assert!(s.history(&RunQuery::new()).unwrap().is_empty());
}

#[tokio::test]
async fn removing_a_job_abandons_its_pending_retry() {
    let clock = ManualClock::new(t0());
    let s = scheduler(&clock);
    let id = s
        .add_job(
            "doomed",
            "fail",
            every(3600),
            TaskParams::new(),
            JobOptions {
                retry: Some(RetryPolicy::fixed(3, Duration::from_millis(200))),
                ..JobOptions::default()
            },
        )
        .await
        .unwrap();

    s.trigger_now(&id).await.unwrap();
    let failed = RunQuery::new().job(&id).status(RunStatus::Failed);
    for _ in 0..100 {
        if !s.history(&failed).unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(s.history(&failed).unwrap().len(), 1);

    s.remove_job(&id).await.unwrap();
    assert!(s.wait_idle(IDLE).await);
    // Outlive the retry delay: nothing may be written for the removed job.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(s.history(&RunQuery::new()).unwrap().is_empty());
    assert!(s.running_jobs().is_empty());
}

#[tokio::test]
async fn rename_keeps_names_unique() {
    let clock = ManualClock::new(t0());
    let s = scheduler(&clock);
    let a = s
        .add_job("alpha", "ok", every(60), TaskParams::new(), JobOptions::default())
        .await
        .unwrap();
    s.add_job("beta", "ok", every(60), TaskParams::new(), JobOptions::default())
        .await
        .unwrap();

    assert!(matches!(
        s.rename_job(&a, "beta").await,
        Err(SchedulerError::DuplicateJobName { .. })
    ));
    let job = s.rename_job(&a, "gamma").await.unwrap();
    assert_eq!(job.name, "gamma");
    assert_eq!(s.get_job_by_name("gamma").unwrap().id, a);
    assert!(s.get_job_by_name("alpha").is_err());
}

#[tokio::test]
async fn observers_hear_about_finished_runs() {
    let clock = ManualClock::new(t0());
    let s = scheduler(&clock);
    let (observer, mut rx) = ChannelObserver::channel(8);
    s.observers()
        .register(ObserverDefinition::new("test", Arc::new(observer)));

    let id = s
        .add_job("noisy", "ok", every(60), TaskParams::new(), JobOptions::default())
        .await
        .unwrap();
    let run_id = s.trigger_now(&id).await.unwrap();

    let event = tokio::time::timeout(IDLE, rx.recv()).await.unwrap().unwrap();
    assert_eq!(event.kind, RunEventKind::Succeeded);
    assert_eq!(event.job_id, id);
    assert_eq!(event.run.id, run_id);
    assert!(!event.will_retry);
}

#[tokio::test]
async fn status_and_stats_reflect_runs() {
    let clock = ManualClock::new(t0());
    let s = scheduler(&clock);
    let ok = s
        .add_job("soon", "ok", every(60), TaskParams::new(), JobOptions::default())
        .await
        .unwrap();
    let bad = s
        .add_job("later", "fail", every(600), TaskParams::new(), JobOptions::default())
        .await
        .unwrap();

    let status = s.status().unwrap();
    assert_eq!(status.total_jobs, 2);
    assert_eq!(status.enabled_jobs, 2);
    assert_eq!(status.next_job.as_deref(), Some("soon"));
    assert_eq!(status.next_run_at, Some(t0() + secs(60)));

    s.trigger_now(&ok).await.unwrap();
    assert!(s.wait_idle(IDLE).await);
    s.trigger_now(&bad).await.unwrap();
    assert!(s.wait_idle(IDLE).await);

    let all = s.stats(None).unwrap();
    assert_eq!(all.total, 2);
    assert_eq!(all.success, 1);
    assert_eq!(all.failed, 1);
    assert_eq!(s.stats(Some(&ok)).unwrap().success, 1);

    assert_eq!(s.prune_history(t0() + secs(1)).unwrap(), 2);
    assert_eq!(s.stats(None).unwrap().total, 0);
}
