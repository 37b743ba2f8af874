use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use autotask_core::{AutotaskConfig, JobId};
use autotask_hooks::{ObserverDefinition, RunEvent, RunEventKind, RunObserver};
use autotask_scheduler::{JobOptions, Scheduler, SchedulerError};
use autotask_store::{open_connection, Backoff, Job, JobStore, RetryPolicy, Run, RunHistory, RunQuery, RunStatus, Trigger};
use autotask_task::TaskParams;
use chrono::{DateTime, Utc};
use clap::Parser;
use tracing::{debug, info, warn};

mod cli;
mod tasks;

use crate::cli::{AddArgs, BackoffArg, Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "autotask=info,autotask_scheduler=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // explicit --config > AUTOTASK_CONFIG > ~/.autotask/autotask.toml
    let config = AutotaskConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        AutotaskConfig::default()
    });

    let db_path = cli.db.clone().unwrap_or_else(|| config.database.path.clone());
    debug!(path = %db_path, "opening SQLite database");
    // one connection per store
    let jobs = JobStore::new(open_connection(&db_path)?)?;
    let history = RunHistory::new(open_connection(&db_path)?)?;
    let registry = Arc::new(tasks::builtin_registry()?);

    let scheduler = Scheduler::builder(jobs, history, registry)
        .config(config.scheduler.clone())
        .build();

    match cli.command {
        Command::Serve => serve(scheduler).await,
        Command::Add(args) => add(&scheduler, args).await,
        Command::List { json } => {
            let jobs = scheduler.list_jobs()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&jobs)?);
            } else {
                print_jobs(&jobs);
            }
            Ok(())
        }
        Command::Show { job } => {
            let job = find_job(&scheduler, &job)?;
            println!("{}", serde_json::to_string_pretty(&job)?);
            Ok(())
        }
        Command::Remove { job } => {
            let job = find_job(&scheduler, &job)?;
            scheduler.remove_job(&job.id).await?;
            println!("removed {} ({})", job.name, job.id);
            Ok(())
        }
        Command::Pause { job } => {
            let job = find_job(&scheduler, &job)?;
            let job = scheduler.pause_job(&job.id).await?;
            println!("paused {}", job.name);
            Ok(())
        }
        Command::Resume { job } => {
            let job = find_job(&scheduler, &job)?;
            let job = scheduler.resume_job(&job.id).await?;
            println!("resumed {}, next run {}", job.name, fmt_time(job.next_run_at));
            Ok(())
        }
        Command::Rename { job, new_name } => {
            let job = find_job(&scheduler, &job)?;
            let renamed = scheduler.rename_job(&job.id, &new_name).await?;
            println!("renamed {} -> {}", job.name, renamed.name);
            Ok(())
        }
        Command::Trigger { job, wait_secs } => trigger_and_wait(&scheduler, &job, wait_secs).await,
        Command::History {
            job,
            status,
            limit,
            json,
        } => {
            let mut query = RunQuery::new().limit(limit);
            if let Some(job) = job {
                query = query.job(&find_job(&scheduler, &job)?.id);
            }
            if let Some(status) = status {
                query = query.status(status.parse::<RunStatus>().map_err(anyhow::Error::msg)?);
            }
            let runs = scheduler.history(&query)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&runs)?);
            } else {
                print_runs(&runs);
            }
            Ok(())
        }
        Command::Stats { job, json } => {
            let job = job.map(|j| find_job(&scheduler, &j)).transpose()?;
            let stats = scheduler.stats(job.as_ref().map(|j| &j.id))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("runs:         {}", stats.total);
                println!("  success:    {}", stats.success);
                println!("  failed:     {}", stats.failed);
                println!("  timed out:  {}", stats.timed_out);
                println!("  cancelled:  {}", stats.cancelled);
                println!("  skipped:    {}", stats.skipped);
                println!("  running:    {}", stats.running);
                println!("success rate: {:.1}%", stats.success_rate);
                if let Some(avg) = stats.avg_duration_ms {
                    println!("avg duration: {avg:.0}ms");
                }
                println!("last run:     {}", fmt_time(stats.last_run_at));
                println!("last failure: {}", fmt_time(stats.last_failure_at));
            }
            Ok(())
        }
        Command::Prune { days } => {
            let days = days.unwrap_or(config.scheduler.history_retention_days);
            let cutoff = Utc::now()
                .checked_sub_signed(chrono::Duration::days(days as i64))
                .unwrap_or(DateTime::<Utc>::MIN_UTC);
            let deleted = scheduler.prune_history(cutoff)?;
            println!("deleted {deleted} runs older than {days} days");
            Ok(())
        }
        Command::Status { json } => {
            let status = scheduler.status()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("jobs:     {} ({} enabled)", status.total_jobs, status.enabled_jobs);
                println!("workers:  {}", status.max_concurrent);
                match (status.next_job, status.next_run_at) {
                    (Some(name), Some(at)) => println!("next:     {name} at {}", fmt_time(Some(at))),
                    _ => println!("next:     -"),
                }
            }
            Ok(())
        }
        Command::Tasks => {
            let registry = scheduler.registry();
            for task_type in registry.task_types() {
                let description = registry
                    .resolve(&task_type)
                    .map(|t| t.description().to_string())
                    .unwrap_or_default();
                println!("{task_type:<12} {description}");
            }
            Ok(())
        }
    }
}

async fn serve(scheduler: Scheduler) -> anyhow::Result<()> {
    scheduler.observers().register(
        ObserverDefinition::new("failure-log", Arc::new(FailureLog))
            .for_events([RunEventKind::Failed, RunEventKind::TimedOut]),
    );

    match scheduler.prune_expired() {
        Ok(0) => {}
        Ok(n) => info!(deleted = n, "expired run history pruned"),
        Err(e) => warn!("history prune failed: {e}"),
    }

    scheduler.start().await?;
    let status = scheduler.status()?;
    info!(
        jobs = status.total_jobs,
        enabled = status.enabled_jobs,
        next = ?status.next_job,
        "autotask running, Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, stopping");
    let report = scheduler.stop(None).await?;
    info!(
        drained = report.drained,
        abandoned = report.abandoned,
        "shutdown complete"
    );
    Ok(())
}

async fn add(scheduler: &Scheduler, args: AddArgs) -> anyhow::Result<()> {
    let trigger = parse_trigger(&args)?;
    let params: TaskParams = serde_json::from_str(&args.params)
        .with_context(|| format!("--params is not a JSON object: {}", args.params))?;
    let retry = args.retries.map(|max_retries| RetryPolicy {
        max_retries,
        delay_ms: args.retry_delay_ms,
        backoff: match args.backoff {
            BackoffArg::Fixed => Backoff::Fixed,
            BackoffArg::Linear => Backoff::Linear,
            BackoffArg::Exponential => Backoff::Exponential {
                max_delay_ms: args.max_retry_delay_ms,
            },
        },
    });
    let options = JobOptions {
        description: args.description,
        tags: args.tags,
        timeout: args.timeout.map(Duration::from_secs),
        retry,
        misfire_grace: args.grace.map(Duration::from_secs),
        paused: args.paused,
    };

    let id = scheduler
        .add_job(&args.name, &args.task, trigger, params, options)
        .await?;
    let job = scheduler.get_job(&id)?;
    println!(
        "added {} ({}), {}, next run {}",
        job.name,
        job.id,
        job.trigger,
        fmt_time(job.next_run_at)
    );
    Ok(())
}

async fn trigger_and_wait(scheduler: &Scheduler, key: &str, wait_secs: u64) -> anyhow::Result<()> {
    let job = find_job(scheduler, key)?;
    let run_id = scheduler.trigger_now(&job.id).await?;
    info!(job = %job.name, run_id = %run_id, "run started");

    if !scheduler.wait_idle(Duration::from_secs(wait_secs)).await {
        scheduler.stop(Some(Duration::from_secs(5))).await?;
        bail!("{} did not finish within {wait_secs}s and was cancelled", job.name);
    }

    // The newest row is the fire's last attempt.
    let runs = scheduler.history(&RunQuery::new().job(&job.id).limit(1))?;
    let Some(run) = runs.first() else {
        bail!("run {run_id} has no history");
    };
    print_runs(&runs);
    if let Some(stdout) = run
        .result
        .as_ref()
        .and_then(|r| r.data.get("stdout"))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
    {
        println!("{stdout}");
    }
    if run.status != RunStatus::Success {
        bail!("{} finished {}: {}", job.name, run.status, run.message());
    }
    Ok(())
}

/// Look a job up by id, falling back to its name.
fn find_job(scheduler: &Scheduler, key: &str) -> anyhow::Result<Job> {
    match scheduler.get_job(&JobId::from(key)) {
        Ok(job) => Ok(job),
        Err(SchedulerError::NotFound { .. }) => scheduler
            .get_job_by_name(key)
            .with_context(|| format!("no job with id or name '{key}'")),
        Err(e) => Err(e.into()),
    }
}

fn parse_trigger(args: &AddArgs) -> anyhow::Result<Trigger> {
    if let Some(every_secs) = args.every {
        return Ok(Trigger::Interval { every_secs });
    }
    if let Some(expression) = &args.cron {
        return Ok(Trigger::Cron {
            expression: expression.clone(),
        });
    }
    if let Some(at) = &args.at {
        let at = DateTime::parse_from_rfc3339(at)
            .with_context(|| format!("--at '{at}' is not an RFC 3339 timestamp"))?
            .with_timezone(&Utc);
        return Ok(Trigger::OneOff { at });
    }
    if let Some(daily) = &args.daily {
        let (h, m) = daily
            .split_once(':')
            .with_context(|| format!("--daily '{daily}' is not HH:MM"))?;
        return Ok(Trigger::Daily {
            hour: h.parse().with_context(|| format!("bad hour in '{daily}'"))?,
            minute: m.parse().with_context(|| format!("bad minute in '{daily}'"))?,
        });
    }
    bail!("one of --every, --cron, --at or --daily is required")
}

fn fmt_time(t: Option<DateTime<Utc>>) -> String {
    t.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn print_jobs(jobs: &[Job]) {
    if jobs.is_empty() {
        println!("no jobs");
        return;
    }
    println!(
        "{:<36}  {:<20}  {:<9}  {:<26}  {:<19}  LAST",
        "ID", "NAME", "STATE", "TRIGGER", "NEXT RUN"
    );
    for job in jobs {
        let last = job
            .last_status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<36}  {:<20}  {:<9}  {:<26}  {:<19}  {}",
            job.id,
            job.name,
            job.state(),
            job.trigger.to_string(),
            fmt_time(job.next_run_at),
            last
        );
    }
}

fn print_runs(runs: &[Run]) {
    if runs.is_empty() {
        println!("no runs");
        return;
    }
    println!(
        "{:<19}  {:<20}  {:>3}  {:<9}  {:<10}  {:>9}  MESSAGE",
        "STARTED", "JOB", "#", "ORIGIN", "STATUS", "DURATION"
    );
    for run in runs {
        let duration = run
            .result
            .as_ref()
            .map(|r| r.duration_display())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<19}  {:<20}  {:>3}  {:<9}  {:<10}  {:>9}  {}",
            fmt_time(Some(run.started_at)),
            run.job_name,
            run.attempt_number,
            run.origin.to_string(),
            run.status.to_string(),
            duration,
            run.message()
        );
    }
}

/// Logs runs that failed for good.
struct FailureLog;

#[async_trait]
impl RunObserver for FailureLog {
    async fn on_run(&self, event: &RunEvent) -> autotask_hooks::Result<()> {
        if !event.will_retry {
            warn!(
                job = %event.job_name,
                run_id = %event.run.id,
                attempt = event.run.attempt_number,
                status = %event.run.status,
                "job failed: {}",
                event.run.message()
            );
        }
        Ok(())
    }
}
