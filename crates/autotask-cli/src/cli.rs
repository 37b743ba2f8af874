use clap::{ArgGroup, Args, Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "autotask", about = "Persistent task scheduler", version)]
pub struct Cli {
    /// Config file (default: $AUTOTASK_CONFIG, then ~/.autotask/autotask.toml).
    #[arg(long, global = true)]
    pub config: Option<String>,
    /// SQLite database path; overrides `database.path` from the config.
    #[arg(long, global = true)]
    pub db: Option<String>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the scheduler until interrupted (Ctrl-C).
    Serve,
    /// Add a job.
    Add(AddArgs),
    /// List jobs.
    List {
        #[arg(long)]
        json: bool,
    },
    /// Show one job in detail.
    Show {
        /// Job id or name.
        job: String,
    },
    /// Delete a job and its run history.
    Remove { job: String },
    /// Stop evaluating a job's trigger.
    Pause { job: String },
    /// Re-enable a paused job. Missed fires are not replayed.
    Resume { job: String },
    /// Give a job a new unique name.
    Rename { job: String, new_name: String },
    /// Run a job now and wait for it (and its retries) to finish.
    Trigger {
        job: String,
        /// Give up waiting after this many seconds and cancel the run.
        #[arg(long, default_value_t = 3600)]
        wait_secs: u64,
    },
    /// Show recent runs, newest first.
    History {
        /// Only runs of this job (id or name).
        #[arg(long)]
        job: Option<String>,
        /// Only runs with this status (running, success, failed, ...).
        #[arg(long)]
        status: Option<String>,
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
    /// Aggregate run statistics.
    Stats {
        #[arg(long)]
        job: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Delete finished runs older than N days.
    Prune {
        /// Defaults to `scheduler.history_retention_days`.
        #[arg(long)]
        days: Option<u32>,
    },
    /// Job counts and the next scheduled fire.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// List the task types jobs can use.
    Tasks,
}

#[derive(Args)]
#[command(group(
    ArgGroup::new("trigger")
        .required(true)
        .args(["every", "cron", "at", "daily"])
))]
pub struct AddArgs {
    /// Unique job name.
    #[arg(short, long)]
    pub name: String,
    /// Task type (see `autotask tasks`).
    #[arg(short, long)]
    pub task: String,
    /// Run every N seconds.
    #[arg(long)]
    pub every: Option<u64>,
    /// 5-field cron expression (UTC).
    #[arg(long)]
    pub cron: Option<String>,
    /// Run once at an RFC 3339 instant.
    #[arg(long)]
    pub at: Option<String>,
    /// Run every day at HH:MM UTC.
    #[arg(long)]
    pub daily: Option<String>,
    /// Task parameters as a JSON object.
    #[arg(short, long, default_value = "{}")]
    pub params: String,
    /// Per-run timeout in seconds.
    #[arg(long)]
    pub timeout: Option<u64>,
    /// Retries after a failed or timed-out attempt.
    #[arg(long)]
    pub retries: Option<u32>,
    #[arg(long, default_value_t = 60_000)]
    pub retry_delay_ms: u64,
    #[arg(long, value_enum, default_value_t = BackoffArg::Fixed)]
    pub backoff: BackoffArg,
    /// Cap for exponential backoff.
    #[arg(long, default_value_t = 3_600_000)]
    pub max_retry_delay_ms: u64,
    /// Seconds a fire may be late before it is skipped as a misfire.
    #[arg(long)]
    pub grace: Option<u64>,
    /// Store the job paused.
    #[arg(long)]
    pub paused: bool,
    #[arg(short, long, default_value = "")]
    pub description: String,
    #[arg(long = "tag")]
    pub tags: Vec<String>,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum BackoffArg {
    Fixed,
    Linear,
    Exponential,
}
