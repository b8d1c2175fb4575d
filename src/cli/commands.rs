//! CLI command definitions for trialforge.
//!
//! Client commands (`submit`, `status`, `list`, `logs`, `queue-stats`) talk to
//! the shared store and queue directly. Service commands (`dispatcher`,
//! `worker`, `scaler`) run until interrupted.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::api::IngressApi;
use crate::capacity::{CapacityController, FleetManager, HttpFleetManager};
use crate::config::FleetConfig;
use crate::lifecycle::{DrainController, HttpMetadataNotice, TerminationNotice};
use crate::metrics::{export_metrics, init_metrics};
use crate::runner::ProcessRunner;
use crate::scheduler::job::{Harness, JobDetail, JobSummary, TrialRef, DEFAULT_TRIALS};
use crate::scheduler::{
    Dispatcher, FailureThresholdPolicy, JobObserver, PoolExit, RedisWorkQueue, WorkQueue,
    WorkerPool,
};
use crate::storage::{ArtifactStore, PgStore, TrialStore};

/// Distributed trial dispatcher and worker pool.
#[derive(Parser)]
#[command(name = "trialforge")]
#[command(about = "Run benchmark tasks N times across a fleet of workers")]
#[command(version)]
#[command(
    long_about = "trialforge fans out trial runs of a task across a horizontally scaled worker fleet.\n\nExample usage:\n  trialforge submit ./tasks/hello-world --model openai/gpt-4o --trials 10\n  trialforge worker\n  trialforge status <JOB_ID>"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// YAML configuration file.
    #[arg(short, long, env = "TRIALFORGE_CONFIG", global = true)]
    pub config: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Validate a task directory and run it N times.
    Submit(SubmitArgs),

    /// Show a job and its trials.
    Status(StatusArgs),

    /// List recent jobs with trial counts.
    List(ListArgs),

    /// Print the log of a trial's latest attempt.
    Logs(LogsArgs),

    /// Run the reconciliation loop.
    Dispatcher(ServiceArgs),

    /// Run a worker until it is drained.
    Worker(ServiceArgs),

    /// Run the capacity controller.
    Scaler(ServiceArgs),

    /// Apply database migrations.
    Migrate,

    /// Show work queue statistics.
    #[command(name = "queue-stats")]
    QueueStats(JsonArgs),
}

/// Arguments for `trialforge submit`.
#[derive(Parser, Debug)]
pub struct SubmitArgs {
    /// Unpacked task directory (containing task.toml, possibly one level down).
    pub task_dir: PathBuf,

    /// Harness to run under (harbor, terminus).
    #[arg(long, default_value = "harbor")]
    pub harness: String,

    /// Model identifier passed to the harness.
    #[arg(short = 'm', long)]
    pub model: String,

    /// Number of trials (1-100).
    #[arg(short = 'n', long, default_value_t = DEFAULT_TRIALS)]
    pub trials: u32,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `trialforge status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Job identifier.
    pub job_id: Uuid,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `trialforge list`.
#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Maximum number of jobs.
    #[arg(long, default_value = "20")]
    pub limit: u32,

    /// Number of jobs to skip.
    #[arg(long, default_value = "0")]
    pub offset: u32,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `trialforge logs`.
#[derive(Parser, Debug)]
pub struct LogsArgs {
    /// Job identifier.
    pub job_id: Uuid,

    /// Trial number.
    pub trial: u32,
}

/// Arguments shared by long-running services.
#[derive(Parser, Debug)]
pub struct ServiceArgs {
    /// Write the Prometheus text exposition here on exit.
    #[arg(long)]
    pub metrics_file: Option<PathBuf>,
}

/// Arguments for commands with JSON output only.
#[derive(Parser, Debug)]
pub struct JsonArgs {
    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = FleetConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Submit(args) => run_submit_command(&config, args).await,
        Commands::Status(args) => run_status_command(&config, args).await,
        Commands::List(args) => run_list_command(&config, args).await,
        Commands::Logs(args) => run_logs_command(&config, args).await,
        Commands::Dispatcher(args) => run_dispatcher_command(&config, args).await,
        Commands::Worker(args) => run_worker_command(&config, args).await,
        Commands::Scaler(args) => run_scaler_command(&config, args).await,
        Commands::Migrate => run_migrate_command(&config).await,
        Commands::QueueStats(args) => run_queue_stats_command(&config, args).await,
    }
}

// ============================================================================
// Wiring
// ============================================================================

async fn connect_store(config: &FleetConfig) -> anyhow::Result<Arc<PgStore>> {
    let store = PgStore::connect(&config.store.database_url, config.store.max_connections)
        .await
        .context("Failed to connect to the job store")?;
    Ok(Arc::new(store))
}

async fn connect_queue(config: &FleetConfig) -> anyhow::Result<Arc<RedisWorkQueue>> {
    let queue = RedisWorkQueue::connect(
        &config.queue.redis_url,
        &config.queue.name,
        config.queue.visibility_timeout(),
    )
    .await
    .context("Failed to connect to the work queue")?
    .with_poll_interval(config.queue.poll_interval());
    Ok(Arc::new(queue))
}

fn job_observer(config: &FleetConfig, store: Arc<dyn TrialStore>) -> JobObserver {
    let policy = match config.dispatch.max_failed_fraction {
        Some(fraction) => FailureThresholdPolicy::with_max_failed_fraction(fraction),
        None => FailureThresholdPolicy::never_fail(),
    };
    JobObserver::new(store, Arc::new(policy))
}

async fn build_dispatcher(config: &FleetConfig) -> anyhow::Result<(Arc<PgStore>, Dispatcher)> {
    let store = connect_store(config).await?;
    let queue = connect_queue(config).await?;
    let observer = job_observer(config, store.clone());
    let dispatcher = Dispatcher::new(store.clone(), queue, observer)
        .with_grace_period(config.dispatch.grace_period());
    Ok((store, dispatcher))
}

fn fleet_manager(config: &FleetConfig) -> Option<Arc<dyn FleetManager>> {
    config.scaler.control_plane_url.as_ref().map(|url| {
        Arc::new(HttpFleetManager::new(
            url.clone(),
            config.scaler.control_plane_token.clone(),
        )) as Arc<dyn FleetManager>
    })
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn write_metrics(path: Option<&Path>) {
    let Some(path) = path else {
        return;
    };
    if let Err(e) = std::fs::write(path, export_metrics()) {
        warn!(path = %path.display(), error = %e, "Failed to write metrics");
    }
}

/// Resolves on Ctrl-C or SIGTERM and names the signal.
async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => "SIGINT",
                    _ = sigterm.recv() => "SIGTERM",
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                "SIGINT"
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "SIGINT"
    }
}

// ============================================================================
// Client commands
// ============================================================================

#[derive(Debug, Serialize)]
struct SubmitOutput {
    job_id: Uuid,
    trials: u32,
}

async fn run_submit_command(config: &FleetConfig, args: SubmitArgs) -> anyhow::Result<()> {
    let harness: Harness = args.harness.parse()?;
    let (store, dispatcher) = build_dispatcher(config).await?;
    let api = IngressApi::new(
        Arc::new(dispatcher),
        store,
        ArtifactStore::new(&config.store.artifact_root),
    );

    let job_id = api
        .submit(&args.task_dir, harness, &args.model, args.trials)
        .await?;

    if args.json {
        print_json(&SubmitOutput {
            job_id,
            trials: args.trials,
        })
    } else {
        println!("Submitted job {} ({} trials)", job_id, args.trials);
        Ok(())
    }
}

async fn run_status_command(config: &FleetConfig, args: StatusArgs) -> anyhow::Result<()> {
    let store = connect_store(config).await?;
    let job = store
        .get_job(args.job_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Job not found: {}", args.job_id))?;
    let trials = store.get_trials(args.job_id).await?;
    let detail = JobDetail { job, trials };

    if args.json {
        return print_json(&detail);
    }

    let job = &detail.job;
    println!("Job {}  [{}]", job.id, job.status);
    println!("  task:    {} ({})", job.task_name, job.harness);
    println!("  model:   {}", job.model);
    println!("  created: {}", job.created_at.to_rfc3339());
    if let Some(completed_at) = job.completed_at {
        println!("  done:    {}", completed_at.to_rfc3339());
    }
    println!();
    println!("  {:>5}  {:<10}  {:>8}  {:>7}  error", "trial", "status", "attempts", "tests");
    for trial in &detail.trials {
        let tests = match (trial.tests_passed, trial.tests_total) {
            (Some(passed), Some(total)) => format!("{}/{}", passed, total),
            _ => "-".to_string(),
        };
        println!(
            "  {:>5}  {:<10}  {:>8}  {:>7}  {}",
            trial.trial_number,
            trial.status.as_str(),
            trial.attempt_count,
            tests,
            trial.error.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

async fn run_list_command(config: &FleetConfig, args: ListArgs) -> anyhow::Result<()> {
    let store = connect_store(config).await?;
    let jobs: Vec<JobSummary> = store.list_jobs(args.limit, args.offset).await?;

    if args.json {
        return print_json(&jobs);
    }

    if jobs.is_empty() {
        println!("No jobs");
        return Ok(());
    }
    for summary in &jobs {
        let counts = &summary.counts;
        println!(
            "{}  {:<9}  {:<24}  queued={} running={} succeeded={} failed={}",
            summary.id,
            summary.status.as_str(),
            summary.task_name,
            counts.queued,
            counts.running,
            counts.succeeded,
            counts.failed
        );
    }
    Ok(())
}

async fn run_logs_command(config: &FleetConfig, args: LogsArgs) -> anyhow::Result<()> {
    // Logs live in the artifact store; the queue is not needed here.
    let store = connect_store(config).await?;
    let trial_ref = TrialRef::new(args.job_id, args.trial);
    if store.get_trial(trial_ref).await?.is_none() {
        anyhow::bail!("Trial not found: {}", trial_ref);
    }

    let artifacts = ArtifactStore::new(&config.store.artifact_root);
    match artifacts.read_trial_log(trial_ref).await? {
        Some(log) => print!("{}", log),
        None => println!("No log available yet for trial {} of job {}", args.trial, args.job_id),
    }
    Ok(())
}

async fn run_queue_stats_command(config: &FleetConfig, args: JsonArgs) -> anyhow::Result<()> {
    let queue = connect_queue(config).await?;
    let stats = queue.stats().await?;

    if args.json {
        return print_json(&stats);
    }
    println!(
        "{}: {} visible, {} in flight",
        stats.queue_name, stats.visible, stats.in_flight
    );
    Ok(())
}

async fn run_migrate_command(config: &FleetConfig) -> anyhow::Result<()> {
    let store = connect_store(config).await?;
    store.run_migrations().await?;
    info!("Migrations applied");
    Ok(())
}

// ============================================================================
// Services
// ============================================================================

async fn run_dispatcher_command(config: &FleetConfig, args: ServiceArgs) -> anyhow::Result<()> {
    init_metrics()?;
    let (store, dispatcher) = build_dispatcher(config).await?;
    store.run_migrations().await?;

    let interval = config.dispatch.reconcile_interval();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconciler =
        tokio::spawn(async move { dispatcher.run_reconciler(interval, shutdown_rx).await });

    let signal = shutdown_signal().await;
    info!(signal, "Dispatcher shutting down");
    let _ = shutdown_tx.send(true);
    reconciler.await?;

    write_metrics(args.metrics_file.as_deref());
    Ok(())
}

async fn run_worker_command(config: &FleetConfig, args: ServiceArgs) -> anyhow::Result<()> {
    init_metrics()?;
    let store = connect_store(config).await?;
    let queue = connect_queue(config).await?;
    let observer = job_observer(config, store.clone());
    let runner = Arc::new(ProcessRunner::new(config.harness_command()));
    let pool_config = config.worker_pool_config();
    let worker_id = pool_config.worker_id.clone();

    let pool = Arc::new(WorkerPool::new(
        pool_config,
        queue,
        store,
        runner,
        ArtifactStore::new(&config.store.artifact_root),
        observer,
    ));

    let mut drain = DrainController::new(worker_id.clone(), pool.clone())
        .with_deadline(config.drain.deadline())
        .with_poll_interval(config.drain.poll_interval());
    if let Some(ref url) = config.drain.metadata_url {
        drain = drain.with_source(Arc::new(HttpMetadataNotice::new(url.clone())));
    }
    if let Some(fleet) = fleet_manager(config) {
        drain = drain.with_fleet(fleet);
    }
    let drain = Arc::new(drain);

    info!(worker_id = %worker_id, capacity = config.worker.capacity, "Worker starting");

    let fetch_loop = tokio::spawn(pool.clone().run(drain.subscribe()));
    let controller = {
        let drain = drain.clone();
        tokio::spawn(async move { drain.run().await })
    };
    let signals = {
        let drain = drain.clone();
        tokio::spawn(async move {
            let signal = shutdown_signal().await;
            drain.request_drain(TerminationNotice::local(signal));
        })
    };

    let exit = fetch_loop.await?;
    if let PoolExit::Unhealthy(ref reason) = exit {
        error!(worker_id = %worker_id, reason = %reason, "Worker unhealthy, draining");
        drain.request_drain(TerminationNotice::local(format!("unhealthy: {}", reason)));
    }

    let report = controller.await?;
    signals.abort();

    let stats = pool.stats();
    info!(
        worker_id = %worker_id,
        succeeded = stats.trials_succeeded,
        failed = stats.trials_failed,
        retried = stats.retried,
        duplicates = stats.duplicates,
        abandoned = report.abandoned,
        "Worker exited"
    );
    write_metrics(args.metrics_file.as_deref());

    match exit {
        PoolExit::Unhealthy(reason) => Err(anyhow::anyhow!("Worker unhealthy: {}", reason)),
        PoolExit::Drained => Ok(()),
    }
}

async fn run_scaler_command(config: &FleetConfig, args: ServiceArgs) -> anyhow::Result<()> {
    init_metrics()?;
    let fleet = fleet_manager(config).ok_or_else(|| {
        anyhow::anyhow!("scaler.control_plane_url (TRIALFORGE_CONTROL_PLANE_URL) is required")
    })?;
    let queue = connect_queue(config).await?;

    let mut controller = CapacityController::new(queue, fleet, config.scaler.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scaler = tokio::spawn(async move { controller.run(shutdown_rx).await });

    let signal = shutdown_signal().await;
    info!(signal, "Scaler shutting down");
    let _ = shutdown_tx.send(true);
    scaler.await?;

    write_metrics(args.metrics_file.as_deref());
    Ok(())
}
