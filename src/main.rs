use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use drover::config::CoordinatorConfig;
use drover::error::{DroverError, Result};
use drover::orchestrator::{self, Orchestrator};
use drover::seed::{JobSource, ManifestSource};
use drover::shutdown::install_shutdown_handler;
use drover::store::lock::LockManager;
use drover::store::JobStore;
use drover::worker::{ShellExecutor, Worker};

const EXIT_SEED_FAILURE: i32 = 2;
const EXIT_LOCK_TIMEOUT: i32 = 3;
const EXIT_SESSION_CONFLICT: i32 = 4;

#[derive(Parser, Debug)]
#[command(name = "drover")]
#[command(version)]
#[command(about = "Job-queue coordinator for ephemeral workers over a shared ledger file")]
#[command(propagate_version = true)]
struct Args {
    /// Path to the ledger file
    #[arg(long, short = 'l', global = true, default_value = "drover-ledger.csv")]
    ledger: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Print per-status job counts, failed rows broken out by category
    Status {
        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },

    /// Insert jobs from a JSON manifest (idempotent by job_id)
    Seed {
        /// Path to a JSON array of job seeds
        manifest: PathBuf,
    },

    /// Requeue failed jobs as pending for another run
    ResetFailed {
        /// Also requeue account-category failures and reset their attempts
        #[arg(long)]
        include_non_retryable: bool,
    },

    /// Run a session: spawn workers and sweep retry passes until settled
    Run(RunArgs),

    /// Worker process entry point (spawned by `run`)
    #[command(hide = true)]
    Worker(WorkerArgs),

    /// Ask the session that owns this ledger to shut down gracefully
    Stop,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Number of worker processes per pass
    #[arg(long, short = 'w', default_value = "2")]
    workers: u32,

    /// Retry-pass ceiling for this session
    #[arg(long)]
    max_passes: Option<u32>,

    /// Seed manifest applied when the ledger is empty
    #[arg(long)]
    seed: Option<PathBuf>,

    /// Apply the seed manifest even if the ledger already has rows
    #[arg(long)]
    force_reseed: bool,
}

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// This worker's identity in the ledger
    #[arg(long)]
    worker_id: u32,

    /// Start of the port range reserved for this worker's tasks
    #[arg(long, default_value = "5000")]
    port_base: u16,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Command Handlers
// =============================================================================

fn build_store(config: &CoordinatorConfig) -> JobStore {
    let lock = LockManager::new(config.ledger_path.clone(), config.lock_timeout);
    JobStore::new(lock, config.retry.clone())
}

fn handle_status(store: &JobStore, output: &OutputFormat) -> Result<()> {
    let stats = store.stats()?;
    match output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        OutputFormat::Table => {
            println!("{:<12} COUNT", "STATUS");
            println!("{}", "-".repeat(20));
            println!("{:<12} {}", "pending", stats.pending);
            println!("{:<12} {}", "claimed", stats.claimed);
            println!("{:<12} {}", "success", stats.success);
            println!("{:<12} {}", "retrying", stats.retrying);
            println!("{:<12} {}", "skipped", stats.skipped);
            println!("{:<12} {}", "failed", stats.failed);
            if stats.failed > 0 {
                println!();
                println!(
                    "  account (needs manual intervention): {}",
                    stats.failed_account
                );
                println!(
                    "  infrastructure (was auto-retried):   {}",
                    stats.failed_infrastructure
                );
                println!(
                    "  unknown (was auto-retried):          {}",
                    stats.failed_unknown
                );
            }
        }
    }
    Ok(())
}

fn handle_seed(store: &JobStore, config: &CoordinatorConfig, manifest: PathBuf) -> Result<()> {
    let seeds = ManifestSource::new(manifest).jobs()?;
    let total = seeds.len();
    let jobs = seeds
        .into_iter()
        .map(|s| s.into_job(&config.retry))
        .collect();
    let inserted = store.seed(jobs)?;
    println!("Seeded {inserted} of {total} jobs ({} already present)", total - inserted);
    Ok(())
}

fn handle_reset_failed(store: &JobStore, include_non_retryable: bool) -> Result<()> {
    let next_pass = store.max_pass_number()? + 1;
    let reset = store.reset_for_retry(next_pass, include_non_retryable)?;
    println!("Reset {reset} jobs to pending (pass {next_pass})");
    Ok(())
}

async fn handle_run(config: CoordinatorConfig, args: RunArgs) -> Result<()> {
    let mut config = config;
    if let Some(max_passes) = args.max_passes {
        config.max_passes = max_passes;
    }
    let store = build_store(&config);
    let shutdown = install_shutdown_handler();
    let orchestrator = Orchestrator::new(config, store, args.workers);

    let manifest = args.seed.map(ManifestSource::new);
    let seed_source = manifest.as_ref().map(|m| m as &dyn JobSource);
    orchestrator
        .run(shutdown, seed_source, args.force_reseed)
        .await?;
    Ok(())
}

async fn handle_worker(config: CoordinatorConfig, args: WorkerArgs) -> Result<()> {
    let store = build_store(&config);
    let shutdown = install_shutdown_handler();
    let executor = Arc::new(
        ShellExecutor::new().with_env("DROVER_PORT_BASE", args.port_base.to_string()),
    );
    let worker = Worker::new(args.worker_id, store, executor, config, shutdown);
    worker.run().await?;
    Ok(())
}

fn handle_stop(config: &CoordinatorConfig) -> Result<()> {
    match orchestrator::signal_stop(&config.ledger_path)? {
        Some(record) => {
            println!(
                "Signaled session {} (pid {}) to stop",
                record.session_id, record.pid
            );
        }
        None => println!("No session owns this ledger"),
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

fn exit_code_for(err: &DroverError) -> i32 {
    match err {
        DroverError::InvalidSeed(_) => EXIT_SEED_FAILURE,
        DroverError::LockTimeout { .. } => EXIT_LOCK_TIMEOUT,
        DroverError::SessionConflict { .. } => EXIT_SESSION_CONFLICT,
        _ => 1,
    }
}

async fn dispatch(args: Args) -> Result<()> {
    let config = CoordinatorConfig::new(args.ledger).with_env_overrides();
    match args.command {
        Commands::Status { output } => handle_status(&build_store(&config), &output),
        Commands::Seed { manifest } => handle_seed(&build_store(&config), &config, manifest),
        Commands::ResetFailed {
            include_non_retryable,
        } => handle_reset_failed(&build_store(&config), include_non_retryable),
        Commands::Run(run_args) => handle_run(config, run_args).await,
        Commands::Worker(worker_args) => handle_worker(config, worker_args).await,
        Commands::Stop => handle_stop(&config),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if let Err(e) = dispatch(args).await {
        eprintln!("Error: {e}");
        std::process::exit(exit_code_for(&e));
    }
}
