use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use reconcile::{CancellationToken, Coordinator, ReconcileError, ReconciliationReport};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};

mod config;
mod files;
mod telemetry;

use config::{default_config_path, AppConfig, DomainJob};
use files::{FileSource, JsonFileStore};

#[derive(Parser)]
#[command(name = "reconcile")]
#[command(about = "Reconcile local records against an external system of record")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured log level
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Emit console logs as JSON
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run reconciliation and apply changes to the local store
    Run {
        /// Domain to reconcile
        #[arg(required_unless_present = "all")]
        domain: Option<String>,

        /// Reconcile every configured domain in order
        #[arg(long, conflicts_with = "domain")]
        all: bool,

        /// Print reports as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the operations a run would apply, without writing anything
    Plan {
        domain: String,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },
    /// Validate the configuration file
    Validate,
    /// Generate an example configuration
    Generate {
        /// Output path for configuration
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// How a batch of runs ended, in increasing severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Outcome {
    Clean,
    RecordFailures,
    Aborted,
}

impl Outcome {
    fn of(report: &ReconciliationReport) -> Self {
        if report.cancelled {
            Outcome::Aborted
        } else if report.is_clean() {
            Outcome::Clean
        } else {
            Outcome::RecordFailures
        }
    }

    fn exit_code(self) -> ExitCode {
        match self {
            Outcome::Clean => ExitCode::SUCCESS,
            Outcome::RecordFailures => ExitCode::from(2),
            Outcome::Aborted => ExitCode::from(1),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run_cli(cli).await {
        Ok(outcome) => outcome.exit_code(),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(1)
        }
    }
}

async fn run_cli(cli: Cli) -> Result<Outcome> {
    if let Commands::Generate { output } = &cli.command {
        generate_config(output.as_ref()).await?;
        return Ok(Outcome::Clean);
    }

    let path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = AppConfig::load(&path).await?;
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    config.logging.json |= cli.log_json;

    let _guard = telemetry::init(&config.logging)?;
    info!(config = %path.display(), "Loaded configuration");
    config.validate()?;

    match cli.command {
        Commands::Run { domain, all, json } => {
            let jobs: Vec<&DomainJob> = if all {
                config.domains.iter().collect()
            } else {
                vec![find_job(&config, domain.as_deref())?]
            };
            run_jobs(&config, &jobs, json).await
        }
        Commands::Plan { domain, json } => {
            let job = find_job(&config, Some(domain.as_str()))?;
            plan_job(&config, job, json).await?;
            Ok(Outcome::Clean)
        }
        Commands::Validate => {
            println!("✓ Configuration is valid");
            for job in &config.domains {
                println!(
                    "  {} (key: {}, source: {}, store: {})",
                    job.domain.name,
                    job.domain.key_field,
                    job.source.display(),
                    job.store.display()
                );
            }
            Ok(Outcome::Clean)
        }
        Commands::Generate { .. } => Ok(Outcome::Clean),
    }
}

fn find_job<'a>(config: &'a AppConfig, name: Option<&str>) -> Result<&'a DomainJob> {
    let Some(name) = name else {
        bail!("No domain given");
    };
    match config.domain(name) {
        Some(job) => Ok(job),
        None => bail!("Domain '{}' is not configured", name),
    }
}

/// Cancel the token on Ctrl-C; runs stop between operations
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling reconciliation");
            trigger.cancel();
        }
    });
    cancel
}

async fn run_jobs(config: &AppConfig, jobs: &[&DomainJob], json: bool) -> Result<Outcome> {
    let coordinator = Coordinator::new(config.engine.clone())?;
    let cancel = cancel_on_ctrl_c();
    let mut worst = Outcome::Clean;

    for job in jobs {
        if cancel.is_cancelled() {
            warn!(domain = %job.domain.name, "Skipping domain after cancellation");
            worst = Outcome::Aborted;
            continue;
        }

        let source = FileSource::new(&job.source);
        let store = match JsonFileStore::open(&job.store).await {
            Ok(store) => store,
            Err(err) => {
                error!(domain = %job.domain.name, store = %job.store.display(), error = %err, "Cannot open local store");
                println!("✗ {}: aborted: cannot open {}: {}", job.domain.name, job.store.display(), err);
                worst = Outcome::Aborted;
                continue;
            }
        };

        match coordinator.reconcile(&job.domain, &source, &store, &cancel).await {
            Ok(report) => {
                print_report(&report, json)?;
                worst = worst.max(Outcome::of(&report));
            }
            Err(err) => {
                report_abort(&job.domain.name, &err);
                worst = Outcome::Aborted;
            }
        }
    }

    Ok(worst)
}

async fn plan_job(config: &AppConfig, job: &DomainJob, json: bool) -> Result<()> {
    let coordinator = Coordinator::new(config.engine.clone())?;
    let source = FileSource::new(&job.source);
    let store = JsonFileStore::open(&job.store).await?;

    let plan = coordinator
        .preview(&job.domain, &source, &store, &cancel_on_ctrl_c())
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    let s = &plan.summary;
    println!(
        "{}: {} to create, {} to update, {} to delete, {} unchanged",
        job.domain.name, s.creates, s.updates, s.deletes, s.unchanged
    );
    if s.retained > 0 {
        println!("  {} local-only records retained (deletes disabled)", s.retained);
    }
    for operation in &plan.operations {
        match operation.local_id() {
            Some(id) => println!("  {:<6} {} (#{})", operation.kind().to_string(), operation.key(), id),
            None => println!("  {:<6} {}", operation.kind().to_string(), operation.key()),
        }
    }
    Ok(())
}

fn print_report(report: &ReconciliationReport, json: bool) -> Result<()> {
    if json {
        println!("{}", report.to_json()?);
        return Ok(());
    }

    let mark = if report.is_clean() { "✓" } else { "✗" };
    println!("{} {}", mark, report.summary());
    for failure in &report.failures {
        println!("    {} {}: {}", failure.stage, failure.key, failure.reason);
    }
    Ok(())
}

fn report_abort(domain: &str, err: &ReconcileError) {
    match err {
        ReconcileError::AlreadyRunning { .. } => {
            println!("✗ {}: skipped, another run holds the lock", domain)
        }
        ReconcileError::Cancelled => println!("✗ {}: cancelled before applying", domain),
        other => println!("✗ {}: aborted: {}", domain, other),
    }
}

async fn generate_config(output_path: Option<&PathBuf>) -> Result<()> {
    let config = AppConfig::sample();

    if let Some(path) = output_path {
        config.save(path).await?;
        println!("Configuration generated at {}", path.display());
    } else {
        println!("{}", toml::to_string_pretty(&config)?);
    }

    Ok(())
}
