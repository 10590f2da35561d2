use std::fs::OpenOptions;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use osync_adapters::ParserKind;
use osync_sync::{build_scheduler, Registry, RunReport, Runner, SyncConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "osync")]
#[command(about = "Synchronizes the municipal website into the app data stores")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every enabled category once, or just one.
    Sync {
        #[arg(long)]
        category: Option<String>,
    },
    /// Validate the registry and environment without fetching anything.
    Check,
    /// Run the registry on the configured cron schedule until interrupted.
    Schedule,
    /// List the parser names accepted in the registry.
    Parsers,
}

/// Diagnostics go to the main log file only; the terminal gets one line.
fn init_logging(config: &SyncConfig) -> Result<()> {
    std::fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("creating {}", config.log_dir.display()))?;
    let path = config.main_log_path();
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("opening {}", path.display()))?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .try_init()
        .map_err(|err| anyhow!(err))
}

async fn load_registry(config: &SyncConfig) -> Result<Registry> {
    let registry = Registry::load(&config.registry_path).await?;
    registry.validate(config)?;
    Ok(registry)
}

fn print_report(report: &RunReport) {
    let failed: Vec<_> = report.failed().collect();
    println!(
        "sync complete: run_id={} categories={} failed={}",
        report.run_id,
        report.outcomes.len(),
        if failed.is_empty() {
            "none".to_string()
        } else {
            failed.join(",")
        }
    );
}

async fn run(command: Commands, config: &SyncConfig) -> Result<bool> {
    match command {
        Commands::Parsers => {
            for kind in ParserKind::ALL {
                println!("{kind}");
            }
            Ok(true)
        }
        Commands::Check => {
            let registry = load_registry(config).await?;
            println!(
                "registry ok: {} categories, {} enabled",
                registry.categories.len(),
                registry.enabled().count()
            );
            Ok(true)
        }
        Commands::Sync { category } => {
            let registry = load_registry(config).await?;
            let runner = Runner::from_config(config)?;
            let report = match category.as_deref() {
                Some(name) => runner.run_only(&registry, name).await?,
                None => runner.run(&registry).await?,
            };
            print_report(&report);
            Ok(report.success())
        }
        Commands::Schedule => {
            let registry = load_registry(config).await?;
            let runner = Arc::new(Runner::from_config(config)?);
            let mut sched = build_scheduler(&config.schedule, runner, Arc::new(registry)).await?;
            sched.start().await.context("starting scheduler")?;
            info!(schedule = %config.schedule, "scheduler started");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;
            sched.shutdown().await.context("stopping scheduler")?;
            info!("scheduler stopped");
            Ok(true)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    if let Err(err) = init_logging(&config) {
        eprintln!("osync: {err:#}");
        return ExitCode::FAILURE;
    }

    let log = config.main_log_path();
    match run(cli.command.unwrap_or(Commands::Sync { category: None }), &config).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => {
            eprintln!("osync: some categories failed, see {}", log.display());
            ExitCode::FAILURE
        }
        Err(err) => {
            error!(error = %format!("{err:#}"), "run aborted");
            eprintln!("osync: {err}, see {}", log.display());
            ExitCode::FAILURE
        }
    }
}
