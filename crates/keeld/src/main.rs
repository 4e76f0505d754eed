//! keeld — the Keel daemon.
//!
//! Assembles the Keel subsystems in one process:
//! - State store (redb)
//! - Resource scheduler with one worker per agent
//! - Rehearsal executor standing in for handler code
//!
//! # Usage
//!
//! ```text
//! keeld run --model version.json --config keel.toml --data-dir /var/lib/keel
//! keeld run --model version.json --verify
//! keeld status --data-dir /var/lib/keel
//! ```

mod rehearsal;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use keel_core::{KeelConfig, ModelVersion};
use keel_scheduler::{PerAgentExecutors, ResourceScheduler};
use keel_state::StateStore;

use crate::rehearsal::RehearsalExecutor;

#[derive(Parser)]
#[command(name = "keeld", about = "Keel deploy daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Deploy a model version and exit once everything settled.
    Run {
        /// Model version snapshot (JSON).
        #[arg(long)]
        model: PathBuf,

        /// Path to keel.toml.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/keel")]
        data_dir: PathBuf,

        /// Keep running the configured timers until Ctrl-C.
        #[arg(long)]
        keep_running: bool,

        /// Dry-run every resource once deploys settled and report drift.
        #[arg(long)]
        verify: bool,
    },
    /// Print the recorded state of every resource.
    Status {
        #[arg(long, default_value = "/var/lib/keel")]
        data_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run {
            model,
            config,
            data_dir,
            keep_running,
            verify,
        } => {
            let options = RunOptions {
                keep_running,
                verify,
            };
            run(&model, config.as_deref(), &data_dir, options).await
        }
        Command::Status { data_dir } => status(&data_dir),
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,keeld=debug,keel=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<KeelConfig> {
    match path {
        Some(path) => {
            let config = KeelConfig::from_file(path)?;
            info!(path = %path.display(), environment = %config.environment.name, "config loaded");
            Ok(config)
        }
        None => Ok(KeelConfig::default()),
    }
}

fn open_store(data_dir: &Path) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join("keel.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = %db_path.display(), "state store opened");
    Ok(store)
}

fn build_scheduler(config: &KeelConfig, store: &StateStore) -> ResourceScheduler {
    let executor = Arc::new(RehearsalExecutor::new(&config.rehearsal));
    ResourceScheduler::new(
        config.environment.name.clone(),
        config.scheduler.clone(),
        Arc::new(PerAgentExecutors::shared(executor)),
        Arc::new(store.clone()),
    )
}

#[derive(Debug, Clone, Copy, Default)]
struct RunOptions {
    keep_running: bool,
    verify: bool,
}

async fn run(
    model: &Path,
    config: Option<&Path>,
    data_dir: &Path,
    options: RunOptions,
) -> anyhow::Result<()> {
    info!("Keel daemon starting");

    let config = load_config(config)?;
    let store = open_store(data_dir)?;
    let version = ModelVersion::from_file(model)?;
    let version_number = version.version;
    info!(
        version = version.version,
        resources = version.resources.len(),
        "model version loaded"
    );

    let scheduler = build_scheduler(&config, &store);
    scheduler.start().await;
    scheduler.new_version(version).await?;

    if options.keep_running {
        tokio::signal::ctrl_c().await?;
        info!("shutdown signal received");
    } else {
        tokio::select! {
            _ = scheduler.wait_until_idle() => info!("all deploys settled"),
            res = tokio::signal::ctrl_c() => {
                res?;
                warn!("interrupted before all deploys settled");
            }
        }
    }

    if options.verify {
        verify(&scheduler, &store, version_number).await?;
    }

    let snapshot = scheduler.snapshot().await;
    scheduler.stop("daemon shutdown").await;

    for resource in &snapshot {
        let status = resource.state.last_status.map(|s| s.label()).unwrap_or("pending");
        let blocked = if resource.state.blocked { " (blocked)" } else { "" };
        println!("{:<24} {}{}", status, resource.resource, blocked);
    }

    info!("Keel daemon stopped");
    Ok(())
}

/// Dry-run the deployed version and log every resource that would still
/// change.
async fn verify(
    scheduler: &ResourceScheduler,
    store: &StateStore,
    version: u64,
) -> anyhow::Result<()> {
    let dry_run_id = format!("verify-{version}");
    let queued = scheduler.dry_run(&dry_run_id, None).await?;
    info!(%dry_run_id, resources = queued, "verification dry-run queued");
    scheduler.wait_until_idle().await;

    let drifted: Vec<_> = store
        .list_dryrun(&dry_run_id)?
        .into_iter()
        .filter(|report| !report.result.changes.is_empty())
        .collect();
    for report in &drifted {
        warn!(
            resource = %report.resource,
            changes = report.result.changes.len(),
            "resource not converged"
        );
    }
    info!(%dry_run_id, drifted = drifted.len(), "verification done");
    Ok(())
}

fn status(data_dir: &Path) -> anyhow::Result<()> {
    let store = open_store(data_dir)?;
    let states = store.list_resource_states()?;
    println!("{}", serde_json::to_string_pretty(&states)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_run() {
        let cli = Cli::try_parse_from([
            "keeld",
            "run",
            "--model",
            "version.json",
            "--data-dir",
            "/tmp/keel",
        ])
        .unwrap();
        assert_eq!(cli.log_format, LogFormat::Text);
        match cli.command {
            Command::Run {
                model,
                config,
                keep_running,
                verify,
                ..
            } => {
                assert_eq!(model, PathBuf::from("version.json"));
                assert!(config.is_none());
                assert!(!keep_running);
                assert!(!verify);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn cli_parses_json_logging() {
        let cli = Cli::try_parse_from(["keeld", "status", "--log-format", "json"]).unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
    }

    #[test]
    fn missing_config_falls_back_to_defaults() {
        let config = load_config(None).unwrap();
        assert_eq!(config.environment.name, "default");
    }
}
