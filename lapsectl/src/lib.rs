use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use thiserror::Error;
use tracing::info;

use lapse_core::{load_config, Engine};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] lapse_core::ConfigError),
    #[error("engine error: {0}")]
    Engine(#[from] lapse_core::EngineError),
    #[error("store error: {0}")]
    Store(#[from] lapse_core::StoreError),
    #[error("receiver error: {0}")]
    Receiver(#[from] lapse_core::ReceiverError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("required resource missing: {0}")]
    MissingResource(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Timelapse engine control interface", long_about = None)]
pub struct Cli {
    /// Path to lapse.toml
    #[arg(long, default_value = "configs/lapse.toml")]
    pub config: PathBuf,
    /// Validate and log intent without touching the filesystem
    #[arg(long, default_value_t = false)]
    pub read_only: bool,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one backlog pass of slot and daily timelapse generation
    CheckTimelapses(CheckTimelapsesArgs),
    /// Roll one pending (date, hour) cell into an hourly archive
    Archive(ArchiveArgs),
    /// Trim the staging directory to the configured retention
    Cleanup,
    /// Check capture drift and restart the ingestion pipeline if stalled
    Watchdog(WatchdogArgs),
    /// Collect and publish the status snapshot
    Stats,
    /// Launch the long-running capture session (blocks until it exits)
    Receive,
    /// Print the last published status snapshot
    Status,
}

#[derive(Args, Debug)]
pub struct CheckTimelapsesArgs {
    /// Fail every generation attempt, exercising the error sentinels
    #[arg(long, default_value_t = false)]
    pub simulate_failure: bool,
}

#[derive(Args, Debug)]
pub struct ArchiveArgs {
    /// Concatenate losslessly instead of re-encoding
    #[arg(long, default_value_t = false)]
    pub no_compress: bool,
}

#[derive(Args, Debug)]
pub struct WatchdogArgs {
    /// Restart by killing the matching OS process
    #[arg(long, action = ArgAction::Set, default_value_t = true)]
    pub process: bool,
    /// Restart by revoking the registered capture task
    #[arg(long, default_value_t = false)]
    pub task: bool,
}

pub fn run(cli: Cli) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = load_config(&cli.config)?;
    let read_only = cli.read_only || config.system.read_only;
    let engine = Engine::new(config)?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(dispatch(&cli, &engine, read_only))
}

async fn dispatch(cli: &Cli, engine: &Engine, read_only: bool) -> Result<()> {
    match &cli.command {
        Commands::CheckTimelapses(args) => {
            let report = engine
                .generator()
                .check_timelapses(read_only, args.simulate_failure)
                .await;
            emit(
                cli.format,
                serde_json::json!({
                    "slots_generated": report.slots_generated,
                    "dailies_generated": report.dailies_generated,
                }),
            )
        }
        Commands::Archive(args) => {
            let report = engine.archiver().archive(read_only, !args.no_compress).await;
            emit(
                cli.format,
                serde_json::json!({
                    "eligible_dates": report.eligible_dates,
                    "pending_cells": report.pending_cells,
                    "generated": report.generated,
                }),
            )
        }
        Commands::Cleanup => {
            let report = engine.cleaner().cleanup(read_only);
            emit(
                cli.format,
                serde_json::json!({
                    "kept": report.kept,
                    "deleted": report.deleted,
                    "failed": report.failed,
                }),
            )
        }
        Commands::Watchdog(args) => {
            let report = engine.watchdog().run(args.process, args.task);
            emit(
                cli.format,
                serde_json::json!({
                    "stalled": report.stalled,
                    "drift_seconds": report.drift_seconds,
                    "restart_count": report.restart_count,
                    "actions": report
                        .actions
                        .iter()
                        .map(|action| format!("{action:?}"))
                        .collect::<Vec<_>>(),
                    "observations": report.observations,
                }),
            )
        }
        Commands::Stats => {
            let snapshot = engine.stats().publish();
            emit(cli.format, snapshot)
        }
        Commands::Receive => {
            info!("starting capture session");
            engine.receiver().run().await?;
            Ok(())
        }
        Commands::Status => {
            let snapshot = engine
                .store()
                .load_snapshot()?
                .ok_or_else(|| AppError::MissingResource("no published snapshot".into()))?;
            emit(cli.format, snapshot)
        }
    }
}

fn emit(format: OutputFormat, payload: serde_json::Value) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&payload)?),
        OutputFormat::Text => {
            if let Some(map) = payload.as_object() {
                for (key, value) in map {
                    println!("{key}: {value}");
                }
            } else {
                println!("{payload}");
            }
        }
    }
    Ok(())
}
