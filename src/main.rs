//! osha-ingest - Rate-limited ingestion of OSHA inspection and violation records
//!
//! This is the main entry point for the osha-ingest application.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info, warn};

use osha_ingest::config::Config;
use osha_ingest::engine::Engine;
use osha_ingest::models::{JobKind, RunStatus};
use osha_ingest::otel::{init_tracing, Metrics, OtelProvider};
use osha_ingest::sync::{RunBounds, SchedulerHandle};

/// osha-ingest - Rate-limited ingestion of OSHA inspection and violation records
#[derive(Parser, Debug)]
#[command(name = "osha-ingest")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "OSHA_INGEST_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
enum Command {
    /// Run the scheduler until interrupted (default)
    Run,
    /// Run one inspection sync and print its report
    SyncInspections {
        /// Maximum records fetched in this run
        #[arg(long)]
        max_records: Option<u32>,
        /// Maximum remote calls in this run
        #[arg(long)]
        max_calls: Option<u32>,
    },
    /// Run one violation watch and print its report
    SyncViolations {
        /// Maximum inspections checked in this run
        #[arg(long)]
        max_inspections: Option<u32>,
    },
    /// Print watermark, counts and the last run of each job
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Load configuration
    let config = load_config(&args)?;

    // Initialize OpenTelemetry provider
    let otel_provider = OtelProvider::new(&config.otel)?;

    // Initialize tracing/logging
    init_tracing(&otel_provider, &config.logging)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting osha-ingest");

    let metrics = Arc::new(Metrics::new(&otel_provider.meter()));
    let engine = Engine::new(&config, Some(metrics)).await?;

    let result = match args.command.unwrap_or(Command::Run) {
        Command::Run => engine
            .run_until(shutdown_signal())
            .await
            .map_err(anyhow::Error::from),
        Command::SyncInspections {
            max_records,
            max_calls,
        } => {
            let bounds = RunBounds {
                max_records,
                max_calls,
                max_inspections: None,
            };
            run_once(engine.handle(), JobKind::InspectionSync, bounds).await
        }
        Command::SyncViolations { max_inspections } => {
            let bounds = RunBounds {
                max_inspections,
                ..RunBounds::default()
            };
            run_once(engine.handle(), JobKind::ViolationWatch, bounds).await
        }
        Command::Status => {
            let status = engine.handle().status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
    };

    // Shutdown OpenTelemetry
    if let Err(e) = otel_provider.shutdown() {
        error!(error = %e, "Failed to shutdown OpenTelemetry");
    }

    info!("osha-ingest shutdown complete");

    result
}

/// Run one job to completion; a shutdown signal ends it at the next unit
async fn run_once(handle: SchedulerHandle, kind: JobKind, bounds: RunBounds) -> anyhow::Result<()> {
    let stopper = {
        let handle = handle.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            handle.request_stop();
        })
    };

    let report = handle.trigger(kind, bounds).await;
    stopper.abort();
    let report = report?;

    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.status() == RunStatus::Failed {
        anyhow::bail!(
            "{} failed: {}",
            kind,
            report.stop_reason().error_message().unwrap_or_default()
        );
    }
    Ok(())
}

/// Load configuration from file or environment
fn load_config(args: &Args) -> anyhow::Result<Config> {
    match &args.config {
        Some(path) => {
            // Use eprintln! since tracing is not yet initialized
            eprintln!("Loading configuration from file: {}", path);
            Config::from_file(path).map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))
        }
        None => {
            // Use eprintln! since tracing is not yet initialized
            eprintln!("Loading configuration from environment variables");
            Config::from_env().map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))
        }
    }
}

/// Create a future that resolves when a shutdown signal is received
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
