//! Task Runner Agent entry point.
//!
//! Loads the agent configuration, initializes logging (and OTLP tracing
//! if configured), spawns the request queue, the run-status actor, and
//! drives the sync loop until the coordinator sends `<exit/>` or the
//! process receives a shutdown signal. Configuration load, PID file, and
//! log file failures are all fatal at startup and exit with code 2 —
//! there is no partially-running state to recover from.

mod backoff;
mod config;
mod errors;
mod factory;
mod process;
mod protocol;
mod queue;
mod result;
mod run;
mod status;
mod sync;
mod telemetry;
mod vars;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use config::AgentConfig;
use telemetry::TelemetryConfig;

/// Exit code for every fatal startup failure (config, PID file, log
/// file) — there is nothing to roll back and nothing useful to retry.
const FATAL_EXIT_CODE: i32 = 2;

#[derive(Parser, Debug)]
#[command(name = "sf-runner", version, about = "Task runner agent")]
struct Cli {
    /// Path to the agent configuration XML document.
    #[arg(long)]
    config: PathBuf,

    /// Optional PID file written at startup and removed at shutdown.
    #[arg(long)]
    pid_file: Option<PathBuf>,

    /// Resolve Windows-only wrapper extensions (.bat, .vbs, .js) and
    /// argv conventions. Off by default (the agent's native host here
    /// is assumed POSIX).
    #[arg(long, default_value_t = false)]
    windows: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match AgentConfig::load(&cli.config) {
        Ok(config) => Arc::new(config),
        Err(err) => {
            eprintln!("fatal: failed to load configuration: {err}");
            std::process::exit(FATAL_EXIT_CODE);
        }
    };

    if let Some(pid_path) = &cli.pid_file {
        if let Err(err) = write_pid_file(pid_path) {
            eprintln!("fatal: could not write PID file {}: {err}", pid_path.display());
            std::process::exit(FATAL_EXIT_CODE);
        }
    }

    let telemetry_config = TelemetryConfig {
        service_name: "task-runner-agent".to_string(),
        log_level: parse_log_level(&config.generic.log_level),
        log_file: config.generic.log_file.clone(),
        ..TelemetryConfig::from_env()
    };
    if let Err(err) = telemetry::init_telemetry(telemetry_config) {
        eprintln!("fatal: failed to initialize logging: {err:#}");
        cleanup_pid_file(cli.pid_file.as_deref());
        std::process::exit(FATAL_EXIT_CODE);
    }

    info!(config = %cli.config.display(), "task runner agent starting");

    let client = reqwest::Client::new();
    let (queue, queue_worker) = queue::spawn(client, config.clone());
    let (status, status_worker) = status::spawn(config.clone(), queue.clone(), cli.windows);

    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    let runner_version = env!("CARGO_PKG_VERSION").to_string();

    tokio::select! {
        _ = sync::run(status.clone(), queue.clone(), host, runner_version) => {
            info!("sync loop finished");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    // Dropping every handle lets the request queue drain whatever is
    // still outstanding (an in-flight task run keeps its own queue
    // clone alive until it finishes) before the worker's JoinHandle
    // resolves.
    drop(status);
    drop(queue);
    let _ = status_worker.await;
    let _ = queue_worker.await;

    cleanup_pid_file(cli.pid_file.as_deref());
    telemetry::shutdown_telemetry();
}

fn write_pid_file(path: &Path) -> std::io::Result<()> {
    std::fs::write(path, std::process::id().to_string())
}

fn cleanup_pid_file(path: Option<&Path>) {
    if let Some(path) = path {
        let _ = std::fs::remove_file(path);
    }
}

fn parse_log_level(level: &str) -> tracing::Level {
    level.parse().unwrap_or(tracing::Level::INFO)
}
