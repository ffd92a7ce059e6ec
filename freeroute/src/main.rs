//! Binary entrypoint: CLI parsing, logging init, signal handling.
//! Grounded on `original_source/service/src/__main__.py`'s signal-driven
//! shutdown of the proxy task.

use std::path::PathBuf;

use clap::Parser;
use freeroute_lib::{logging, Options};

#[derive(Parser, Debug)]
#[command(name = "freeroute", version, about = "Split-tunnel DNS/policy router")]
struct Cli {
    /// Path to config.yaml. Falls back to $CONFIG, then ./config.yaml.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level passed to the tracing env-filter default.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    let handle = match freeroute_lib::start(Options {
        config_path: cli.config,
    })
    .await
    {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!("failed to start freeroute: {}", e);
            return std::process::ExitCode::FAILURE;
        }
    };

    tokio::select! {
        _ = wait_for_shutdown_signal() => {
            tracing::info!("shutdown signal received");
            handle.shutdown();
        }
    }

    handle.join().await;
    std::process::ExitCode::SUCCESS
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
