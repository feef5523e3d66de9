use clap::Parser;
use conductor::config::AppConfig;
use conductor::error::Result;
use conductor::{init_logging, Orchestrator};
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info};

/// Agent orchestration daemon
#[derive(Parser, Debug)]
#[command(name = "conductor", version, about)]
struct Cli {
    /// Directory holding default.toml and <CONDUCTOR_ENV>.toml
    #[arg(long, env = "CONDUCTOR_CONFIG_DIR", default_value = "config")]
    config_dir: PathBuf,

    /// Load and print the effective configuration, then exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config_dir)?;

    if cli.check_config {
        println!("{}", serde_json::to_string_pretty(&config.orchestrator)?);
        return Ok(());
    }

    let _guard = init_logging(&config.logging)?;

    let orchestrator = Orchestrator::new(config.orchestrator);
    orchestrator.start().await?;
    info!("conductor running. Press Ctrl+C to stop.");

    shutdown_signal().await;
    info!("Received shutdown signal");

    orchestrator.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
