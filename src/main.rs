use std::path::PathBuf;

use clap::Parser;

use mesh_bootstrap::config::{load_config, BootstrapConfig};
use mesh_bootstrap::lifecycle::{spawn_signal_handler, Server, Shutdown};
use mesh_bootstrap::observability::logging;

#[derive(Parser)]
#[command(name = "mesh-bootstrap")]
#[command(
    about = "Serving identity and secure transport for the mesh control plane",
    long_about = None
)]
struct Cli {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => BootstrapConfig::default(),
    };

    logging::init(&config.observability)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = ?cli.config,
        "mesh-bootstrap starting"
    );

    if cli.check {
        mesh_bootstrap::config::validation::validate_config(&config).map_err(|errors| {
            mesh_bootstrap::config::ConfigError::Validation(errors)
        })?;
        tracing::info!("Configuration is valid");
        return Ok(());
    }

    let shutdown = Shutdown::new();
    let server = Server::start(config, &shutdown).await?;
    let signals = spawn_signal_handler(shutdown.clone());

    server.wait_until_completion().await;
    signals.abort();

    tracing::info!("Shutdown complete");
    Ok(())
}
