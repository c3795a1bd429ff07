//! IOTLink bridge - Main Entry Point
//!
//! Runs the broker connection, the local agent relay and the monitors until
//! SIGINT or SIGTERM.

use clap::{Parser, Subcommand};
use iotlink_bridge::config::{BridgeConfig, ConfigWatcher};
use iotlink_bridge::error::{BridgeError, BridgeResult};
use iotlink_bridge::observability::init_default_logging;
use iotlink_bridge::platform::MachineIdentity;
use iotlink_bridge::service::BridgeService;
use iotlink_bridge::transport::mqtt::connection::validate_transport;
use std::path::{Path, PathBuf};
use std::process;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATHS: [&str; 2] = ["iotlink.toml", "config/iotlink.toml"];

/// Bridge between monitors, an MQTT broker and local per-user agents
#[derive(Parser)]
#[command(name = "iotlink-bridge")]
#[command(about = "Bridge between monitors, an MQTT broker and local per-user agents")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "IOTLINK_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge
    Run,
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting IOTLink bridge v{}", env!("CARGO_PKG_VERSION"));

    let (config, config_path) = match load_configuration(cli.config.as_deref()) {
        Ok(loaded) => loaded,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_bridge(config, config_path).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(if e.is_configuration_error() { 2 } else { 1 });
    }

    info!("Application shutdown complete");
}

fn load_configuration(config_path: Option<&Path>) -> BridgeResult<(BridgeConfig, PathBuf)> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok((BridgeConfig::load_from_file(path)?, path.to_path_buf()));
    }

    for path_str in DEFAULT_CONFIG_PATHS {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok((BridgeConfig::load_from_file(&path)?, path));
        }
    }

    Err(BridgeError::ConfigNotFound {
        tried: DEFAULT_CONFIG_PATHS.join(", "),
    })
}

async fn run_bridge(config: BridgeConfig, config_path: PathBuf) -> BridgeResult<()> {
    let identity = MachineIdentity::detect();
    info!("Machine: {} (domain {})", identity.machine_name, identity.domain_name);

    let mut service = BridgeService::new(config, identity);
    service.start().await?;

    let watcher_cancel = CancellationToken::new();
    let mut reloads = match ConfigWatcher::new(config_path.clone()).spawn(watcher_cancel.clone()) {
        Ok(reloads) => reloads,
        Err(e) => {
            warn!("Configuration changes will not be reloaded: {}", e);
            // A closed channel disables the reload branch below
            mpsc::channel(1).1
        }
    };

    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| BridgeError::internal(format!("Cannot install SIGINT handler: {e}")))?;
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| BridgeError::internal(format!("Cannot install SIGTERM handler: {e}")))?;

    info!("Bridge is running");

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully...");
                break;
            }
            Some(config) = reloads.recv() => service.reload(config).await,
        }
    }

    watcher_cancel.cancel();
    service.shutdown().await;
    Ok(())
}

fn handle_config_command(mut config: BridgeConfig, show: bool) -> BridgeResult<()> {
    match validate_transport(&config.mqtt) {
        Ok(endpoint) => info!("MQTT broker: {}", endpoint.info()),
        Err(e) => error!("MQTT will be disabled: {}", e),
    }

    if show {
        if let Some(credentials) = config.mqtt.credentials.as_mut() {
            if !credentials.password.is_empty() {
                credentials.password = "***".to_string();
            }
        }

        let rendered = toml::to_string_pretty(&config)
            .map_err(|e| BridgeError::internal(format!("Cannot render configuration: {e}")))?;
        println!("Current configuration:");
        println!("{rendered}");
    }

    info!("Configuration validation complete");
    Ok(())
}
