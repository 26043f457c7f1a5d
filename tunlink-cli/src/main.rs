//! Tunlink CLI
//!
//! A command-line interface for the tunlink proxy control-plane.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tunlink_engine::{
    Config, ControlConnector, ControlServer, NoopKernel, ReloadOutcome, ServiceState, StateHub,
    StateStore, StateUpdate,
};

/// Tunlink - cross-process control-plane for a VPN proxy client
#[derive(Parser)]
#[command(name = "tunlink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "tunlink.toml")]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker process owning the canonical state
    Worker {
        /// Label of the target to bring up
        #[arg(short, long, default_value = "default")]
        label: String,
    },

    /// Print the worker's current state
    Status,

    /// Hot-reload the active configuration from a file
    Reload {
        /// File containing the new configuration content
        file: PathBuf,
    },

    /// Follow state changes as they happen
    Watch,

    /// Generate a sample configuration file
    GenConfig {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "tunlink.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level);

    match cli.command {
        Commands::Worker { label } => run_worker(cli.config, label).await,
        Commands::Status => show_status(cli.config).await,
        Commands::Reload { file } => reload(cli.config, file).await,
        Commands::Watch => watch(cli.config).await,
        Commands::GenConfig { output } => generate_config(output),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run_worker(config_path: PathBuf, label: String) -> Result<()> {
    info!("Starting tunlink worker...");

    let config = load_config(&config_path)?;
    let store = Arc::new(
        StateStore::new(&config.store.dir).context("Failed to open the durable state store")?,
    );
    let hub = StateHub::new(store, Arc::new(NoopKernel), &config.timing);

    info!("Configuration loaded from {:?}", config_path);

    let server = Arc::new(ControlServer::new(
        &config.control.socket_path,
        Arc::clone(&hub),
    ));
    let server_handle = {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Control endpoint error: {}", e);
            }
        })
    };

    hub.update(StateUpdate::new().state(ServiceState::Starting))
        .await;
    hub.update(
        StateUpdate::new()
            .state(ServiceState::Running)
            .active_label(label)
            .last_error(""),
    )
    .await;

    wait_for_shutdown().await;

    info!("Shutting down worker...");

    hub.update(
        StateUpdate::new()
            .state(ServiceState::Stopped)
            .active_label("")
            .manually_stopped(true),
    )
    .await;

    // give the final broadcast a moment to reach subscribers
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    server_handle.abort();
    server.cleanup();

    Ok(())
}

async fn show_status(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    let connector = connector(&config);

    let snapshot = connector
        .query()
        .await
        .context("Failed to query the worker")?;

    println!(
        "{}",
        serde_json::to_string_pretty(&snapshot).context("Failed to render state")?
    );
    Ok(())
}

async fn reload(config_path: PathBuf, file: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    let content = std::fs::read_to_string(&file)
        .with_context(|| format!("Failed to read {:?}", file))?;

    let connector = connector(&config);
    let outcome = match connector.reload(&content).await {
        Ok(outcome) => outcome,
        Err(_) => ReloadOutcome::IpcError,
    };

    match outcome {
        ReloadOutcome::Success => {
            println!("Configuration reloaded");
            Ok(())
        }
        other => bail!("Reload failed: {}", other),
    }
}

async fn watch(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    let connector = connector(&config);

    let mut subscription = connector
        .subscribe()
        .await
        .context("Failed to subscribe to the worker")?;

    while let Some(snapshot) = subscription.next().await? {
        println!(
            "{} label={:?} error={:?} manually_stopped={}",
            snapshot.state, snapshot.active_label, snapshot.last_error, snapshot.manually_stopped
        );
    }

    info!("Worker closed the subscription");
    Ok(())
}

fn connector(config: &Config) -> ControlConnector {
    ControlConnector::new(&config.control.socket_path)
        .with_timeout(config.control.request_timeout())
}

fn load_config(path: &PathBuf) -> Result<Config> {
    if path.exists() {
        Config::load(path).with_context(|| format!("Failed to load configuration from {:?}", path))
    } else {
        Ok(Config::default())
    }
}

fn generate_config(output: PathBuf) -> Result<()> {
    let sample = Config::sample();

    std::fs::write(&output, sample)
        .with_context(|| format!("Failed to write configuration to {:?}", output))?;

    println!("Sample configuration written to {:?}", output);
    Ok(())
}

async fn wait_for_shutdown() {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("Failed to register SIGTERM handler");
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("Failed to register SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT");
        }
    }
}
