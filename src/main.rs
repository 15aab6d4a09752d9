use std::path::PathBuf;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use heating_control::config::AppConfig;
use heating_control::controller::Controller;
use heating_control::runner;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Valve controller driven by MQTT temperature readings
#[derive(Debug, Parser)]
#[command(name = "heating-control", version)]
struct Cli {
    /// Configuration file; defaults to <config dir>/heating-control/config.toml
    #[arg(long)]
    config: Option<PathBuf>,

    /// URI of the MQTT broker, e.g. tcp://mybroker:1883
    #[arg(long, alias = "brokeruri")]
    broker_uri: Option<String>,

    /// Topic to subscribe to for readings
    #[arg(long, alias = "readingstopic")]
    readings_topic: Option<String>,

    /// Topic for controlling actuators
    #[arg(long, alias = "actuatorstopic")]
    actuators_topic: Option<String>,

    /// Target temperature
    #[arg(long)]
    target: Option<f64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let cli = Cli::parse();
    let config = load_config(&cli).await?;
    info!(
        "Controlling {} from {} towards {}",
        config.controller.actuators_topic,
        config.controller.readings_topic,
        config.controller.target_value
    );

    let controller = Controller::new(config.controller);

    let shutdown = async {
        if let Err(e) = runner::wait_for_shutdown_signal().await {
            error!("Failed to install signal handlers: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    };

    let outcome = runner::supervise(&controller, shutdown, &config.runner).await;
    info!("Shutdown complete");

    let code = outcome.exit_code();
    if code != 0 {
        error!("Exiting after {:?}", outcome);
        std::process::exit(code);
    }
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

async fn load_config(cli: &Cli) -> Result<AppConfig> {
    let path = match &cli.config {
        Some(path) => Some(path.clone()),
        None => AppConfig::default_path(),
    };

    let mut config = match path {
        Some(path) => AppConfig::load(&path)
            .await
            .map_err(|e| eyre!("Failed to load configuration: {}", e))?,
        None => AppConfig::default(),
    };

    if let Some(broker_uri) = &cli.broker_uri {
        config.controller.broker_address = broker_uri.clone();
    }
    if let Some(topic) = &cli.readings_topic {
        config.controller.readings_topic = topic.clone();
    }
    if let Some(topic) = &cli.actuators_topic {
        config.controller.actuators_topic = topic.clone();
    }
    if let Some(target) = cli.target {
        config.controller.target_value = target;
    }
    Ok(config)
}
