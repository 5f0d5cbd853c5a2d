//! MQTT bridge for Modbus-TCP field devices.
//!
//! Reads gauge point definitions from a configuration service, polls each
//! point's registers at its own cadence, and publishes decoded values to
//! an MQTT broker as retained messages.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::info;

use mqtt_bridge_modbus::config::{BridgeConfig, LoggingConfig, normalize_records};
use mqtt_bridge_modbus::publisher::MqttPublisher;
use mqtt_bridge_modbus::reader::TcpRegisterReader;
use mqtt_bridge_modbus::scheduler::Scheduler;
use mqtt_bridge_modbus::source::HttpConfigSource;

/// MQTT bridge for Modbus-TCP gauges.
#[derive(Parser, Debug)]
#[command(name = "mqtt-bridge-modbus")]
#[command(about = "Polls Modbus devices and publishes gauge values to MQTT")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format)
    #[arg(short, long, default_value = "bridge.json5")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = BridgeConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    let log_config = LoggingConfig {
        level: args
            .log_level
            .clone()
            .unwrap_or_else(|| config.logging.level.clone()),
        format: config.logging.format,
    };
    mqtt_bridge_modbus::init_tracing(&log_config).context("Failed to init tracing")?;

    info!("Starting mqtt-bridge-modbus");
    info!("Loaded configuration from {:?}", args.config);

    let (publisher, mqtt_driver) = MqttPublisher::connect(&config.mqtt);
    info!(
        broker = %format!("{}:{}", config.mqtt.host, config.mqtt.port),
        client_id = %config.mqtt.client_id,
        "MQTT client started"
    );

    let source =
        HttpConfigSource::new(&config.source).context("Failed to build configuration source")?;
    let reader = TcpRegisterReader::new(Duration::from_millis(config.modbus.timeout_ms));

    let static_points = normalize_records(&config.points);
    if !static_points.is_empty() {
        info!(points = static_points.len(), "Loaded static points");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = Scheduler::new(
        Arc::new(source),
        Arc::new(reader),
        Arc::new(publisher),
        Duration::from_secs(config.source.refresh_interval_secs),
        static_points,
        shutdown_rx,
    );

    let scheduler_task = tokio::spawn(scheduler.run());

    info!("Bridge running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    let _ = shutdown_tx.send(true);
    let _ = scheduler_task.await;
    mqtt_driver.abort();

    info!("Bridge stopped");
    Ok(())
}
