//! Modbus RTU ⇄ TCP bridge.
//!
//! Polls a Modbus field device and serves its registers over Modbus TCP.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use modbus_bridge::ModbusBridge;
use modbus_bridge::config::ModbusBridgeConfig;

/// Modbus RTU client ⇄ Modbus TCP host bridge.
#[derive(Parser, Debug)]
#[command(name = "modbus-bridge")]
#[command(about = "Polls a Modbus device and serves its registers over Modbus TCP")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format)
    #[arg(short, long, default_value = "modbus-bridge.json5")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = ModbusBridgeConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    // Initialize logging
    let log_config = config.logging.with_level_override(args.log_level.as_deref());
    modbus_bridge_common::init_tracing(&log_config).context("Failed to init tracing")?;

    info!("Starting modbus-bridge");
    info!("Loaded configuration from {:?}", args.config);

    let mut bridge = ModbusBridge::new(&config.register_file).with_context(|| {
        format!(
            "Failed to load register file {:?}",
            config.register_file
        )
    })?;
    config
        .apply(&mut bridge)
        .context("Invalid bridge configuration")?;

    bridge
        .setup_connection()
        .await
        .context("Failed to set up bridge connections")?;

    bridge.set_collecting_client_data(true)?;
    bridge.set_provisioning_host_data(true)?;

    info!(
        registers = bridge.catalog().len(),
        state = %bridge.state(),
        "Modbus bridge running"
    );

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    bridge.shutdown().await;

    let health = bridge.health();
    info!(
        collection_passes = health.collection_passes,
        provisioning_passes = health.provisioning_passes,
        read_errors = health.read_errors,
        write_errors = health.write_errors,
        "Modbus bridge stopped"
    );

    Ok(())
}
