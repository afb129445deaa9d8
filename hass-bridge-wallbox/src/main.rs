//! Home Assistant bridge for the Heidelberg Energy Control wallbox.
//!
//! Polls the wallbox over Modbus RTU and publishes its state to MQTT in the
//! Home Assistant discovery format.

use std::sync::Arc;

use anyhow::Result;
use hass_bridge_framework::{BridgeArgs, BridgeConfig, BridgeRunner};

use hass_bridge_wallbox::transport::RtuConnector;
use hass_bridge_wallbox::trigger::WallClock;
use hass_bridge_wallbox::{WallboxBridge, WallboxBridgeConfig, entities};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = BridgeArgs::parse_with_default("wallbox.yaml");

    // Load configuration using the framework's BridgeConfig trait
    let config = WallboxBridgeConfig::load(&args.config).map_err(|e| anyhow::anyhow!("{}", e))?;

    let entities = entities(&config);

    // Create the bridge runner (initializes logging and the MQTT client)
    let runner = BridgeRunner::new_with_args("wallbox", config, Some(&args), entities)
        .map_err(|e| anyhow::anyhow!("{}", e))?;

    tracing::info!(config = %args.config.display(), "Loaded configuration");

    let publisher = Arc::new(runner.publisher());
    let bridge = WallboxBridge::start(
        runner.config(),
        Some(args.config.clone()),
        RtuConnector::new(runner.config().transport.clone()),
        runner.store(),
        publisher,
        WallClock::System,
    )
    .map_err(|e| anyhow::anyhow!("{}", e))?;

    // Run until Ctrl+C (stops the wallbox worker before going offline)
    runner
        .run(Arc::new(bridge))
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))
}
