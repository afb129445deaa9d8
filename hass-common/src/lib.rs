//! Hass Common Library
//!
//! This crate provides shared types and utilities for Home Assistant MQTT bridges:
//!
//! - [`config`] - Configuration loading and persistence (YAML or JSON5)
//! - [`entity`] - Entity kinds and values exchanged with Home Assistant
//! - [`discovery`] - Entity descriptors and MQTT discovery payloads
//! - [`topics`] - Topic builders and parsers
//! - [`error`] - Error types

pub mod config;
pub mod discovery;
pub mod entity;
pub mod error;
pub mod topics;

// Re-export commonly used types at the crate root
pub use config::{
    ConfigFormat, DiscoveryConfig, LogFormat, LoggingConfig, MqttConfig, load_config,
    parse_config, update_config_scalar,
};
pub use discovery::{DeviceInfo, DiscoveryPayload, EntityDescriptor, discovery_message};
pub use entity::{EntityKind, EntityValue};
pub use error::{Error, Result};
pub use topics::{DISCOVERY_PREFIX, HASS_STATUS_TOPIC, TopicBuilder, normalize_device_name};

/// Initialize tracing with the given configuration.
///
/// Supports two output formats:
/// - `LogFormat::Text` (default): Human-readable text format
/// - `LogFormat::Json`: Structured JSON format for log aggregation systems
///
/// `RUST_LOG` takes precedence over the configured level when set.
///
/// # Example
///
/// ```ignore
/// use hass_common::{LoggingConfig, LogFormat, init_tracing};
///
/// let config = LoggingConfig {
///     level: "info".to_string(),
///     format: LogFormat::Json,
/// };
/// init_tracing(&config)?;
/// ```
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
    }

    Ok(())
}
