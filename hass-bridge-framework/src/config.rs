//! Configuration traits and utilities.

use std::path::Path;

use serde::de::DeserializeOwned;

use crate::error::{BridgeError, Result};
use crate::{DiscoveryConfig, LoggingConfig, MqttConfig};

/// Trait for bridge configuration types.
///
/// Implement this trait for your bridge's configuration struct to get
/// automatic loading, validation, and access to common config fields.
///
/// # Example
///
/// ```ignore
/// use serde::Deserialize;
/// use hass_bridge_framework::{BridgeConfig, DiscoveryConfig, LoggingConfig, MqttConfig};
///
/// #[derive(Debug, Deserialize)]
/// pub struct MyBridgeConfig {
///     pub mqtt: MqttConfig,
///     pub discovery: DiscoveryConfig,
///     pub logging: LoggingConfig,
/// }
///
/// impl BridgeConfig for MyBridgeConfig {
///     fn mqtt(&self) -> &MqttConfig {
///         &self.mqtt
///     }
///
///     fn discovery(&self) -> &DiscoveryConfig {
///         &self.discovery
///     }
///
///     fn logging(&self) -> &LoggingConfig {
///         &self.logging
///     }
/// }
/// ```
pub trait BridgeConfig: Sized + DeserializeOwned {
    /// Get the MQTT broker configuration.
    fn mqtt(&self) -> &MqttConfig;

    /// Get the discovery configuration.
    fn discovery(&self) -> &DiscoveryConfig;

    /// Get the logging configuration.
    fn logging(&self) -> &LoggingConfig;

    /// Validate the configuration.
    ///
    /// Called automatically after loading. Override to add custom validation.
    fn validate(&self) -> Result<()> {
        if self.discovery().device_name.trim().is_empty() {
            return Err(BridgeError::validation("discovery.device_name cannot be empty"));
        }
        Ok(())
    }

    /// Load configuration from a file path.
    ///
    /// Supports YAML and JSON5, chosen by extension. Calls
    /// [`validate`](Self::validate) after loading.
    fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(BridgeError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let config: Self =
            hass_common::load_config(path).map_err(|e| BridgeError::ConfigParse(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::io::Write;

    #[derive(Debug, Deserialize)]
    struct TestConfig {
        #[serde(default)]
        mqtt: MqttConfig,
        discovery: DiscoveryConfig,
        #[serde(default)]
        logging: LoggingConfig,
    }

    impl BridgeConfig for TestConfig {
        fn mqtt(&self) -> &MqttConfig {
            &self.mqtt
        }

        fn discovery(&self) -> &DiscoveryConfig {
            &self.discovery
        }

        fn logging(&self) -> &LoggingConfig {
            &self.logging
        }
    }

    #[test]
    fn test_config_not_found() {
        let result = TestConfig::load("/nonexistent/path.yaml");
        assert!(matches!(result, Err(BridgeError::ConfigNotFound { .. })));
    }

    #[test]
    fn test_load_yaml() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "discovery:\n  device_name: walli").unwrap();

        let config = TestConfig::load(file.path()).unwrap();
        assert_eq!(config.discovery.device_name, "walli");
        assert_eq!(config.discovery.prefix, "homeassistant");
    }

    #[test]
    fn test_empty_device_name_rejected() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "discovery:\n  device_name: '  '").unwrap();

        let result = TestConfig::load(file.path());
        assert!(matches!(result, Err(BridgeError::ConfigValidation(_))));
    }

    #[test]
    fn test_parse_error() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "mqtt: [unclosed").unwrap();

        let result = TestConfig::load(file.path());
        assert!(matches!(result, Err(BridgeError::ConfigParse(_))));
    }
}
