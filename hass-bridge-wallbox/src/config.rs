//! Configuration for the wallbox bridge.

use serde::{Deserialize, Serialize};

use hass_bridge_framework::{
    BridgeConfig, BridgeError, DiscoveryConfig, LoggingConfig, MqttConfig, Result,
};

/// Top-level key holding the capture period, rewritten when Home Assistant
/// changes the polling interval.
pub const POLLING_INTERVAL_KEY: &str = "polling_interval_seconds";

/// Complete bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WallboxBridgeConfig {
    /// MQTT broker settings
    #[serde(default)]
    pub mqtt: MqttConfig,

    /// Home Assistant discovery settings
    pub discovery: DiscoveryConfig,

    /// Serial line settings
    pub transport: TransportConfig,

    /// Seconds between captures, aligned to wall-clock multiples
    #[serde(default = "default_polling_interval")]
    pub polling_interval_seconds: u64,

    /// Delay between a register write and the capture confirming it
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    /// Sensors of the machine running the bridge
    #[serde(default)]
    pub host: HostConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_polling_interval() -> u64 {
    60
}

fn default_settle_delay_ms() -> u64 {
    1000
}

/// Host sensor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Publish hostname, IP, wifi strength and CPU temperature (default: true)
    #[serde(default = "default_host_enabled")]
    pub enabled: bool,

    /// Wireless interface whose signal level is reported (default: "wlan0")
    #[serde(default = "default_wifi_interface")]
    pub wifi_interface: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            enabled: default_host_enabled(),
            wifi_interface: default_wifi_interface(),
        }
    }
}

fn default_host_enabled() -> bool {
    true
}

fn default_wifi_interface() -> String {
    "wlan0".to_string()
}

/// Modbus RTU line configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0")
    pub port: String,

    /// Modbus slave id of the wallbox (1-247)
    #[serde(default = "default_bus_id")]
    pub bus_id: u8,

    /// Attempts per register read before the read is reported as failed
    #[serde(default = "default_max_read_attempts")]
    pub max_read_attempts: u32,

    /// Baud rate (default: 19200)
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Data bits (default: 8)
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,

    /// Parity: "none", "even", or "odd" (default: "even")
    #[serde(default = "default_parity")]
    pub parity: String,

    /// Stop bits: 1 or 2 (default: 1)
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_bus_id() -> u8 {
    1
}

fn default_max_read_attempts() -> u32 {
    3
}

fn default_baud_rate() -> u32 {
    19200
}

fn default_data_bits() -> u8 {
    8
}

fn default_parity() -> String {
    "even".to_string()
}

fn default_stop_bits() -> u8 {
    1
}

fn default_timeout_ms() -> u64 {
    10_000
}

impl TransportConfig {
    /// Settings for `port` with the wallbox's factory line parameters.
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            bus_id: default_bus_id(),
            max_read_attempts: default_max_read_attempts(),
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            parity: default_parity(),
            stop_bits: default_stop_bits(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl BridgeConfig for WallboxBridgeConfig {
    fn mqtt(&self) -> &MqttConfig {
        &self.mqtt
    }

    fn discovery(&self) -> &DiscoveryConfig {
        &self.discovery
    }

    fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    fn validate(&self) -> Result<()> {
        if self.discovery.device_name.trim().is_empty() {
            return Err(BridgeError::validation("discovery.device_name cannot be empty"));
        }

        let transport = &self.transport;

        if transport.port.trim().is_empty() {
            return Err(BridgeError::validation("transport.port cannot be empty"));
        }

        if !(1..=247).contains(&transport.bus_id) {
            return Err(BridgeError::validation(format!(
                "transport.bus_id must be 1-247, got {}",
                transport.bus_id
            )));
        }

        if transport.max_read_attempts == 0 {
            return Err(BridgeError::validation(
                "transport.max_read_attempts must be at least 1",
            ));
        }

        match transport.parity.to_lowercase().as_str() {
            "none" | "even" | "odd" => {}
            _ => {
                return Err(BridgeError::validation(format!(
                    "invalid parity '{}' (use none, even, or odd)",
                    transport.parity
                )));
            }
        }

        if !matches!(transport.stop_bits, 1 | 2) {
            return Err(BridgeError::validation("transport.stop_bits must be 1 or 2"));
        }

        if !(5..=8).contains(&transport.data_bits) {
            return Err(BridgeError::validation("transport.data_bits must be 5-8"));
        }

        if self.host.enabled && self.host.wifi_interface.trim().is_empty() {
            return Err(BridgeError::validation("host.wifi_interface cannot be empty"));
        }

        if self.polling_interval_seconds == 0 {
            return Err(BridgeError::validation(
                "polling_interval_seconds must be at least 1",
            ));
        }

        Ok(())
    }
}
