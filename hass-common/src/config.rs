use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::topics::DISCOVERY_PREFIX;

/// MQTT broker connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker hostname or IP address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Broker TCP port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// MQTT client identifier.
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Username (requires `password`).
    #[serde(default)]
    pub username: Option<String>,

    /// Password for `username`.
    #[serde(default)]
    pub password: Option<String>,

    /// YAML file holding `mqtt_auth: { user, password }`.
    ///
    /// Used when no inline credentials are given, so the main configuration
    /// file can be shared without the broker password.
    #[serde(default)]
    pub secrets_file: Option<PathBuf>,

    /// Keep-alive interval in seconds.
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    /// Delay before reconnecting when the broker refuses the connection.
    #[serde(default = "default_connect_retry")]
    pub connect_retry_secs: u64,

    /// Delay before reconnecting when the broker is unreachable.
    #[serde(default = "default_unreachable_retry")]
    pub unreachable_retry_secs: u64,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "hass-bridge".to_string()
}

fn default_keep_alive() -> u64 {
    60
}

fn default_connect_retry() -> u64 {
    120
}

fn default_unreachable_retry() -> u64 {
    600
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            client_id: default_client_id(),
            username: None,
            password: None,
            secrets_file: None,
            keep_alive_secs: default_keep_alive(),
            connect_retry_secs: default_connect_retry(),
            unreachable_retry_secs: default_unreachable_retry(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Secrets {
    mqtt_auth: MqttAuth,
}

#[derive(Debug, Deserialize)]
struct MqttAuth {
    user: String,
    password: String,
}

impl MqttConfig {
    /// Resolve broker credentials.
    ///
    /// Inline `username`/`password` win over `secrets_file`.
    pub fn credentials(&self) -> Result<Option<(String, String)>> {
        match (&self.username, &self.password) {
            (Some(user), Some(password)) => return Ok(Some((user.clone(), password.clone()))),
            (Some(user), None) => {
                return Err(Error::Config(format!(
                    "MQTT user '{}' configured without a password",
                    user
                )));
            }
            _ => {}
        }

        let Some(path) = &self.secrets_file else {
            return Ok(None);
        };

        let secrets: Secrets = load_config(path)?;
        Ok(Some((secrets.mqtt_auth.user, secrets.mqtt_auth.password)))
    }
}

/// Home Assistant discovery configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Discovery topic prefix.
    #[serde(default = "default_discovery_prefix")]
    pub prefix: String,

    /// Device name used in topics, unique ids and entity names.
    pub device_name: String,
}

fn default_discovery_prefix() -> String {
    DISCOVERY_PREFIX.to_string()
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format (default).
    #[default]
    Text,
    /// Structured JSON format.
    Json,
}

/// Common logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format: "text" or "json".
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// On-disk configuration format, chosen by file extension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConfigFormat {
    /// YAML (`.yaml`, `.yml`, or anything unrecognized).
    #[default]
    Yaml,
    /// JSON5 (`.json5`, `.json`).
    Json5,
}

impl ConfigFormat {
    /// Pick the format for a path.
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        match path.as_ref().extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json5") || ext.eq_ignore_ascii_case("json") => {
                ConfigFormat::Json5
            }
            _ => ConfigFormat::Yaml,
        }
    }
}

/// Load a configuration file, YAML or JSON5 depending on its extension.
pub fn load_config<T: for<'de> Deserialize<'de>>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "Failed to read config file '{}': {}",
            path.display(),
            e
        ))
    })?;

    parse_config(&content, ConfigFormat::from_path(path)).map_err(|e| {
        Error::Config(format!(
            "Failed to parse config file '{}': {}",
            path.display(),
            e
        ))
    })
}

/// Parse a configuration from a string.
pub fn parse_config<T: for<'de> Deserialize<'de>>(content: &str, format: ConfigFormat) -> Result<T> {
    match format {
        ConfigFormat::Yaml => serde_yaml::from_str(content).map_err(Error::from),
        ConfigFormat::Json5 => json5::from_str(content).map_err(Error::from),
    }
}

/// Rewrite one top-level key of a configuration file, keeping everything else.
///
/// The file is loaded, the key replaced (or added), and the document written
/// back in the same format. Comments in YAML files are not preserved.
///
/// The new content goes to a temporary file next to `path` which then
/// replaces it, so readers never see a partial file.
pub fn update_config_scalar<V: Serialize>(
    path: impl AsRef<Path>,
    key: &str,
    value: V,
) -> Result<()> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)?;

    let updated = match ConfigFormat::from_path(path) {
        ConfigFormat::Yaml => {
            let mut document: serde_yaml::Value = serde_yaml::from_str(&content)?;
            let serde_yaml::Value::Mapping(mapping) = &mut document else {
                return Err(Error::Config(format!(
                    "'{}' does not contain a mapping at the top level",
                    path.display()
                )));
            };
            mapping.insert(
                serde_yaml::Value::String(key.to_string()),
                serde_yaml::to_value(value)?,
            );
            serde_yaml::to_string(&document)?
        }
        ConfigFormat::Json5 => {
            let mut document: serde_json::Value = json5::from_str(&content)?;
            let Some(object) = document.as_object_mut() else {
                return Err(Error::Config(format!(
                    "'{}' does not contain an object at the top level",
                    path.display()
                )));
            };
            object.insert(key.to_string(), serde_json::to_value(value)?);
            serde_json::to_string_pretty(&document)?
        }
    };

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut staged = tempfile::NamedTempFile::new_in(dir)?;
    staged.write_all(updated.as_bytes())?;
    staged.as_file().sync_all()?;
    staged.persist(path).map_err(|e| e.error)?;
    tracing::debug!(path = %path.display(), key, "Configuration updated");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[derive(Debug, Deserialize)]
    struct TestConfig {
        #[serde(default)]
        mqtt: MqttConfig,
        #[serde(default)]
        logging: LoggingConfig,
        polling_interval_seconds: Option<u64>,
    }

    #[test]
    fn test_parse_yaml_config() {
        let yaml = r#"
mqtt:
  host: broker.local
  port: 1884
  username: hass
  password: secret
logging:
  level: debug
polling_interval_seconds: 30
"#;

        let config: TestConfig = parse_config(yaml, ConfigFormat::Yaml).unwrap();

        assert_eq!(config.mqtt.host, "broker.local");
        assert_eq!(config.mqtt.port, 1884);
        assert_eq!(config.mqtt.client_id, "hass-bridge");
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.polling_interval_seconds, Some(30));
    }

    #[test]
    fn test_parse_json5_config() {
        let json5 = r#"
        {
            mqtt: { host: "10.0.0.2" },
            logging: { level: "warn", format: "json" },
        }
        "#;

        let config: TestConfig = parse_config(json5, ConfigFormat::Json5).unwrap();

        assert_eq!(config.mqtt.host, "10.0.0.2");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.polling_interval_seconds, None);
    }

    #[test]
    fn test_default_config() {
        let config: TestConfig = parse_config("{}", ConfigFormat::Json5).unwrap();

        assert_eq!(config.mqtt, MqttConfig::default());
        assert_eq!(config.mqtt.connect_retry_secs, 120);
        assert_eq!(config.mqtt.unreachable_retry_secs, 600);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(ConfigFormat::from_path("settings.yaml"), ConfigFormat::Yaml);
        assert_eq!(ConfigFormat::from_path("settings.yml"), ConfigFormat::Yaml);
        assert_eq!(ConfigFormat::from_path("bridge.json5"), ConfigFormat::Json5);
        assert_eq!(ConfigFormat::from_path("bridge.JSON"), ConfigFormat::Json5);
        assert_eq!(ConfigFormat::from_path("settings"), ConfigFormat::Yaml);
    }

    #[test]
    fn test_inline_credentials() {
        let config = MqttConfig {
            username: Some("hass".to_string()),
            password: Some("pw".to_string()),
            ..MqttConfig::default()
        };

        assert_eq!(
            config.credentials().unwrap(),
            Some(("hass".to_string(), "pw".to_string()))
        );
    }

    #[test]
    fn test_user_without_password_rejected() {
        let config = MqttConfig {
            username: Some("hass".to_string()),
            ..MqttConfig::default()
        };

        assert!(matches!(config.credentials(), Err(Error::Config(_))));
    }

    #[test]
    fn test_credentials_from_secrets_file() {
        let mut secrets = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(secrets, "mqtt_auth:\n  user: walli\n  password: hunter2").unwrap();

        let config = MqttConfig {
            secrets_file: Some(secrets.path().to_path_buf()),
            ..MqttConfig::default()
        };

        assert_eq!(
            config.credentials().unwrap(),
            Some(("walli".to_string(), "hunter2".to_string()))
        );
        assert_eq!(MqttConfig::default().credentials().unwrap(), None);
    }

    #[test]
    fn test_update_yaml_scalar() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "mqtt:\n  host: broker.local\npolling_interval_seconds: 60"
        )
        .unwrap();

        update_config_scalar(file.path(), "polling_interval_seconds", 300u64).unwrap();

        let config: TestConfig = load_config(file.path()).unwrap();
        assert_eq!(config.polling_interval_seconds, Some(300));
        assert_eq!(config.mqtt.host, "broker.local");
    }

    #[test]
    fn test_update_json5_scalar_adds_missing_key() {
        let mut file = tempfile::Builder::new().suffix(".json5").tempfile().unwrap();
        writeln!(file, "{{ mqtt: {{ host: 'broker.local' }} }}").unwrap();

        update_config_scalar(file.path(), "polling_interval_seconds", 45u64).unwrap();

        let config: TestConfig = load_config(file.path()).unwrap();
        assert_eq!(config.polling_interval_seconds, Some(45));
        assert_eq!(config.mqtt.host, "broker.local");
    }

    #[test]
    fn test_update_replaces_file_whole() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallbox.yaml");
        std::fs::write(&path, "mqtt:\n  host: broker.local\npolling_interval_seconds: 60\n").unwrap();

        update_config_scalar(&path, "polling_interval_seconds", 120u64).unwrap();

        let config: TestConfig = load_config(&path).unwrap();
        assert_eq!(config.polling_interval_seconds, Some(120));

        // No staging file left behind
        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(entries, ["wallbox.yaml"]);
    }

    #[test]
    fn test_update_rejects_non_mapping() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "- just\n- a\n- list").unwrap();

        let result = update_config_scalar(file.path(), "polling_interval_seconds", 10u64);
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
