use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

/// MQTT broker connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker host name or address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Broker TCP port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Client identifier (default: "mqtt-exporter-<pid>").
    #[serde(default)]
    pub client_id: Option<String>,

    /// Keep-alive interval in seconds.
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    /// Optional username, must be paired with `password`.
    #[serde(default)]
    pub username: Option<String>,

    /// Optional password.
    #[serde(default)]
    pub password: Option<String>,

    /// Subscription QoS level (0, 1 or 2).
    #[serde(default)]
    pub qos: u8,

    /// Largest packet accepted from or sent to the broker, in bytes.
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    1883
}

fn default_keep_alive() -> u64 {
    60
}

/// Default `mqtt.max_packet_size` (10 MiB).
pub const DEFAULT_MAX_PACKET_SIZE: usize = 10 * 1024 * 1024;

fn default_max_packet_size() -> usize {
    DEFAULT_MAX_PACKET_SIZE
}

impl MqttConfig {
    /// Client identifier to present to the broker.
    pub fn client_id(&self) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| format!("mqtt-exporter-{}", std::process::id()))
    }

    /// Validate the connection settings.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::Config("mqtt.host must not be empty".to_string()));
        }
        if self.port == 0 {
            return Err(Error::Config("mqtt.port must be > 0".to_string()));
        }
        if self.qos > 2 {
            return Err(Error::Config(format!(
                "mqtt.qos must be 0, 1 or 2 (got {})",
                self.qos
            )));
        }
        if self.max_packet_size == 0 {
            return Err(Error::Config("mqtt.max_packet_size must be > 0".to_string()));
        }
        if self.username.is_some() != self.password.is_some() {
            return Err(Error::Config(
                "mqtt.username and mqtt.password must be set together".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            client_id: None,
            keep_alive_secs: default_keep_alive(),
            username: None,
            password: None,
            qos: 0,
            max_packet_size: default_max_packet_size(),
        }
    }
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
    /// Log level: "trace", "debug", "info", "warn", "error" (any case).
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format: "text" or "json".
    #[serde(default)]
    pub format: LogFormat,
}

pub fn default_log_level() -> String {
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

/// Configuration file syntax.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Json5,
}

impl ConfigFormat {
    /// Pick the syntax from a file extension; anything but `.json5`/`.json` is YAML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json5") || ext.eq_ignore_ascii_case("json") => {
                ConfigFormat::Json5
            }
            _ => ConfigFormat::Yaml,
        }
    }
}

/// Load a configuration file in YAML or JSON5 format.
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

/// Load a configuration from a string.
pub fn parse_config<T: for<'de> Deserialize<'de>>(content: &str, format: ConfigFormat) -> Result<T> {
    match format {
        ConfigFormat::Yaml => serde_yaml::from_str(content).map_err(|e| Error::Config(e.to_string())),
        ConfigFormat::Json5 => json5::from_str(content).map_err(|e| Error::Config(e.to_string())),
    }
}
