//! Configuration for the Prometheus exporter.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use mqtt_exporter_common::config::{ConfigFormat, LogFormat, LoggingConfig, MqttConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mapping::MetricKind;
use crate::rule::{RuleError, RuleSet, compile};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] mqtt_exporter_common::Error),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Invalid export rule: {0}")]
    Rule(#[from] RuleError),
}

/// Complete exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// Log level: "trace", "debug", "info", "warn", "error" (any case).
    #[serde(default = "mqtt_exporter_common::config::default_log_level")]
    pub log_level: String,

    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,

    /// MQTT broker settings.
    #[serde(default)]
    pub mqtt: MqttConfig,

    /// Prometheus exporter settings.
    #[serde(default)]
    pub prometheus: PrometheusConfig,

    /// Subscription declarations, in priority-free declaration order.
    #[serde(default)]
    pub export: Vec<Subscription>,
}

/// Prometheus HTTP endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrometheusConfig {
    /// Port to listen on (default: 9090).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Address to bind (default: "0.0.0.0").
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Path for metrics endpoint (default: "/metrics").
    #[serde(default = "default_path")]
    pub path: String,

    /// Namespace token prepended to derived metric names (default: none).
    #[serde(default)]
    pub prefix: String,
}

fn default_port() -> u16 {
    9090
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_path() -> String {
    "/metrics".to_string()
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            path: default_path(),
            prefix: String::new(),
        }
    }
}

impl PrometheusConfig {
    /// Socket address the HTTP server listens on.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self.bind.parse().map_err(|_| {
            ConfigError::Validation(format!("Invalid bind address: {}", self.bind))
        })?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// One `export` entry: a topic pattern and how to turn its messages into a metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Subscription {
    /// Topic pattern using `+name` and `#` wildcards.
    pub subscribe: String,

    /// Metric kind (default: gauge).
    #[serde(default)]
    pub metric_type: MetricKind,

    /// Explicit metric name; derived from the topic when absent.
    #[serde(default)]
    pub metric_name: Option<String>,

    /// Regex with one capture group isolating the value.
    #[serde(default)]
    pub value_regex: Option<String>,

    /// JSON path (`.a.b[0]`) isolating the value from a JSON payload.
    #[serde(default)]
    pub value_json: Option<String>,

    /// Static labels: a literal value, or `payload` for the message text.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Allowed states, required for enum metrics.
    #[serde(default)]
    pub enum_states: Vec<String>,

    /// Label carrying the payload of an info metric (default: "value").
    #[serde(default)]
    pub info_name: Option<String>,
}

impl Subscription {
    /// A gauge subscription for `pattern` with every option unset.
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            subscribe: pattern.into(),
            metric_type: MetricKind::Gauge,
            metric_name: None,
            value_regex: None,
            value_json: None,
            labels: BTreeMap::new(),
            enum_states: Vec::new(),
            info_name: None,
        }
    }
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            log_level: mqtt_exporter_common::config::default_log_level(),
            log_format: LogFormat::default(),
            mqtt: MqttConfig::default(),
            prometheus: PrometheusConfig::default(),
            export: Vec::new(),
        }
    }
}

impl ExporterConfig {
    /// Load configuration from a YAML or JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: ExporterConfig = mqtt_exporter_common::load_config(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a string.
    pub fn parse(content: &str, format: ConfigFormat) -> Result<Self, ConfigError> {
        let config: ExporterConfig = mqtt_exporter_common::parse_config(content, format)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.mqtt
            .validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;

        if self.prometheus.port == 0 {
            return Err(ConfigError::Validation(
                "prometheus.port must be > 0".to_string(),
            ));
        }

        self.prometheus.listen_addr()?;

        if !self.prometheus.path.starts_with('/') {
            return Err(ConfigError::Validation(
                "Metrics path must start with /".to_string(),
            ));
        }

        Ok(())
    }

    /// Compile the `export` declarations into matchable rules.
    pub fn compile_rules(&self) -> Result<RuleSet, ConfigError> {
        Ok(compile(&self.export, &self.prometheus.prefix)?)
    }

    /// Logging settings for [`mqtt_exporter_common::init_tracing`].
    pub fn logging(&self) -> LoggingConfig {
        LoggingConfig {
            level: self.log_level.clone(),
            format: self.log_format,
        }
    }
}
