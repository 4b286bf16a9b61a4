//! Integration tests for mqtt-exporter-common library.

use std::io::Write;

use mqtt_exporter_common::{
    Error, LogFormat, LoggingConfig, MqttConfig, PatternSegment, load_config, parse_pattern,
    split_topic, to_filter,
};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct FileConfig {
    mqtt: MqttConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

fn write_temp(suffix: &str, content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("create temp file");
    file.write_all(content.as_bytes()).expect("write temp file");
    file
}

#[test]
fn test_load_yaml_file() {
    let file = write_temp(
        ".yaml",
        "mqtt:\n  host: mqtt.local\n  port: 1883\nlogging:\n  format: json\n",
    );

    let config: FileConfig = load_config(file.path()).expect("load yaml");

    assert_eq!(config.mqtt.host, "mqtt.local");
    assert_eq!(config.mqtt.port, 1883);
    assert_eq!(config.logging.format, LogFormat::Json);
}

#[test]
fn test_load_json5_file() {
    let file = write_temp(".json5", "{ mqtt: { host: 'broker', port: 8883 } }");

    let config: FileConfig = load_config(file.path()).expect("load json5");

    assert_eq!(config.mqtt.host, "broker");
    assert_eq!(config.mqtt.port, 8883);
    assert_eq!(config.logging.level, "info");
}

#[test]
fn test_load_missing_file() {
    let result: Result<FileConfig, Error> = load_config("/nonexistent/config.yaml");
    let err = result.unwrap_err();
    assert!(err.to_string().contains("Failed to read config file"));
}

#[test]
fn test_pattern_to_subscription_filter() {
    let pattern = parse_pattern("bitlair/climate/+location/#").expect("parse");

    assert_eq!(
        pattern,
        vec![
            PatternSegment::Literal("bitlair".to_string()),
            PatternSegment::Literal("climate".to_string()),
            PatternSegment::Single("location".to_string()),
            PatternSegment::Multi,
        ]
    );
    assert_eq!(to_filter(&pattern), "bitlair/climate/+/#");
    assert_eq!(
        split_topic("bitlair/climate/Hoofdruimte/temperature").len(),
        4
    );
}
