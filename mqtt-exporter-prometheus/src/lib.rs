//! Prometheus exporter for MQTT topics.
//!
//! This crate subscribes to an MQTT broker, turns the messages on configured
//! topics into gauge, counter, enum and info metrics, and exposes them via an HTTP
//! `/metrics` endpoint.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │   MQTT Broker   │────>│     Ingest      │────>│   HTTP Server   │
//! │ (export topics) │     │ (rules→registry)│     │   (/metrics)    │
//! └─────────────────┘     └─────────────────┘     └─────────────────┘
//! ```
//!
//! Each `export` entry compiles into a [`rule::Rule`]. An incoming message is
//! matched against every rule ([`matcher`]), its value is extracted
//! ([`extract`]) and the resulting update is applied to the
//! [`registry::MetricRegistry`].
//!
//! # Usage
//!
//! ```bash
//! mqtt-exporter-prometheus --config config.yaml
//! ```
//!
//! # Configuration
//!
//! See [`config::ExporterConfig`] for configuration options.

pub mod config;
pub mod extract;
pub mod http;
pub mod ingest;
pub mod mapping;
pub mod matcher;
pub mod registry;
pub mod rule;
pub mod subscriber;

pub use config::{ConfigError, ExporterConfig, Subscription};
pub use extract::{ExtractionError, Observation};
pub use http::HttpServer;
pub use ingest::{IngestCoordinator, IngestReport, IngestStats, SharedIngest};
pub use mapping::MetricKind;
pub use registry::{MetricRegistry, RegistryError, SeriesKey, SeriesValue};
pub use rule::{Rule, RuleError, RuleSet};
pub use subscriber::MqttSubscriber;
