//! Naming rules shared by the rule compiler, the matcher and the registry.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Sanitize a metric name to be Prometheus-compatible.
///
/// Prometheus metric names must match `[a-zA-Z_:][a-zA-Z0-9_:]*`.
/// This function:
/// - Replaces invalid characters with underscores
/// - Ensures the name starts with a letter or underscore
/// - Collapses multiple underscores into one
pub fn sanitize_metric_name(name: &str) -> String {
    let mut result = String::with_capacity(name.len() + 1);
    let mut last_was_underscore = false;
    let mut chars = name.chars().peekable();

    // A leading digit is kept behind an underscore
    if let Some(&first) = chars.peek()
        && first.is_ascii_digit()
    {
        result.push('_');
        last_was_underscore = true;
    }

    for c in chars {
        let is_valid_char = c.is_ascii_alphanumeric() || c == '_' || c == ':';

        if is_valid_char {
            if c == '_' {
                if !last_was_underscore {
                    result.push(c);
                    last_was_underscore = true;
                }
            } else {
                result.push(c);
                last_was_underscore = false;
            }
        } else if !last_was_underscore {
            result.push('_');
            last_was_underscore = true;
        }
    }

    while result.ends_with('_') {
        result.pop();
    }

    if result.is_empty() {
        result.push_str("unnamed");
    }

    result
}

/// Check a metric name against `[a-zA-Z_:][a-zA-Z0-9_:]*`.
pub fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

/// Check a label name against `[a-zA-Z_][a-zA-Z0-9_]*`.
///
/// Names starting with `__` are reserved by Prometheus and rejected.
pub fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    !name.starts_with("__") && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Build a metric name from the topic levels that are not bound to labels.
///
/// Levels are joined with `_`, dashes become underscores and the result is
/// lowercased, then prefixed with `prefix` (when non-empty) and sanitized.
pub fn derive_metric_name<'a>(prefix: &str, levels: impl IntoIterator<Item = &'a str>) -> String {
    let joined = levels
        .into_iter()
        .collect::<Vec<_>>()
        .join("_")
        .replace('-', "_")
        .to_lowercase();

    if prefix.is_empty() {
        sanitize_metric_name(&joined)
    } else {
        sanitize_metric_name(&format!("{}_{}", prefix, joined))
    }
}

/// Label set of a series, ordered by label name.
pub type Labels = BTreeMap<String, String>;

/// Name of the label that carries an enum's state.
///
/// Follows the Prometheus client convention of reusing the metric name.
pub fn enum_state_label(metric_name: &str) -> String {
    metric_name.replace(':', "_")
}

/// Prefix of the exporter's own metrics; user metrics may not use it.
pub const RESERVED_PREFIX: &str = "mqtt_exporter_";

/// Whether an exposed name falls in the exporter's own namespace.
pub fn is_reserved_name(exposed: &str) -> bool {
    exposed.starts_with(RESERVED_PREFIX)
}

/// Name under which a family's samples are exposed.
///
/// Counter samples carry the conventional `_total` suffix and info samples
/// `_info`. Families are stored under this name, so `hits` and `hits_total`
/// counters are the same family.
pub fn exposition_name(name: &str, kind: MetricKind) -> String {
    let suffix = match kind {
        MetricKind::Counter => "_total",
        MetricKind::Info => "_info",
        MetricKind::Gauge | MetricKind::Enum => return name.to_string(),
    };
    if name.ends_with(suffix) {
        name.to_string()
    } else {
        format!("{}{}", name, suffix)
    }
}

/// The kind of Prometheus metric a rule feeds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    #[default]
    Gauge,
    Counter,
    Enum,
    /// Constant 1 carrying the payload text in a label.
    Info,
}

impl MetricKind {
    /// Configuration name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Gauge => "gauge",
            MetricKind::Counter => "counter",
            MetricKind::Enum => "enum",
            MetricKind::Info => "info",
        }
    }

    /// Get the TYPE comment string for Prometheus exposition format.
    ///
    /// Enums are exposed as one 0/1 gauge per state, info metrics as a gauge
    /// fixed at 1; the text format has no type of its own for either.
    pub fn exposition_type(&self) -> &'static str {
        match self {
            MetricKind::Gauge | MetricKind::Enum | MetricKind::Info => "gauge",
            MetricKind::Counter => "counter",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
